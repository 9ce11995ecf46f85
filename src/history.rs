//! Bounded linear undo/redo history of registry snapshots.
//!
//! Snapshots are whole copies of `{registry, selection}`. Pushing a new
//! snapshot clears the redo stack; when either stack exceeds the configured
//! depth, its oldest snapshot is dropped.

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::shape::{ShapeId, ShapeRecord};

pub type Registry = HashMap<ShapeId, ShapeRecord>;
pub type Selection = BTreeSet<ShapeId>;

/// Default number of snapshots retained per stack.
pub const DEFAULT_HISTORY_DEPTH: usize = 50;

/// Immutable copy of the replica state taken before a local command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistorySnapshot {
    pub registry: Registry,
    pub selection: Selection,
}

/// Undo and redo stacks.
#[derive(Debug, Clone)]
pub struct History {
    undo: VecDeque<HistorySnapshot>,
    redo: VecDeque<HistorySnapshot>,
    depth: usize,
}

impl History {
    /// Depth is clamped to at least one snapshot.
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self { undo: VecDeque::new(), redo: VecDeque::new(), depth: depth.max(1) }
    }

    /// Record the state about to be mutated. Invalidates redo.
    pub fn push(&mut self, snapshot: HistorySnapshot) {
        push_bounded(&mut self.undo, snapshot, self.depth);
        self.redo.clear();
    }

    /// Swap `current` for the most recent undo snapshot.
    ///
    /// Returns `None` (and keeps `current` untouched by the caller) when
    /// there is nothing to undo.
    pub fn undo(&mut self, current: HistorySnapshot) -> Option<HistorySnapshot> {
        let previous = self.undo.pop_back()?;
        push_bounded(&mut self.redo, current, self.depth);
        Some(previous)
    }

    /// Mirror of [`History::undo`].
    pub fn redo(&mut self, current: HistorySnapshot) -> Option<HistorySnapshot> {
        let next = self.redo.pop_back()?;
        push_bounded(&mut self.undo, current, self.depth);
        Some(next)
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    #[must_use]
    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    #[must_use]
    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_DEPTH)
    }
}

fn push_bounded(stack: &mut VecDeque<HistorySnapshot>, snapshot: HistorySnapshot, depth: usize) {
    stack.push_back(snapshot);
    while stack.len() > depth {
        stack.pop_front();
    }
}
