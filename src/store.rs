//! Replica store: the authoritative shape registry for the active room.
//!
//! DESIGN
//! ======
//! Local commands and remote broadcasts both mutate the registry through
//! `upsert` / `remove`, so there is exactly one write path. Both are
//! idempotent: re-applying an operation (queue replay, retransmission)
//! leaves the registry exactly as the first application did.
//!
//! `upsert` is a whole-record replace with no timestamp check; whichever
//! write is applied last wins on this replica. `remove` is unconditional and
//! remembers nothing, so a later `upsert` for the same id brings the shape
//! back.
//!
//! The store is owned by one task and never locked; concurrency across
//! machines is handled by the transport and the policy above.

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;

use std::collections::HashSet;

use crate::history::{History, HistorySnapshot, Registry, Selection};
use crate::operation::Operation;
use crate::shape::{ShapeId, ShapeRecord};

/// Read-only projection handed to the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreView {
    /// Shapes in draw order.
    pub shapes: Vec<ShapeRecord>,
    pub selection: Vec<ShapeId>,
    pub can_undo: bool,
    pub can_redo: bool,
}

/// In-memory registry, selection, and history for one room.
#[derive(Debug, Clone, Default)]
pub struct ReplicaStore {
    registry: Registry,
    selection: Selection,
    history: History,
}

impl ReplicaStore {
    #[must_use]
    pub fn new(history_depth: usize) -> Self {
        Self { registry: Registry::new(), selection: Selection::new(), history: History::new(history_depth) }
    }

    // =========================================================================
    // MUTATION
    // =========================================================================

    /// Insert or fully replace each record. Returns how many records were applied.
    pub fn upsert(&mut self, records: impl IntoIterator<Item = ShapeRecord>) -> usize {
        let mut applied = 0;
        for record in records {
            self.registry.insert(record.id, record);
            applied += 1;
        }
        applied
    }

    /// Delete each id that is present and drop it from the selection.
    /// Returns the records that were actually removed.
    pub fn remove(&mut self, ids: &[ShapeId]) -> Vec<ShapeRecord> {
        let mut removed = Vec::new();
        for id in ids {
            if let Some(record) = self.registry.remove(id) {
                removed.push(record);
            }
            self.selection.remove(id);
        }
        removed
    }

    /// Apply an operation through the matching entry point.
    pub fn apply(&mut self, operation: &Operation) {
        match operation {
            Operation::Upsert(records) => {
                self.upsert(records.iter().cloned());
            }
            Operation::Remove(ids) => {
                self.remove(ids);
            }
        }
    }

    /// Replace the selection.
    pub fn select(&mut self, ids: impl IntoIterator<Item = ShapeId>) {
        self.selection = ids.into_iter().collect();
    }

    /// Empty registry, selection, and history.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.selection.clear();
        self.history.clear();
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    /// Snapshot the current state onto the undo stack. Call before every
    /// locally initiated mutation.
    pub fn push_history(&mut self) {
        let snapshot = self.snapshot();
        self.history.push(snapshot);
    }

    /// Restore the previous snapshot. Local only: nothing is retracted from
    /// peers. Returns `false` when there is nothing to undo.
    pub fn undo(&mut self) -> bool {
        let current = self.snapshot();
        let Some(previous) = self.history.undo(current) else {
            return false;
        };
        self.restore(previous);
        true
    }

    /// Re-apply the most recently undone snapshot.
    pub fn redo(&mut self) -> bool {
        let current = self.snapshot();
        let Some(next) = self.history.redo(current) else {
            return false;
        };
        self.restore(next);
        true
    }

    fn restore(&mut self, snapshot: HistorySnapshot) {
        self.registry = snapshot.registry;
        self.selection = snapshot.selection;
    }

    #[must_use]
    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot { registry: self.registry.clone(), selection: self.selection.clone() }
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // =========================================================================
    // READ
    // =========================================================================

    #[must_use]
    pub fn get(&self, id: &ShapeId) -> Option<&ShapeRecord> {
        self.registry.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ShapeId) -> bool {
        self.registry.contains_key(id)
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// All shapes sorted by `(zIndex, id)` for draw order.
    #[must_use]
    pub fn sorted_shapes(&self) -> Vec<&ShapeRecord> {
        let mut shapes: Vec<&ShapeRecord> = self.registry.values().collect();
        shapes.sort_by_key(|s| s.draw_key());
        shapes
    }

    #[must_use]
    pub fn view(&self) -> StoreView {
        StoreView {
            shapes: self.sorted_shapes().into_iter().cloned().collect(),
            selection: self.selection.iter().copied().collect(),
            can_undo: self.can_undo(),
            can_redo: self.can_redo(),
        }
    }
}

/// Operations that turn `before` into `after`: one `Upsert` for added or
/// changed records, one `Remove` for ids that disappeared. Empty operations
/// are omitted.
#[must_use]
pub fn diff_registries(before: &Registry, after: &Registry) -> Vec<Operation> {
    let mut changed: Vec<ShapeRecord> = after
        .values()
        .filter(|rec| before.get(&rec.id) != Some(*rec))
        .cloned()
        .collect();
    changed.sort_by_key(ShapeRecord::draw_key);

    let after_ids: HashSet<&ShapeId> = after.keys().collect();
    let mut gone: Vec<ShapeId> = before
        .keys()
        .filter(|id| !after_ids.contains(id))
        .copied()
        .collect();
    gone.sort();

    let mut ops = Vec::new();
    if !changed.is_empty() {
        ops.push(Operation::Upsert(changed));
    }
    if !gone.is_empty() {
        ops.push(Operation::Remove(gone));
    }
    ops
}
