//! Advisory conflict notices.
//!
//! Remote writes always land (last delivered wins). When one touches a shape
//! the local actor has selected, the session emits a `Notice` so the UI can
//! show a toast. Notices never change the merge outcome.

#[cfg(test)]
#[path = "conflict_test.rs"]
mod tests;

use serde::Serialize;

use crate::history::Selection;
use crate::shape::{ActorId, ShapeId, ShapeRecord};

/// Capacity of the session's notice broadcast channel.
pub const NOTICE_BUFFER: usize = 64;

/// A user-facing, non-blocking conflict signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    SelectedShapeModified { shape_id: ShapeId, by: ActorId },
    /// `by` is absent when the remove arrived without a sender.
    SelectedShapeDeleted { shape_id: ShapeId, by: Option<ActorId> },
}

impl Notice {
    #[must_use]
    pub fn shape_id(&self) -> ShapeId {
        match self {
            Self::SelectedShapeModified { shape_id, .. } | Self::SelectedShapeDeleted { shape_id, .. } => *shape_id,
        }
    }
}

/// Notices for remote upserts that hit the local selection.
///
/// Records written by the local actor itself (echoes, replays) are ignored.
#[must_use]
pub fn notices_for_upsert(selection: &Selection, local_actor: ActorId, records: &[ShapeRecord]) -> Vec<Notice> {
    records
        .iter()
        .filter(|rec| selection.contains(&rec.id) && rec.updated_by != local_actor)
        .map(|rec| Notice::SelectedShapeModified { shape_id: rec.id, by: rec.updated_by })
        .collect()
}

/// Notices for a remote remove that hits the local selection.
#[must_use]
pub fn notices_for_remove(
    selection: &Selection,
    local_actor: ActorId,
    from: Option<ActorId>,
    ids: &[ShapeId],
) -> Vec<Notice> {
    if from == Some(local_actor) {
        return Vec::new();
    }
    ids.iter()
        .filter(|id| selection.contains(id))
        .map(|id| Notice::SelectedShapeDeleted { shape_id: *id, by: from })
        .collect()
}
