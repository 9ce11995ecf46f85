//! Shape records: the unit of replication.
//!
//! A `ShapeRecord` is always written whole. Geometry and style live in the
//! open-ended `attributes` bag, which this crate never interprets; the
//! renderer owns its meaning.

#[cfg(test)]
#[path = "shape_test.rs"]
mod tests;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a shape, scoped to a room.
pub type ShapeId = Uuid;

/// Unique identifier for an editor session.
pub type ActorId = Uuid;

/// Isolation scope for shapes, presence, and channel traffic.
pub type RoomId = Uuid;

/// The kind of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rect,
    Ellipse,
    Triangle,
    Diamond,
    Star,
    Line,
    Arrow,
    Text,
    Sticky,
    Frame,
    Image,
}

impl ShapeKind {
    /// Wire and storage name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rect => "rect",
            Self::Ellipse => "ellipse",
            Self::Triangle => "triangle",
            Self::Diamond => "diamond",
            Self::Star => "star",
            Self::Line => "line",
            Self::Arrow => "arrow",
            Self::Text => "text",
            Self::Sticky => "sticky",
            Self::Frame => "frame",
            Self::Image => "image",
        }
    }
}

impl std::fmt::Display for ShapeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ShapeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_owned())).map_err(|_| format!("unknown shape kind: {s}"))
    }
}

/// A shape as stored in the registry and carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub id: ShapeId,
    pub kind: ShapeKind,
    /// Position, size, style, text. Opaque to the sync engine.
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(rename = "groupId", default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    #[serde(rename = "zIndex", default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<i64>,
    /// Wall-clock millis of the write on the writer's machine.
    pub updated_at: i64,
    pub updated_by: ActorId,
}

impl ShapeRecord {
    /// Build a record for a fresh shape.
    #[must_use]
    pub fn new(kind: ShapeKind, attributes: serde_json::Value, actor: ActorId) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            attributes,
            group_id: None,
            z_index: None,
            updated_at: frames::now_ms(),
            updated_by: actor,
        }
    }

    /// Return a copy attributed to `actor` at `now`.
    #[must_use]
    pub fn stamped(mut self, actor: ActorId, now: i64) -> Self {
        self.updated_at = now;
        self.updated_by = actor;
        self
    }

    #[must_use]
    pub fn with_z_index(mut self, z_index: i64) -> Self {
        self.z_index = Some(z_index);
        self
    }

    #[must_use]
    pub fn with_group(mut self, group_id: Uuid) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// Draw-order key: `(zIndex, id)`, with a missing z-index treated as 0.
    #[must_use]
    pub fn draw_key(&self) -> (i64, ShapeId) {
        (self.z_index.unwrap_or(0), self.id)
    }
}
