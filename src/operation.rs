//! Mutation operations and their broadcast payloads.
//!
//! DESIGN
//! ======
//! An `Operation` is what local commands, remote broadcasts, and queue
//! replay all hand to the replica store. `Upsert` carries whole records;
//! `Remove` carries bare ids with no timestamp.
//!
//! The upsert payload is one record or an array of them on the wire; the
//! remove payload is always an array of id strings.

#[cfg(test)]
#[path = "operation_test.rs"]
mod tests;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::shape::{ActorId, RoomId, ShapeId, ShapeRecord};

/// Error decoding a broadcast payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("unknown broadcast event: {0}")]
    UnknownEvent(String),
    #[error("malformed {event} payload: {source}")]
    Malformed {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A mutation scoped to one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum Operation {
    Upsert(Vec<ShapeRecord>),
    Remove(Vec<ShapeId>),
}

/// One record or many, as accepted on the upsert wire payload.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Box<ShapeRecord>),
    Many(Vec<ShapeRecord>),
}

impl Operation {
    /// Broadcast event name for this operation.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Upsert(_) => frames::SHAPE_UPSERT,
            Self::Remove(_) => frames::SHAPE_REMOVE,
        }
    }

    /// Broadcast payload for this operation. A single-record upsert is sent
    /// as a bare record.
    #[must_use]
    pub fn to_payload(&self) -> Value {
        match self {
            Self::Upsert(records) if records.len() == 1 => serde_json::to_value(&records[0]).unwrap_or(Value::Null),
            Self::Upsert(records) => serde_json::to_value(records).unwrap_or(Value::Null),
            Self::Remove(ids) => Value::Array(ids.iter().map(|id| Value::String(id.to_string())).collect()),
        }
    }

    /// Decode a broadcast event back into an operation.
    ///
    /// # Errors
    ///
    /// Returns `UnknownEvent` for anything but `shape:upsert` / `shape:remove`
    /// and `Malformed` when the payload does not match the event.
    pub fn from_event(event: &str, payload: Value) -> Result<Self, PayloadError> {
        match event {
            frames::SHAPE_UPSERT => {
                let parsed = serde_json::from_value::<OneOrMany>(payload)
                    .map_err(|source| PayloadError::Malformed { event: frames::SHAPE_UPSERT, source })?;
                Ok(match parsed {
                    OneOrMany::One(record) => Self::Upsert(vec![*record]),
                    OneOrMany::Many(records) => Self::Upsert(records),
                })
            }
            frames::SHAPE_REMOVE => {
                let ids = serde_json::from_value::<Vec<ShapeId>>(payload)
                    .map_err(|source| PayloadError::Malformed { event: frames::SHAPE_REMOVE, source })?;
                Ok(Self::Remove(ids))
            }
            other => Err(PayloadError::UnknownEvent(other.to_owned())),
        }
    }

    /// Ids touched by this operation.
    #[must_use]
    pub fn ids(&self) -> Vec<ShapeId> {
        match self {
            Self::Upsert(records) => records.iter().map(|r| r.id).collect(),
            Self::Remove(ids) => ids.clone(),
        }
    }

    /// Number of records or ids carried.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Upsert(records) => records.len(),
            Self::Remove(ids) => ids.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An operation waiting for the transport to come back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Queue entry identity; distinct from any shape id.
    pub id: Uuid,
    pub operation: Operation,
    pub room_id: RoomId,
    pub actor_id: ActorId,
    pub enqueued_at: i64,
}

impl PendingOperation {
    #[must_use]
    pub fn new(operation: Operation, room_id: RoomId, actor_id: ActorId) -> Self {
        Self { id: Uuid::new_v4(), operation, room_id, actor_id, enqueued_at: frames::now_ms() }
    }
}
