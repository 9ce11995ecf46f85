//! Presence roster: who is online in the room and where their cursors are.
//!
//! DESIGN
//! ======
//! Presence is ephemeral. The roster is rebuilt wholesale from every `sync`
//! event, patched by `join`, and trimmed immediately by `leave` (no grace
//! period). Entries tagged with another room are ignored. Nothing here is
//! persisted or touches the shape registry.

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;

use std::collections::{BTreeSet, HashMap};

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shape::{ActorId, RoomId};

/// Cursor colors handed out to actors that did not pick one.
pub const PALETTE: [&str; 8] = ["#e03131", "#2f9e44", "#1971c2", "#f08c00", "#9c36b5", "#0c8599", "#e8590c", "#5c940d"];

/// The local editor's identity for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub actor_id: ActorId,
    pub display_name: String,
    pub color: String,
}

impl Identity {
    /// Fresh actor id with a palette color chosen at random.
    #[must_use]
    pub fn new(display_name: impl Into<String>) -> Self {
        let idx = rand::rng().random_range(0..PALETTE.len());
        Self { actor_id: Uuid::new_v4(), display_name: display_name.into(), color: PALETTE[idx].to_owned() }
    }

    #[must_use]
    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }
}

/// One tracked actor as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub id: ActorId,
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub color: String,
    #[serde(rename = "roomId")]
    pub room_id: RoomId,
    /// Last-seen wall-clock millis.
    pub last: i64,
}

impl PresenceState {
    #[must_use]
    pub fn new(identity: &Identity, room_id: RoomId, x: f64, y: f64) -> Self {
        Self {
            id: identity.actor_id,
            name: identity.display_name.clone(),
            x,
            y,
            color: identity.color.clone(),
            room_id,
            last: frames::now_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Full snapshot of everyone currently tracked on the channel.
    Sync(Vec<PresenceState>),
    Join(PresenceState),
    Leave(ActorId),
}

/// Projection of a presence entry used for drawing remote cursors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cursor {
    pub x: f64,
    pub y: f64,
    pub color: String,
    pub name: String,
}

impl From<&PresenceState> for Cursor {
    fn from(state: &PresenceState) -> Self {
        Self { x: state.x, y: state.y, color: state.color.clone(), name: state.name.clone() }
    }
}

/// Online roster and cursor map for one room.
#[derive(Debug, Clone)]
pub struct PresenceRoster {
    room_id: RoomId,
    online: BTreeSet<ActorId>,
    cursors: HashMap<ActorId, Cursor>,
}

impl PresenceRoster {
    #[must_use]
    pub fn new(room_id: RoomId) -> Self {
        Self { room_id, online: BTreeSet::new(), cursors: HashMap::new() }
    }

    #[must_use]
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn apply(&mut self, event: &PresenceEvent) {
        match event {
            PresenceEvent::Sync(states) => {
                self.online.clear();
                self.cursors.clear();
                let room_id = self.room_id;
                for state in states.iter().filter(|s| s.room_id == room_id) {
                    self.insert(state);
                }
            }
            PresenceEvent::Join(state) => {
                if state.room_id == self.room_id {
                    self.insert(state);
                }
            }
            PresenceEvent::Leave(actor) => {
                self.online.remove(actor);
                self.cursors.remove(actor);
            }
        }
    }

    fn insert(&mut self, state: &PresenceState) {
        self.online.insert(state.id);
        self.cursors.insert(state.id, Cursor::from(state));
    }

    /// Forget everyone; used on room switch.
    pub fn clear(&mut self) {
        self.online.clear();
        self.cursors.clear();
    }

    /// Online actors in stable order.
    #[must_use]
    pub fn online(&self) -> Vec<ActorId> {
        self.online.iter().copied().collect()
    }

    #[must_use]
    pub fn cursors(&self) -> &HashMap<ActorId, Cursor> {
        &self.cursors
    }

    #[must_use]
    pub fn is_online(&self, actor: &ActorId) -> bool {
        self.online.contains(actor)
    }
}
