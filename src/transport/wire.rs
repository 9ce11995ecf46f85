//! Mapping between room-channel frames and typed transport messages.
//!
//! Shared by the WebSocket transport, the relay, and the CLI so every party
//! agrees on where payloads live inside `Frame::data`.

#[cfg(test)]
#[path = "wire_test.rs"]
mod tests;

use frames::{Data, Frame, Status};
use serde_json::Value;
use uuid::Uuid;

use super::{Inbound, RemoteOperation, TransportError};
use crate::operation::Operation;
use crate::presence::{PresenceEvent, PresenceState};
use crate::shape::{ActorId, RoomId};

/// Request frame broadcasting `operation` to `room_id`.
#[must_use]
pub fn operation_frame(room_id: RoomId, operation: &Operation) -> Frame {
    let mut data = Data::new();
    data.insert(frames::KEY_PAYLOAD.into(), operation.to_payload());
    Frame::request(operation.event_name(), data).with_room_id(room_id)
}

/// Request frame subscribing the connection to `room_id`.
#[must_use]
pub fn join_frame(room_id: RoomId) -> Frame {
    Frame::request(frames::CHANNEL_JOIN, Data::new()).with_room_id(room_id)
}

#[must_use]
pub fn leave_frame(room_id: RoomId) -> Frame {
    Frame::request(frames::CHANNEL_LEAVE, Data::new()).with_room_id(room_id)
}

#[must_use]
pub fn track_frame(state: &PresenceState) -> Frame {
    let mut data = Data::new();
    data.insert(frames::KEY_PRESENCE.into(), presence_value(state));
    Frame::request(frames::PRESENCE_TRACK, data).with_room_id(state.room_id)
}

#[must_use]
pub fn presence_join_frame(state: &PresenceState) -> Frame {
    let mut data = Data::new();
    data.insert(frames::KEY_PRESENCE.into(), presence_value(state));
    Frame::request(frames::PRESENCE_JOIN, data).with_room_id(state.room_id)
}

#[must_use]
pub fn presence_leave_frame(room_id: RoomId, actor_id: ActorId) -> Frame {
    let mut data = Data::new();
    data.insert(frames::KEY_ACTOR_ID.into(), Value::String(actor_id.to_string()));
    Frame::request(frames::PRESENCE_LEAVE, data).with_room_id(room_id)
}

#[must_use]
pub fn presence_sync_frame(room_id: RoomId, states: &[PresenceState]) -> Frame {
    let mut data = Data::new();
    data.insert(frames::KEY_PRESENCES.into(), Value::Array(states.iter().map(presence_value).collect()));
    Frame::request(frames::PRESENCE_SYNC, data).with_room_id(room_id)
}

fn presence_value(state: &PresenceState) -> Value {
    serde_json::to_value(state).unwrap_or(Value::Null)
}

/// Decode a relayed frame into an inbound message.
///
/// Returns `Ok(None)` for frames that carry nothing for the subscriber
/// (acknowledgements, unknown syscalls).
///
/// # Errors
///
/// Returns `Payload` when a `shape:*` broadcast does not decode and `Socket`
/// for malformed presence payloads.
pub fn decode_inbound(frame: &Frame) -> Result<Option<Inbound>, TransportError> {
    if frame.status != Status::Request {
        return Ok(None);
    }
    match frame.syscall.as_str() {
        frames::SHAPE_UPSERT | frames::SHAPE_REMOVE => {
            let payload = frame.data.get(frames::KEY_PAYLOAD).cloned().unwrap_or(Value::Null);
            let operation = Operation::from_event(&frame.syscall, payload)?;
            Ok(Some(Inbound::Operation(RemoteOperation { from: frame.from, operation })))
        }
        frames::PRESENCE_SYNC => {
            let states = frame
                .data
                .get(frames::KEY_PRESENCES)
                .cloned()
                .map(serde_json::from_value::<Vec<PresenceState>>)
                .transpose()
                .map_err(|e| TransportError::Socket(format!("malformed presence sync: {e}")))?
                .unwrap_or_default();
            Ok(Some(Inbound::Presence(PresenceEvent::Sync(states))))
        }
        frames::PRESENCE_JOIN => {
            let state = frame
                .data
                .get(frames::KEY_PRESENCE)
                .cloned()
                .ok_or_else(|| TransportError::Socket("presence join without entry".into()))
                .and_then(|v| {
                    serde_json::from_value::<PresenceState>(v)
                        .map_err(|e| TransportError::Socket(format!("malformed presence join: {e}")))
                })?;
            Ok(Some(Inbound::Presence(PresenceEvent::Join(state))))
        }
        frames::PRESENCE_LEAVE => {
            let actor = frame
                .data
                .get(frames::KEY_ACTOR_ID)
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| TransportError::Socket("presence leave without actor id".into()))?;
            Ok(Some(Inbound::Presence(PresenceEvent::Leave(actor))))
        }
        _ => Ok(None),
    }
}

/// Parse a presence entry out of a `presence:track` request.
#[must_use]
pub fn tracked_presence(frame: &Frame) -> Option<PresenceState> {
    frame
        .data
        .get(frames::KEY_PRESENCE)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

/// Convert a relay `error` reply into a transport error.
#[must_use]
pub fn rejection(frame: &Frame) -> TransportError {
    let (code, message) = frame.error_parts();
    TransportError::Rejected { code: code.to_owned(), message: message.to_owned() }
}
