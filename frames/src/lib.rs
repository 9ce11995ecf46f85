//! Room-channel frame model and protobuf codec.
//!
//! This crate owns the wire representation shared by replicas, the relay,
//! and the CLI. Every message on a room channel is a [`Frame`]: requests
//! from a replica (`shape:upsert`, `presence:track`, ...), acknowledgements
//! from the relay (`done` / `error`), and relayed broadcasts.
//!
//! Payloads stay flexible (`serde_json::Value` per key) while the envelope
//! is encoded as protobuf for compact binary transport.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// =============================================================================
// SYSCALLS
// =============================================================================

/// Subscribe the connection to a room channel.
pub const CHANNEL_JOIN: &str = "channel:join";
/// Unsubscribe the connection from its room channel.
pub const CHANNEL_LEAVE: &str = "channel:leave";
/// Liveness probe; acknowledged with `done`.
pub const CHANNEL_PING: &str = "channel:ping";
/// Broadcast of one shape record or an array of them.
pub const SHAPE_UPSERT: &str = "shape:upsert";
/// Broadcast of an array of shape ids.
pub const SHAPE_REMOVE: &str = "shape:remove";
/// Announce or refresh the sender's presence entry.
pub const PRESENCE_TRACK: &str = "presence:track";
/// Withdraw the sender's presence entry.
pub const PRESENCE_UNTRACK: &str = "presence:untrack";
/// Full roster snapshot for a room.
pub const PRESENCE_SYNC: &str = "presence:sync";
/// A single presence entry appeared or changed.
pub const PRESENCE_JOIN: &str = "presence:join";
/// A presence entry went away.
pub const PRESENCE_LEAVE: &str = "presence:leave";

// =============================================================================
// DATA KEYS
// =============================================================================

/// Key carrying broadcast payloads (`shape:*`).
pub const KEY_PAYLOAD: &str = "payload";
/// Key carrying one presence entry.
pub const KEY_PRESENCE: &str = "presence";
/// Key carrying a list of presence entries.
pub const KEY_PRESENCES: &str = "presences";
/// Key carrying an actor id.
pub const KEY_ACTOR_ID: &str = "actor_id";
/// Key for error messages.
pub const KEY_MESSAGE: &str = "message";
/// Key for grepable error codes.
pub const KEY_CODE: &str = "code";
/// Key for the retryable flag on error frames.
pub const KEY_RETRYABLE: &str = "retryable";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload.
pub type Data = HashMap<String, Value>;

/// Error returned by [`decode_frame`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The `status` integer on the wire does not map to a known [`Status`] variant.
    #[error("invalid frame status: {0}")]
    InvalidStatus(i32),
    /// A UUID-typed field did not parse.
    #[error("invalid uuid in `{field}`: {value}")]
    InvalidUuid { field: &'static str, value: String },
}

/// Lifecycle position of a frame.
///
/// Replicas send `request`; the relay answers with `done` or `error`.
/// Relayed broadcasts and presence notifications are plain `request` frames
/// with no `parent_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Request,
    Done,
    Error,
}

impl Status {
    /// Convert status into wire enum integer value.
    #[must_use]
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Request => WireFrameStatus::Request as i32,
            Self::Done => WireFrameStatus::Done as i32,
            Self::Error => WireFrameStatus::Error as i32,
        }
    }

    fn from_i32(value: i32) -> Result<Self, CodecError> {
        match WireFrameStatus::try_from(value) {
            Ok(WireFrameStatus::Request) => Ok(Self::Request),
            Ok(WireFrameStatus::Done) => Ok(Self::Done),
            Ok(WireFrameStatus::Error) => Ok(Self::Error),
            Err(_) => Err(CodecError::InvalidStatus(value)),
        }
    }

    /// Whether this status ends a request exchange.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// A single message on a room channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    /// Request this frame answers, if any.
    pub parent_id: Option<Uuid>,
    /// Milliseconds since the Unix epoch when the frame was created.
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    /// Originating actor, stamped by the relay on relayed frames.
    pub from: Option<Uuid>,
    /// Namespaced operation name, e.g. `"shape:upsert"`.
    pub syscall: String,
    pub status: Status,
    pub data: Data,
}

/// Grepable error code and retryable flag for structured error frames.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl Frame {
    /// Create a request frame.
    pub fn request(syscall: impl Into<String>, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: None,
            ts: now_ms(),
            room_id: None,
            from: None,
            syscall: syscall.into(),
            status: Status::Request,
            data,
        }
    }

    /// Acknowledge this request with an empty `done`.
    #[must_use]
    pub fn done(&self) -> Self {
        self.reply(Status::Done, Data::new())
    }

    /// Acknowledge this request with a `done` carrying data.
    #[must_use]
    pub fn done_with(&self, data: Data) -> Self {
        self.reply(Status::Done, data)
    }

    /// Reject this request with a plain message.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> Self {
        let mut data = Data::new();
        data.insert(KEY_MESSAGE.into(), Value::String(message.into()));
        self.reply(Status::Error, data)
    }

    /// Reject this request with a typed error.
    #[must_use]
    pub fn error_from(&self, err: &(impl ErrorCode + ?Sized)) -> Self {
        let mut data = Data::new();
        data.insert(KEY_CODE.into(), Value::String(err.error_code().to_string()));
        data.insert(KEY_MESSAGE.into(), Value::String(err.to_string()));
        data.insert(KEY_RETRYABLE.into(), Value::Bool(err.retryable()));
        self.reply(Status::Error, data)
    }

    fn reply(&self, status: Status, data: Data) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id: Some(self.id),
            ts: now_ms(),
            room_id: self.room_id,
            from: None,
            syscall: self.syscall.clone(),
            status,
            data,
        }
    }

    #[must_use]
    pub fn with_room_id(mut self, room_id: Uuid) -> Self {
        self.room_id = Some(room_id);
        self
    }

    #[must_use]
    pub fn with_from(mut self, from: Uuid) -> Self {
        self.from = Some(from);
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Syscall prefix (everything before the first ':').
    #[must_use]
    pub fn prefix(&self) -> &str {
        let Some((prefix, _)) = self.syscall.split_once(':') else {
            return &self.syscall;
        };
        prefix
    }

    /// Error code and message of an `error` frame.
    #[must_use]
    pub fn error_parts(&self) -> (&str, &str) {
        let code = self
            .data
            .get(KEY_CODE)
            .and_then(Value::as_str)
            .unwrap_or("-");
        let message = self
            .data
            .get(KEY_MESSAGE)
            .and_then(Value::as_str)
            .unwrap_or("-");
        (code, message)
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = frame_to_wire(frame);

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec cannot hit `BufferTooSmall`.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes,
/// [`CodecError::InvalidStatus`] for out-of-range status values, and
/// [`CodecError::InvalidUuid`] when an id field is not a UUID.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    wire_to_frame(wire)
}

fn frame_to_wire(frame: &Frame) -> WireFrame {
    WireFrame {
        id: frame.id.to_string(),
        parent_id: frame.parent_id.map(|id| id.to_string()),
        ts: frame.ts,
        room_id: frame.room_id.map(|id| id.to_string()),
        from: frame.from.map(|id| id.to_string()),
        syscall: frame.syscall.clone(),
        status: frame.status.as_i32(),
        data: Some(prost_types::Struct {
            fields: frame
                .data
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    }
}

fn wire_to_frame(wire: WireFrame) -> Result<Frame, CodecError> {
    Ok(Frame {
        id: parse_uuid("id", &wire.id)?,
        parent_id: wire
            .parent_id
            .as_deref()
            .map(|s| parse_uuid("parent_id", s))
            .transpose()?,
        ts: wire.ts,
        room_id: wire
            .room_id
            .as_deref()
            .map(|s| parse_uuid("room_id", s))
            .transpose()?,
        from: wire
            .from
            .as_deref()
            .map(|s| parse_uuid("from", s))
            .transpose()?,
        syscall: wire.syscall,
        status: Status::from_i32(wire.status)?,
        data: wire
            .data
            .map(|s| {
                s.fields
                    .iter()
                    .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid, CodecError> {
    value
        .parse()
        .map_err(|_| CodecError::InvalidUuid { field, value: value.to_owned() })
}

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    use prost_types::value::Kind;

    let kind = match value {
        Value::Null => Kind::NullValue(prost_types::NullValue::NullValue as i32),
        Value::Bool(v) => Kind::BoolValue(*v),
        Value::Number(v) => Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => Kind::StringValue(v.clone()),
        Value::Array(v) => Kind::ListValue(prost_types::ListValue { values: v.iter().map(json_to_proto_value).collect() }),
        Value::Object(v) => Kind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

/// Whole numbers come back as integers so ids, timestamps, and z-indexes
/// survive the `f64` hop through `prost_types::Value`.
fn proto_to_json_value(value: &prost_types::Value) -> Value {
    use prost_types::value::Kind;

    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        Kind::NullValue(_) => Value::Null,
        Kind::NumberValue(v) => number_to_json(*v),
        Kind::StringValue(v) => Value::String(v.clone()),
        Kind::BoolValue(v) => Value::Bool(*v),
        Kind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect(),
        ),
        Kind::ListValue(v) => Value::Array(v.values.iter().map(proto_to_json_value).collect()),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::float_cmp)]
fn number_to_json(v: f64) -> Value {
    // 2^53: beyond this f64 no longer represents every integer.
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;
    if v.fract() == 0.0 && v.abs() <= MAX_EXACT {
        return Value::from(v as i64);
    }
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, optional, tag = "2")]
    parent_id: Option<String>,
    #[prost(int64, tag = "3")]
    ts: i64,
    #[prost(string, optional, tag = "4")]
    room_id: Option<String>,
    #[prost(string, optional, tag = "5")]
    from: Option<String>,
    #[prost(string, tag = "6")]
    syscall: String,
    #[prost(enumeration = "WireFrameStatus", tag = "7")]
    status: i32,
    #[prost(message, optional, tag = "8")]
    data: Option<prost_types::Struct>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireFrameStatus {
    Request = 0,
    Done = 1,
    Error = 2,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
