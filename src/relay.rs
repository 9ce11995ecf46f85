//! Relay: the room broker replicas connect to over WebSocket.
//!
//! DESIGN
//! ======
//! The relay has no merge logic and no shape state. It keeps, per room, the
//! connected clients and their tracked presence, and fans frames out:
//!
//! - `shape:*` requests are relayed to every other member of the sender's
//!   room (stamped with `from`) and acknowledged with `done`.
//! - `presence:track` stores the entry and emits `presence:join` followed by
//!   `presence:sync` to the whole room; untrack, leave, and disconnect emit
//!   `presence:leave` + `presence:sync`.
//! - `channel:join` moves the connection into a room, replies `done`, then
//!   sends that room's roster.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade at `/ws?actor=<uuid>`
//! 2. Frames → `process_frame` → replies to sender, broadcasts via peers' queues
//! 3. Close → part the current room
//!
//! ERROR HANDLING
//! ==============
//! Bad requests get structured `error` frames (`E_NOT_JOINED`,
//! `E_UNKNOWN_SYSCALL`, ...). Per-client queues are bounded; when a client
//! falls behind its frames are dropped, matching the transport's best-effort
//! contract.

#[cfg(test)]
#[path = "relay_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use frames::{Frame, Status};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::operation::Operation;
use crate::presence::PresenceState;
use crate::shape::{ActorId, RoomId};
use crate::transport::wire;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("join a room first")]
    NotJoined,
    #[error("channel:join requires room_id")]
    MissingRoom,
    #[error("unknown syscall: {0}")]
    UnknownSyscall(String),
    #[error("bad payload: {0}")]
    BadPayload(String),
}

impl frames::ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotJoined => "E_NOT_JOINED",
            Self::MissingRoom => "E_MISSING_ROOM",
            Self::UnknownSyscall(_) => "E_UNKNOWN_SYSCALL",
            Self::BadPayload(_) => "E_BAD_PAYLOAD",
        }
    }
}

struct Member {
    actor_id: ActorId,
    tx: mpsc::Sender<Frame>,
    presence: Option<PresenceState>,
}

#[derive(Default)]
struct Room {
    members: HashMap<Uuid, Member>,
}

impl Room {
    fn presences(&self) -> Vec<PresenceState> {
        let mut states: Vec<PresenceState> = self.members.values().filter_map(|m| m.presence.clone()).collect();
        states.sort_by_key(|s| s.id);
        states
    }

    fn broadcast(&self, frame: &Frame, exclude: Option<Uuid>) {
        for (conn_id, member) in &self.members {
            if exclude == Some(*conn_id) {
                continue;
            }
            // Best-effort: a full queue skips this client.
            if member.tx.try_send(frame.clone()).is_err() {
                debug!(%conn_id, syscall = %frame.syscall, "relay: client queue full; dropping frame");
            }
        }
    }

    fn announce_leave(&self, room_id: RoomId, actor_id: ActorId) {
        self.broadcast(&wire::presence_leave_frame(room_id, actor_id), None);
        self.broadcast(&wire::presence_sync_frame(room_id, &self.presences()), None);
    }
}

/// Shared relay state, injected into handlers via the `State` extractor.
#[derive(Clone)]
pub struct RelayState {
    rooms: Arc<RwLock<HashMap<RoomId, Room>>>,
    client_buffer: usize,
}

impl RelayState {
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self { rooms: Arc::new(RwLock::new(HashMap::new())), client_buffer: config.client_buffer.max(1) }
    }

    /// Connections currently in `room_id`.
    pub async fn member_count(&self, room_id: RoomId) -> usize {
        self.rooms.read().await.get(&room_id).map_or(0, |r| r.members.len())
    }

    /// Tracked presence entries in `room_id`.
    pub async fn presences(&self, room_id: RoomId) -> Vec<PresenceState> {
        self.rooms.read().await.get(&room_id).map(Room::presences).unwrap_or_default()
    }
}

/// One upgraded socket's view of its own membership.
pub(crate) struct Connection {
    pub(crate) conn_id: Uuid,
    pub(crate) actor_id: ActorId,
    pub(crate) tx: mpsc::Sender<Frame>,
    pub(crate) room_id: Option<RoomId>,
}

// =============================================================================
// ROUTER
// =============================================================================

pub fn app(state: RelayState) -> Router {
    Router::new()
        .route("/ws", get(handle_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the relay on an already-bound listener.
///
/// # Errors
///
/// Returns an error if the server fails while accepting connections.
pub async fn serve(listener: TcpListener, state: RelayState) -> std::io::Result<()> {
    axum::serve(listener, app(state)).await
}

async fn healthz() -> &'static str {
    "ok"
}

async fn handle_ws(
    State(state): State<RelayState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(actor) = params.get("actor") else {
        return (StatusCode::BAD_REQUEST, "actor required").into_response();
    };
    let Ok(actor_id) = Uuid::parse_str(actor) else {
        return (StatusCode::BAD_REQUEST, "actor must be a uuid").into_response();
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, actor_id))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: RelayState, actor_id: ActorId) {
    let (tx, mut rx) = mpsc::channel::<Frame>(state.client_buffer);
    let mut conn = Connection { conn_id: Uuid::new_v4(), actor_id, tx, room_id: None };
    info!(conn_id = %conn.conn_id, %actor_id, "relay: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Binary(bytes) => {
                        let replies = match frames::decode_frame(&bytes) {
                            Ok(req) => process_frame(&state, &mut conn, req).await,
                            Err(e) => {
                                warn!(conn_id = %conn.conn_id, error = %e, "relay: undecodable frame");
                                continue;
                            }
                        };
                        if !send_all(&mut socket, &replies).await {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(room_id) = conn.room_id.take() {
        part(&state, room_id, conn.conn_id).await;
    }
    info!(conn_id = %conn.conn_id, %actor_id, "relay: client disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    socket.send(Message::Binary(frames::encode_frame(frame).into())).await
}

async fn send_all(socket: &mut WebSocket, batch: &[Frame]) -> bool {
    for frame in batch {
        if send_frame(socket, frame).await.is_err() {
            return false;
        }
    }
    true
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Handle one request and return the frames owed to the sender.
pub(crate) async fn process_frame(state: &RelayState, conn: &mut Connection, mut req: Frame) -> Vec<Frame> {
    if req.status != Status::Request {
        return Vec::new();
    }
    req.from = Some(conn.actor_id);

    let is_presence = req.prefix() == "presence";
    if is_presence {
        debug!(conn_id = %conn.conn_id, syscall = %req.syscall, "relay: recv frame");
    } else {
        info!(conn_id = %conn.conn_id, id = %req.id, syscall = %req.syscall, "relay: recv frame");
    }

    let result = match req.syscall.as_str() {
        frames::CHANNEL_JOIN => handle_join(state, conn, &req).await,
        frames::CHANNEL_LEAVE => handle_leave(state, conn, &req).await,
        frames::CHANNEL_PING => Ok(vec![req.done()]),
        frames::SHAPE_UPSERT | frames::SHAPE_REMOVE => handle_broadcast(state, conn, &req).await,
        frames::PRESENCE_TRACK => handle_track(state, conn, &req).await,
        frames::PRESENCE_UNTRACK => handle_untrack(state, conn, &req).await,
        other => Err(RelayError::UnknownSyscall(other.to_owned())),
    };

    match result {
        Ok(frames) => frames,
        Err(e) => {
            warn!(conn_id = %conn.conn_id, syscall = %req.syscall, error = %e, "relay: request rejected");
            vec![req.error_from(&e)]
        }
    }
}

async fn handle_join(state: &RelayState, conn: &mut Connection, req: &Frame) -> Result<Vec<Frame>, RelayError> {
    let room_id = req.room_id.ok_or(RelayError::MissingRoom)?;
    if let Some(previous) = conn.room_id.take() {
        if previous != room_id {
            part(state, previous, conn.conn_id).await;
        }
    }

    let roster = {
        let mut rooms = state.rooms.write().await;
        let room = rooms.entry(room_id).or_default();
        room.members.entry(conn.conn_id).or_insert_with(|| Member {
            actor_id: conn.actor_id,
            tx: conn.tx.clone(),
            presence: None,
        });
        info!(%room_id, conn_id = %conn.conn_id, members = room.members.len(), "relay: joined room");
        room.presences()
    };
    conn.room_id = Some(room_id);

    Ok(vec![req.done(), wire::presence_sync_frame(room_id, &roster)])
}

async fn handle_leave(state: &RelayState, conn: &mut Connection, req: &Frame) -> Result<Vec<Frame>, RelayError> {
    let room_id = conn.room_id.take().ok_or(RelayError::NotJoined)?;
    part(state, room_id, conn.conn_id).await;
    Ok(vec![req.done()])
}

async fn handle_broadcast(state: &RelayState, conn: &Connection, req: &Frame) -> Result<Vec<Frame>, RelayError> {
    let room_id = conn.room_id.ok_or(RelayError::NotJoined)?;
    let payload = req.data.get(frames::KEY_PAYLOAD).cloned().unwrap_or_default();
    Operation::from_event(&req.syscall, payload).map_err(|e| RelayError::BadPayload(e.to_string()))?;

    let mut relayed = req.clone();
    relayed.id = Uuid::new_v4();
    relayed.room_id = Some(room_id);

    let rooms = state.rooms.read().await;
    if let Some(room) = rooms.get(&room_id) {
        room.broadcast(&relayed, Some(conn.conn_id));
    }
    Ok(vec![req.done()])
}

async fn handle_track(state: &RelayState, conn: &Connection, req: &Frame) -> Result<Vec<Frame>, RelayError> {
    let room_id = conn.room_id.ok_or(RelayError::NotJoined)?;
    let mut presence =
        wire::tracked_presence(req).ok_or_else(|| RelayError::BadPayload("presence:track requires presence".into()))?;
    // The connection's identity and room win over whatever the client claims.
    presence.id = conn.actor_id;
    presence.room_id = room_id;
    presence.last = frames::now_ms();

    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(&room_id) else {
        return Err(RelayError::NotJoined);
    };
    let Some(member) = room.members.get_mut(&conn.conn_id) else {
        return Err(RelayError::NotJoined);
    };
    member.presence = Some(presence.clone());
    room.broadcast(&wire::presence_join_frame(&presence), None);
    room.broadcast(&wire::presence_sync_frame(room_id, &room.presences()), None);
    Ok(vec![req.done()])
}

async fn handle_untrack(state: &RelayState, conn: &Connection, req: &Frame) -> Result<Vec<Frame>, RelayError> {
    let room_id = conn.room_id.ok_or(RelayError::NotJoined)?;
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(&room_id) else {
        return Err(RelayError::NotJoined);
    };
    let had_presence = room
        .members
        .get_mut(&conn.conn_id)
        .and_then(|m| m.presence.take())
        .is_some();
    if had_presence {
        room.announce_leave(room_id, conn.actor_id);
    }
    Ok(vec![req.done()])
}

/// Remove a connection from a room, announcing its departure if it was
/// tracked. Empty rooms are evicted.
async fn part(state: &RelayState, room_id: RoomId, conn_id: Uuid) {
    let mut rooms = state.rooms.write().await;
    let Some(room) = rooms.get_mut(&room_id) else {
        return;
    };
    let Some(member) = room.members.remove(&conn_id) else {
        return;
    };
    info!(%room_id, %conn_id, remaining = room.members.len(), "relay: left room");

    if member.presence.is_some() {
        room.announce_leave(room_id, member.actor_id);
    }
    if room.members.is_empty() {
        rooms.remove(&room_id);
        debug!(%room_id, "relay: evicted empty room");
    }
}
