//! Sync transport: per-room publish/subscribe channels.
//!
//! DESIGN
//! ======
//! A `Transport` joins a room and returns a `Subscription`: a channel handle
//! for outbound traffic and a single `InboundReceiver` carrying every
//! inbound message (status transitions, remote operations, presence). One
//! typed union on one receiver replaces per-event listener registration.
//!
//! Delivery is best effort and unordered across publishes. Status
//! transitions are the exception and are never dropped. Transports never
//! retry; the offline queue owns retry for local sends and inbound loss is
//! not recovered.
//!
//! ERROR HANDLING
//! ==============
//! Channel faults surface as `Inbound::Status` transitions that degrade the
//! connection state. `TransportError` is returned from `publish` / `track`
//! so callers can enqueue or log; it is never shown to the user as a failed
//! edit.

pub mod memory;
pub mod wire;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::operation::{Operation, PayloadError};
use crate::presence::{PresenceEvent, PresenceState};
use crate::shape::{ActorId, RoomId};

pub use memory::{MemoryBroker, MemoryTransport};
pub use ws::WsTransport;

// =============================================================================
// STATUS
// =============================================================================

/// Replica-facing connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Online,
    Reconnecting,
    Offline,
}

impl ConnectionState {
    #[must_use]
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

/// Raw channel lifecycle signal reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    #[must_use]
    pub fn connection_state(self) -> ConnectionState {
        match self {
            Self::Subscribed => ConnectionState::Online,
            Self::ChannelError => ConnectionState::Offline,
            Self::TimedOut | Self::Closed => ConnectionState::Reconnecting,
        }
    }
}

// =============================================================================
// INBOUND
// =============================================================================

/// A broadcast operation received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOperation {
    /// Sending actor when the transport knows it.
    pub from: Option<ActorId>,
    pub operation: Operation,
}

/// Everything a subscription can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Status(ChannelStatus),
    Operation(RemoteOperation),
    Presence(PresenceEvent),
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel not connected")]
    NotConnected,
    #[error("timed out waiting for acknowledgement")]
    Timeout,
    #[error("channel closed")]
    Closed,
    #[error("rejected by relay: {code}: {message}")]
    Rejected { code: String, message: String },
    #[error(transparent)]
    Codec(#[from] frames::CodecError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("socket error: {0}")]
    Socket(String),
}

impl frames::ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotConnected => "E_NOT_CONNECTED",
            Self::Timeout => "E_TIMEOUT",
            Self::Closed => "E_CLOSED",
            Self::Rejected { .. } => "E_REJECTED",
            Self::Codec(_) => "E_CODEC",
            Self::Payload(_) => "E_PAYLOAD",
            Self::Socket(_) => "E_SOCKET",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Timeout | Self::Closed | Self::Socket(_))
    }
}

// =============================================================================
// TRAITS
// =============================================================================

/// Anything that can broadcast an operation to one room.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn room_id(&self) -> RoomId;

    /// Broadcast `operation` to the room. Resolves once the transport has
    /// accepted it; peers may still never see it.
    async fn publish(&self, operation: &Operation) -> Result<(), TransportError>;
}

/// A live subscription to one room.
#[async_trait]
pub trait Channel: Publisher {
    /// Announce or refresh the local actor's presence.
    async fn track(&self, state: &PresenceState) -> Result<(), TransportError>;

    /// Withdraw presence and stop delivery. Idempotent.
    async fn unsubscribe(&self);
}

/// Factory for room channels.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn join(&self, room_id: RoomId, actor_id: ActorId) -> Result<Subscription, TransportError>;
}

/// Handle pair returned by [`Transport::join`].
pub struct Subscription {
    pub channel: Arc<dyn Channel>,
    pub inbound: InboundReceiver,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("room_id", &self.channel.room_id())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// INBOUND QUEUE
// =============================================================================

/// Create the inbound queue pair for one subscription.
///
/// Broadcasts and presence share a bounded queue of `buffer` slots and are
/// dropped when it is full. Status transitions ride a separate unbounded
/// lane so a backed-up subscriber still sees every `Closed` / `Subscribed`.
pub(crate) fn inbound_channel(buffer: usize) -> (InboundSender, InboundReceiver) {
    let (status_tx, status_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(buffer.max(1));
    (
        InboundSender { status: status_tx, events: events_tx },
        InboundReceiver { status: status_rx, events: events_rx },
    )
}

/// Transport side of an inbound queue.
pub(crate) struct InboundSender {
    status: mpsc::UnboundedSender<ChannelStatus>,
    events: mpsc::Sender<Inbound>,
}

impl InboundSender {
    pub(crate) fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Subscriber side of an inbound queue. Pending status transitions are
/// handed out before queued broadcasts.
pub struct InboundReceiver {
    status: mpsc::UnboundedReceiver<ChannelStatus>,
    events: mpsc::Receiver<Inbound>,
}

impl InboundReceiver {
    /// Next message; `None` once the transport has gone away.
    pub async fn recv(&mut self) -> Option<Inbound> {
        tokio::select! {
            biased;
            Some(status) = self.status.recv() => Some(Inbound::Status(status)),
            event = self.events.recv() => event,
        }
    }

    /// Next message if one is already waiting.
    pub fn try_recv(&mut self) -> Option<Inbound> {
        if let Ok(status) = self.status.try_recv() {
            return Some(Inbound::Status(status));
        }
        if let Ok(event) = self.events.try_recv() {
            return Some(event);
        }
        None
    }
}

/// Deliver into an inbound queue. Status transitions are never dropped;
/// anything else is dropped when the queue is full. Returns `false` once the
/// subscriber is gone.
pub(crate) fn deliver(tx: &InboundSender, message: Inbound) -> bool {
    if let Inbound::Status(status) = message {
        return tx.status.send(status).is_ok();
    }
    match tx.events.try_send(message) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!("transport: inbound queue full; dropping message");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
