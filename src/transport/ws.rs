//! WebSocket transport speaking binary frames to the relay.
//!
//! DESIGN
//! ======
//! `join` returns immediately and spawns a supervisor task per subscription.
//! The supervisor connects, performs the `channel:join` handshake, reports
//! `Subscribed`, then runs a `select!` loop that forwards outbound frames
//! and routes inbound ones: replies resolve pending requests by `parent_id`,
//! everything else is decoded into `Inbound` messages.
//!
//! On connection loss the supervisor reports `Closed` (or `TimedOut` /
//! `ChannelError` for failed attempts), fails in-flight requests, and
//! reconnects with exponential backoff capped at the configured maximum.
//!
//! ERROR HANDLING
//! ==============
//! Publishes wait for the relay's `done` within `publish_timeout`. A missing
//! connection, a timeout, or a dropped socket become `TransportError`s for
//! the caller to enqueue; nothing is retried here.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use frames::{Frame, Status};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Channel, ChannelStatus, Inbound, InboundSender, Publisher, Subscription, Transport, TransportError, deliver,
    inbound_channel, wire,
};
use crate::config::SyncConfig;
use crate::operation::Operation;
use crate::presence::PresenceState;
use crate::shape::{ActorId, RoomId};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// TRANSPORT
// =============================================================================

/// [`Transport`] connecting to a relay at `ws://host:port/ws`.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    publish_timeout: Duration,
    reconnect_base: Duration,
    reconnect_max: Duration,
    inbound_buffer: usize,
}

impl WsTransport {
    #[must_use]
    pub fn new(url: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            url: url.into(),
            publish_timeout: config.publish_timeout,
            reconnect_base: config.reconnect_base,
            reconnect_max: config.reconnect_max.max(config.reconnect_base),
            inbound_buffer: config.inbound_buffer.max(1),
        }
    }

    fn actor_url(&self, actor_id: ActorId) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}actor={actor_id}", self.url)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn join(&self, room_id: RoomId, actor_id: ActorId) -> Result<Subscription, TransportError> {
        let (inbound_tx, inbound) = inbound_channel(self.inbound_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            room_id,
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            shutdown: shutdown_tx,
            publish_timeout: self.publish_timeout,
        });

        let supervisor = Supervisor {
            url: self.actor_url(actor_id),
            shared: Arc::clone(&shared),
            inbound: inbound_tx,
            shutdown: shutdown_rx,
            backoff_base: self.reconnect_base,
            backoff_max: self.reconnect_max,
            last_status: None,
            subscribed: false,
        };
        tokio::spawn(supervisor.run());
        info!(%room_id, %actor_id, url = %self.url, "ws: joining room");

        Ok(Subscription { channel: Arc::new(WsChannel { shared }), inbound })
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

struct Shared {
    room_id: RoomId,
    /// Writer for the live connection; `None` while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Frame>>>,
    shutdown: watch::Sender<bool>,
    publish_timeout: Duration,
}

impl Shared {
    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Frame>>> {
        self.outbound.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Frame>>> {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Send a request and wait for its terminal reply.
    async fn request(&self, frame: Frame) -> Result<Frame, TransportError> {
        let Some(writer) = self.outbound().clone() else {
            return Err(TransportError::NotConnected);
        };

        let (tx, rx) = oneshot::channel();
        let request_id = frame.id;
        self.pending().insert(request_id, tx);

        if writer.send(frame).is_err() {
            self.pending().remove(&request_id);
            return Err(TransportError::NotConnected);
        }

        let reply = match tokio::time::timeout(self.publish_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(TransportError::Closed),
            Err(_) => {
                self.pending().remove(&request_id);
                return Err(TransportError::Timeout);
            }
        };

        if reply.status == Status::Error {
            return Err(wire::rejection(&reply));
        }
        Ok(reply)
    }

    /// Resolve the pending request `frame` answers. Returns `false` when the
    /// frame is not a reply.
    fn resolve(&self, frame: &Frame) -> bool {
        let Some(parent_id) = frame.parent_id else {
            return false;
        };
        if !frame.status.is_terminal() {
            return false;
        }
        if let Some(tx) = self.pending().remove(&parent_id) {
            let _ = tx.send(frame.clone());
        }
        true
    }

    /// Drop every in-flight request; waiters observe `Closed`.
    fn fail_pending(&self) {
        let dropped = {
            let mut pending = self.pending();
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            debug!(count = dropped, "ws: failed in-flight requests");
        }
    }
}

struct WsChannel {
    shared: Arc<Shared>,
}

#[async_trait]
impl Publisher for WsChannel {
    fn room_id(&self) -> RoomId {
        self.shared.room_id
    }

    async fn publish(&self, operation: &Operation) -> Result<(), TransportError> {
        let frame = wire::operation_frame(self.shared.room_id, operation);
        self.shared.request(frame).await.map(|_| ())
    }
}

#[async_trait]
impl Channel for WsChannel {
    async fn track(&self, state: &PresenceState) -> Result<(), TransportError> {
        self.shared.request(wire::track_frame(state)).await.map(|_| ())
    }

    async fn unsubscribe(&self) {
        if *self.shared.shutdown.borrow() {
            return;
        }
        if let Some(writer) = self.shared.outbound().as_ref() {
            let _ = writer.send(wire::leave_frame(self.shared.room_id));
        }
        self.shared.shutdown.send_replace(true);
        info!(room_id = %self.shared.room_id, "ws: unsubscribed");
    }
}

// =============================================================================
// SUPERVISOR
// =============================================================================

/// How a connection attempt ended.
enum Exit {
    /// `unsubscribe` was called or the subscriber went away.
    Shutdown,
    /// The connection failed; report `status` and reconnect.
    Lost(ChannelStatus, TransportError),
}

struct Supervisor {
    url: String,
    shared: Arc<Shared>,
    inbound: InboundSender,
    shutdown: watch::Receiver<bool>,
    backoff_base: Duration,
    backoff_max: Duration,
    last_status: Option<ChannelStatus>,
    /// Set once the current attempt reached `Subscribed`; resets backoff.
    subscribed: bool,
}

impl Supervisor {
    async fn run(mut self) {
        let room_id = self.shared.room_id;
        let mut backoff = self.backoff_base;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.connect_once().await {
                Exit::Shutdown => break,
                Exit::Lost(status, err) => {
                    warn!(%room_id, error = %err, ?status, "ws: connection lost");
                    self.shared.outbound().take();
                    self.shared.fail_pending();
                    if !self.report(status) {
                        break;
                    }
                }
            }

            if std::mem::take(&mut self.subscribed) {
                backoff = self.backoff_base;
            }
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                () = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {}
            }
            backoff = (backoff * 2).min(self.backoff_max);
        }

        self.shared.outbound().take();
        self.shared.fail_pending();
        debug!(%room_id, "ws: supervisor stopped");
    }

    /// Emit a status transition; repeats are suppressed. Returns `false`
    /// once the subscriber has gone away.
    fn report(&mut self, status: ChannelStatus) -> bool {
        if self.last_status == Some(status) {
            return !self.inbound.is_closed();
        }
        if !deliver(&self.inbound, Inbound::Status(status)) {
            return false;
        }
        self.last_status = Some(status);
        true
    }

    async fn connect_once(&mut self) -> Exit {
        let timeout = self.shared.publish_timeout;
        let mut stream = match tokio::time::timeout(timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => return Exit::Lost(ChannelStatus::ChannelError, TransportError::Socket(e.to_string())),
            Err(_) => return Exit::Lost(ChannelStatus::TimedOut, TransportError::Timeout),
        };

        match tokio::time::timeout(timeout, handshake(&mut stream, self.shared.room_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Exit::Lost(ChannelStatus::ChannelError, e),
            Err(_) => return Exit::Lost(ChannelStatus::TimedOut, TransportError::Timeout),
        }

        let (writer, mut outbound) = mpsc::unbounded_channel::<Frame>();
        *self.shared.outbound() = Some(writer);
        self.subscribed = true;
        info!(room_id = %self.shared.room_id, "ws: subscribed");
        if !self.report(ChannelStatus::Subscribed) {
            return Exit::Shutdown;
        }

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Exit::Lost(ChannelStatus::Closed, TransportError::Closed);
                    };
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => return Exit::Lost(ChannelStatus::Closed, TransportError::Socket(e.to_string())),
                    };
                    match msg {
                        Message::Binary(bytes) => {
                            if !self.route(&bytes) {
                                return Exit::Shutdown;
                            }
                        }
                        Message::Close(_) => return Exit::Lost(ChannelStatus::Closed, TransportError::Closed),
                        _ => {}
                    }
                }
                Some(frame) = outbound.recv() => {
                    if let Err(e) = send_frame(&mut stream, &frame).await {
                        return Exit::Lost(ChannelStatus::Closed, e);
                    }
                }
                _ = self.shutdown.changed() => {
                    while let Ok(frame) = outbound.try_recv() {
                        let _ = send_frame(&mut stream, &frame).await;
                    }
                    let _ = stream.close(None).await;
                    return Exit::Shutdown;
                }
            }
        }
    }

    /// Route one inbound binary message. Returns `false` once the subscriber
    /// has gone away.
    fn route(&self, bytes: &[u8]) -> bool {
        let frame = match frames::decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "ws: undecodable frame");
                return true;
            }
        };
        if self.shared.resolve(&frame) {
            return true;
        }
        match wire::decode_inbound(&frame) {
            Ok(Some(message)) => deliver(&self.inbound, message),
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, syscall = %frame.syscall, "ws: dropping malformed broadcast");
                true
            }
        }
    }
}

/// Join the room and wait for the relay's acknowledgement.
async fn handshake(stream: &mut WsStream, room_id: RoomId) -> Result<(), TransportError> {
    let join = wire::join_frame(room_id);
    send_frame(stream, &join).await?;
    loop {
        let Some(msg) = stream.next().await else {
            return Err(TransportError::Closed);
        };
        let bytes = match msg.map_err(|e| TransportError::Socket(e.to_string()))? {
            Message::Binary(bytes) => bytes,
            Message::Close(_) => return Err(TransportError::Closed),
            _ => continue,
        };
        let frame = frames::decode_frame(&bytes)?;
        if frame.parent_id != Some(join.id) {
            continue;
        }
        if frame.status == Status::Error {
            return Err(wire::rejection(&frame));
        }
        return Ok(());
    }
}

async fn send_frame(stream: &mut WsStream, frame: &Frame) -> Result<(), TransportError> {
    stream
        .send(Message::Binary(frames::encode_frame(frame).into()))
        .await
        .map_err(|e| TransportError::Socket(e.to_string()))
}
