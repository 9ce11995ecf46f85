//! Session: one replica's membership in one room.
//!
//! DESIGN
//! ======
//! A `Session` owns everything scoped to the room lifecycle: the single live
//! channel, the replica store, the presence roster, the write-behind buffer,
//! and the notice channel. Nothing here is process-global, so switching
//! rooms is `leave` followed by `join` and can never leave a stale channel
//! delivering into the new room.
//!
//! The session itself is driven by one task. Local commands (`mutate`,
//! `select`, `undo`, `redo`) and inbound messages (`handle`, `pump`) all
//! take `&mut self`, so the store needs no locking.
//!
//! Outbound traffic goes through a per-session outbox task that publishes
//! in command order:
//!
//! - online and nothing queued for the room: publish directly; a failed
//!   publish falls back to the offline queue and schedules a retry drain
//! - otherwise: enqueue, then drain if online
//!
//! Commands never wait on the network.
//!
//! LIFECYCLE
//! =========
//! 1. `join` → subscribe, spawn outbox (+ write-behind when a sink is set)
//! 2. `Subscribed` → queue online (auto-drain), presence announced after delay
//! 3. Loss → queue offline, local edits keep landing in the queue
//! 4. `leave` → settle outbox, unsubscribe, clear roster + store, flush sink

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::conflict::{NOTICE_BUFFER, Notice, notices_for_remove, notices_for_upsert};
use crate::history::Registry;
use crate::operation::Operation;
use crate::persistence::{PersistError, PersistenceSink, WriteBehind};
use crate::presence::{Cursor, Identity, PresenceRoster, PresenceState};
use crate::queue::{FileQueueStore, OfflineQueue};
use crate::shape::{ActorId, RoomId, ShapeId, ShapeRecord};
use crate::store::{ReplicaStore, diff_registries};
use crate::transport::{
    Channel, ChannelStatus, ConnectionState, Inbound, InboundReceiver, RemoteOperation, Subscription, Transport,
    TransportError,
};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("session closed")]
    Closed,
}

impl frames::ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.error_code(),
            Self::Persist(e) => e.error_code(),
            Self::Closed => "E_SESSION_CLOSED",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.retryable(),
            Self::Persist(e) => e.retryable(),
            Self::Closed => false,
        }
    }
}

/// Everything needed to join a room.
pub struct SessionOptions {
    pub identity: Identity,
    pub room_id: RoomId,
    pub config: SyncConfig,
    /// Shared across sessions so operations queued in one room survive a switch.
    pub queue: OfflineQueue,
    pub sink: Option<Arc<dyn PersistenceSink>>,
}

impl SessionOptions {
    /// Default config and an in-memory queue.
    #[must_use]
    pub fn new(identity: Identity, room_id: RoomId) -> Self {
        Self { identity, room_id, config: SyncConfig::default(), queue: OfflineQueue::in_memory(), sink: None }
    }

    /// Options built from `config`; the queue is file-backed when
    /// `config.queue_path` is set.
    #[must_use]
    pub fn from_config(identity: Identity, room_id: RoomId, config: SyncConfig) -> Self {
        let queue = match &config.queue_path {
            Some(path) => OfflineQueue::new(FileQueueStore::new(path)),
            None => OfflineQueue::in_memory(),
        };
        Self { identity, room_id, config, queue, sink: None }
    }

    #[must_use]
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: OfflineQueue) -> Self {
        self.queue = queue;
        self
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Snapshot handed to the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionView {
    /// Shapes in draw order.
    pub shapes: Vec<ShapeRecord>,
    pub selection: Vec<ShapeId>,
    pub connection_state: ConnectionState,
    pub is_syncing: bool,
    /// Operations waiting in the offline queue for this room.
    pub queued: usize,
    pub can_undo: bool,
    pub can_redo: bool,
    /// Tracked actors, local actor included.
    pub online: Vec<ActorId>,
    /// Remote cursors; the local actor is omitted.
    pub cursors: HashMap<ActorId, Cursor>,
}

// =============================================================================
// OUTBOX
// =============================================================================

enum Outbound {
    Publish(Operation),
    Drain,
    Cursor { x: f64, y: f64 },
    Announce,
    Settle(oneshot::Sender<()>),
}

/// Sole publisher for a session; processes outbound work strictly in order.
struct Outbox {
    channel: Arc<dyn Channel>,
    queue: OfflineQueue,
    actor_id: ActorId,
    presence: PresenceState,
    retry_delay: Duration,
    /// Armed when a send failed while the queue still reads online.
    retry_at: Option<tokio::time::Instant>,
}

impl Outbox {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => msg,
                () = retry_timer(self.retry_at) => {
                    self.retry_at = None;
                    if self.queue.is_online() {
                        self.drain().await;
                    }
                    continue;
                }
            };
            let Some(msg) = msg else {
                break;
            };
            match msg {
                Outbound::Publish(operation) => self.dispatch(operation).await,
                Outbound::Drain => self.drain().await,
                Outbound::Cursor { x, y } => {
                    self.presence.x = x;
                    self.presence.y = y;
                    if self.queue.is_online() {
                        self.track().await;
                    }
                }
                Outbound::Announce => self.track().await,
                Outbound::Settle(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(room_id = %self.channel.room_id(), "session: outbox closed");
    }

    async fn dispatch(&mut self, operation: Operation) {
        let room_id = self.channel.room_id();
        if self.queue.is_online() && self.queue.len_for_room(room_id) == 0 {
            let Err(e) = self.channel.publish(&operation).await else {
                return;
            };
            warn!(%room_id, error = %e, kind = operation.event_name(), "session: publish failed; queueing");
            self.queue.queue_operation(operation, room_id, self.actor_id);
            self.arm_retry();
            return;
        }

        // EDGE: earlier operations are still queued; publishing now would overtake them.
        self.queue.queue_operation(operation, room_id, self.actor_id);
        if self.queue.is_online() {
            self.drain().await;
        }
    }

    async fn drain(&mut self) {
        let room_id = self.channel.room_id();
        if let Err(e) = self.queue.sync_queue(self.channel.as_ref()).await {
            warn!(%room_id, error = %e, remaining = self.queue.len_for_room(room_id), "session: queue drain interrupted");
            self.arm_retry();
        }
    }

    /// Schedule a drain for sends that failed on a channel still reporting
    /// online. Offline queues wait for the next `Subscribed` instead.
    fn arm_retry(&mut self) {
        if self.retry_at.is_none() && self.queue.is_online() {
            self.retry_at = Some(tokio::time::Instant::now() + self.retry_delay);
        }
    }

    async fn track(&mut self) {
        self.presence.last = frames::now_ms();
        if let Err(e) = self.channel.track(&self.presence).await {
            warn!(room_id = %self.channel.room_id(), error = %e, "session: presence track failed");
        }
    }
}

async fn retry_timer(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// SESSION
// =============================================================================

pub struct Session {
    identity: Identity,
    room_id: RoomId,
    config: SyncConfig,
    sink: Option<Arc<dyn PersistenceSink>>,
    channel: Arc<dyn Channel>,
    inbound: InboundReceiver,
    outbox: mpsc::UnboundedSender<Outbound>,
    store: ReplicaStore,
    roster: PresenceRoster,
    queue: OfflineQueue,
    write_behind: Option<WriteBehind>,
    notices: broadcast::Sender<Notice>,
    connection_state: ConnectionState,
    announce_task: Option<JoinHandle<()>>,
    last_cursor_sent: Option<Instant>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("room_id", &self.room_id)
            .field("actor_id", &self.identity.actor_id)
            .field("connection_state", &self.connection_state)
            .field("shapes", &self.store.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Subscribe to `options.room_id` and start the outbox.
    ///
    /// The session starts `Connecting`; it goes online when the transport
    /// reports `Subscribed` through [`Session::handle`].
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses the subscription.
    pub async fn join<T>(transport: &T, options: SessionOptions) -> Result<Self, SessionError>
    where
        T: Transport + ?Sized,
    {
        let SessionOptions { identity, room_id, config, queue, sink } = options;
        let Subscription { channel, inbound } = transport.join(room_id, identity.actor_id).await?;
        queue.set_online(false);

        let (outbox, rx) = mpsc::unbounded_channel();
        let worker = Outbox {
            channel: Arc::clone(&channel),
            queue: queue.clone(),
            actor_id: identity.actor_id,
            presence: PresenceState::new(&identity, room_id, 0.0, 0.0),
            retry_delay: config.reconnect_base,
            retry_at: None,
        };
        tokio::spawn(worker.run(rx));

        let write_behind =
            sink.as_ref().map(|sink| WriteBehind::spawn(room_id, Arc::clone(sink), config.persist_flush_interval));
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);

        info!(%room_id, actor_id = %identity.actor_id, queued = queue.len_for_room(room_id), "session: joined room");
        Ok(Self {
            store: ReplicaStore::new(config.history_depth),
            roster: PresenceRoster::new(room_id),
            identity,
            room_id,
            config,
            sink,
            channel,
            inbound,
            outbox,
            queue,
            write_behind,
            notices,
            connection_state: ConnectionState::Connecting,
            announce_task: None,
            last_cursor_sent: None,
        })
    }

    /// Tear the room down: outstanding publishes settle (or land in the
    /// queue), the channel is unsubscribed, roster and store are cleared,
    /// and pending persistence writes are flushed.
    ///
    /// # Errors
    ///
    /// Returns the final write-behind flush failure, if any.
    pub async fn leave(mut self) -> Result<(), SessionError> {
        self.shutdown().await
    }

    /// Leave this room and join `room_id` with the same identity, config,
    /// queue, and sink.
    ///
    /// # Errors
    ///
    /// Returns an error if the new subscription fails. A failed flush of the
    /// old room is logged and does not block the switch.
    pub async fn switch_room<T>(mut self, transport: &T, room_id: RoomId) -> Result<Session, SessionError>
    where
        T: Transport + ?Sized,
    {
        let from = self.room_id;
        if let Err(e) = self.shutdown().await {
            warn!(%from, error = %e, "session: flush failed while switching rooms");
        }
        let options = SessionOptions {
            identity: self.identity.clone(),
            room_id,
            config: self.config.clone(),
            queue: self.queue.clone(),
            sink: self.sink.clone(),
        };
        info!(%from, to = %room_id, "session: switching room");
        Session::join(transport, options).await
    }

    async fn shutdown(&mut self) -> Result<(), SessionError> {
        if let Some(task) = self.announce_task.take() {
            task.abort();
        }
        if self.settle().await.is_err() {
            warn!(room_id = %self.room_id, "session: outbox gone before leave");
        }
        self.channel.unsubscribe().await;
        self.queue.set_online(false);
        self.roster.clear();
        self.store.clear();
        self.connection_state = ConnectionState::Offline;

        let result = match self.write_behind.take() {
            Some(write_behind) => write_behind.close().await.map_err(SessionError::from),
            None => Ok(()),
        };
        info!(room_id = %self.room_id, queued = self.queue.len_for_room(self.room_id), "session: left room");
        result
    }

    // =========================================================================
    // LOCAL COMMANDS
    // =========================================================================

    /// Apply a local operation and dispatch it to peers.
    ///
    /// Upserts are stamped with the local actor and the current time before
    /// they are applied. Returns the operation as applied.
    pub fn mutate(&mut self, operation: Operation) -> Operation {
        if operation.is_empty() {
            return operation;
        }
        self.store.push_history();
        let operation = self.stamp(operation);
        self.commit(operation.clone());
        operation
    }

    /// Replace the local selection. Not recorded in history.
    pub fn select(&mut self, ids: impl IntoIterator<Item = ShapeId>) {
        self.store.select(ids);
    }

    /// Restore the previous snapshot and broadcast the difference so peers
    /// converge. Restored records go out exactly as they were snapshotted.
    /// Returns `false` when there is nothing to undo.
    pub fn undo(&mut self) -> bool {
        let before = self.store.registry().clone();
        if !self.store.undo() {
            return false;
        }
        self.rebroadcast(&before);
        true
    }

    /// Mirror of [`Session::undo`].
    pub fn redo(&mut self) -> bool {
        let before = self.store.registry().clone();
        if !self.store.redo() {
            return false;
        }
        self.rebroadcast(&before);
        true
    }

    /// Move the local cursor. Returns `false` when the update fell inside
    /// the throttle window and was dropped.
    pub fn move_cursor(&mut self, x: f64, y: f64) -> bool {
        let now = Instant::now();
        if let Some(last) = self.last_cursor_sent {
            if now.duration_since(last) < self.config.cursor_throttle {
                return false;
            }
        }
        self.last_cursor_sent = Some(now);
        self.send(Outbound::Cursor { x, y });
        true
    }

    /// Wait until every operation issued so far has been published or queued.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the outbox task is gone.
    pub async fn settle(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.outbox.send(Outbound::Settle(tx)).map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// The store already holds the restored snapshot; only record and send.
    fn rebroadcast(&self, before: &Registry) {
        for operation in diff_registries(before, self.store.registry()) {
            self.publish_local(operation);
        }
    }

    fn stamp(&self, operation: Operation) -> Operation {
        match operation {
            Operation::Upsert(records) => {
                let now = frames::now_ms();
                let actor = self.identity.actor_id;
                Operation::Upsert(records.into_iter().map(|r| r.stamped(actor, now)).collect())
            }
            remove @ Operation::Remove(_) => remove,
        }
    }

    fn commit(&mut self, operation: Operation) {
        self.store.apply(&operation);
        self.publish_local(operation);
    }

    fn publish_local(&self, operation: Operation) {
        if let Some(write_behind) = &self.write_behind {
            write_behind.record(&operation);
        }
        info!(
            room_id = %self.room_id,
            kind = operation.event_name(),
            count = operation.len(),
            "session: local operation"
        );
        self.send(Outbound::Publish(operation));
    }

    fn send(&self, msg: Outbound) {
        let Err(mpsc::error::SendError(msg)) = self.outbox.send(msg) else {
            return;
        };
        // PHASE: outbox gone; keep local writes durable.
        if let Outbound::Publish(operation) = msg {
            warn!(room_id = %self.room_id, "session: outbox closed; queueing operation");
            self.queue.queue_operation(operation, self.room_id, self.identity.actor_id);
        }
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Await the next inbound message and handle it.
    ///
    /// # Errors
    ///
    /// Returns `Closed` once the transport stops delivering.
    pub async fn pump(&mut self) -> Result<(), SessionError> {
        let inbound = self.inbound.recv().await.ok_or(SessionError::Closed)?;
        self.handle(inbound);
        Ok(())
    }

    /// Handle every inbound message already waiting. Returns how many.
    pub fn pump_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Some(inbound) = self.inbound.try_recv() {
            self.handle(inbound);
            handled += 1;
        }
        handled
    }

    pub fn handle(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Status(status) => self.on_status(status),
            Inbound::Operation(remote) => self.on_remote(remote),
            Inbound::Presence(event) => self.roster.apply(&event),
        }
    }

    fn on_status(&mut self, status: ChannelStatus) {
        let next = status.connection_state();
        let prev = std::mem::replace(&mut self.connection_state, next);
        if prev != next {
            if next.is_online() {
                info!(room_id = %self.room_id, ?prev, "session: online");
            } else {
                warn!(room_id = %self.room_id, ?status, state = ?next, "session: connection degraded");
            }
        }

        if next.is_online() {
            self.schedule_announce();
            if self.queue.set_online(true) {
                self.send(Outbound::Drain);
            }
        } else {
            self.queue.set_online(false);
            if let Some(task) = self.announce_task.take() {
                task.abort();
            }
        }
    }

    /// Presence is tracked only after the channel has been up for
    /// `presence_track_delay`; early packets can be dropped.
    fn schedule_announce(&mut self) {
        if let Some(task) = self.announce_task.take() {
            task.abort();
        }
        let outbox = self.outbox.clone();
        let delay = self.config.presence_track_delay;
        self.announce_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = outbox.send(Outbound::Announce);
        }));
    }

    fn on_remote(&mut self, remote: RemoteOperation) {
        let actor = self.identity.actor_id;
        let notices = match &remote.operation {
            Operation::Upsert(records) => notices_for_upsert(self.store.selection(), actor, records),
            Operation::Remove(ids) => notices_for_remove(self.store.selection(), actor, remote.from, ids),
        };
        self.store.apply(&remote.operation);
        debug!(
            room_id = %self.room_id,
            from = ?remote.from,
            kind = remote.operation.event_name(),
            count = remote.operation.len(),
            "session: applied remote operation"
        );
        for notice in notices {
            // No listeners is fine; notices are advisory.
            let _ = self.notices.send(notice);
        }
    }

    // =========================================================================
    // READ
    // =========================================================================

    #[must_use]
    pub fn view(&self) -> SessionView {
        let store = self.store.view();
        let actor = self.identity.actor_id;
        SessionView {
            shapes: store.shapes,
            selection: store.selection,
            connection_state: self.connection_state,
            is_syncing: self.queue.is_syncing(),
            queued: self.queue.len_for_room(self.room_id),
            can_undo: store.can_undo,
            can_redo: store.can_redo,
            online: self.roster.online(),
            cursors: self
                .roster
                .cursors()
                .iter()
                .filter(|(id, _)| **id != actor)
                .map(|(id, cursor)| (*id, cursor.clone()))
                .collect(),
        }
    }

    /// Advisory conflict notices for shapes in the local selection.
    #[must_use]
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    #[must_use]
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    #[must_use]
    pub fn store(&self) -> &ReplicaStore {
        &self.store
    }

    #[must_use]
    pub fn roster(&self) -> &PresenceRoster {
        &self.roster
    }

    #[must_use]
    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(task) = self.announce_task.take() {
            task.abort();
        }
    }
}
