//! Offline queue: durable FIFO of local operations awaiting the transport.
//!
//! DESIGN
//! ======
//! State lives in a `watch` channel so listeners (`on_state_change`) see
//! every transition of `{is_online, is_syncing, queued_operations}`. The
//! queue is cloned freely; all clones share one state.
//!
//! `sync_queue` drains entries for the publisher's room in FIFO order,
//! awaiting each publish before starting the next. An entry is removed only
//! after its publish succeeds. On failure the drain stops and the remainder
//! stays queued, untouched, for the next online transition. Entries for
//! other rooms keep their place.
//!
//! No bound is imposed; a long outage grows the queue without limit.
//!
//! ERROR HANDLING
//! ==============
//! Store failures are logged and never block a local edit: the in-memory
//! queue stays authoritative for the running process.

#[cfg(test)]
#[path = "queue_test.rs"]
mod tests;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::operation::{Operation, PendingOperation};
use crate::shape::{ActorId, RoomId};
use crate::transport::{Publisher, TransportError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl frames::ErrorCode for QueueError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "E_QUEUE_IO",
            Self::Json(_) => "E_QUEUE_JSON",
        }
    }
}

/// Observable queue state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueState {
    pub is_online: bool,
    pub is_syncing: bool,
    pub queued_operations: Vec<PendingOperation>,
}

// =============================================================================
// STORES
// =============================================================================

/// Durable backing for the queue contents.
pub trait QueueStore: Send + Sync {
    /// Entries persisted by a previous process, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store cannot be read or parsed.
    fn load(&self) -> Result<Vec<PendingOperation>, QueueError>;

    /// Replace the persisted contents.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store cannot be written.
    fn save(&self, operations: &[PendingOperation]) -> Result<(), QueueError>;
}

/// Non-durable store; survives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    saved: Mutex<Vec<PendingOperation>>,
}

impl MemoryQueueStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> Result<Vec<PendingOperation>, QueueError> {
        Ok(self.saved.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone())
    }

    fn save(&self, operations: &[PendingOperation]) -> Result<(), QueueError> {
        *self.saved.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = operations.to_vec();
        Ok(())
    }
}

/// JSON file store. Writes go to a sibling temp file that is then renamed
/// over the target, so a crash never leaves a torn file.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QueueStore for FileQueueStore {
    fn load(&self) -> Result<Vec<PendingOperation>, QueueError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn save(&self, operations: &[PendingOperation]) -> Result<(), QueueError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(operations)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// =============================================================================
// QUEUE
// =============================================================================

struct QueueInner {
    state: watch::Sender<QueueState>,
    store: Box<dyn QueueStore>,
    /// Serializes snapshot + save so the newest state is always written last.
    persist: Mutex<()>,
}

/// Shared handle to the offline queue.
#[derive(Clone)]
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue").field("state", &*self.inner.state.borrow()).finish()
    }
}

impl OfflineQueue {
    /// Build a queue, restoring whatever `store` persisted. Starts offline.
    #[must_use]
    pub fn new(store: impl QueueStore + 'static) -> Self {
        let restored = store.load().unwrap_or_else(|e| {
            error!(error = %e, "queue: failed to restore persisted operations");
            Vec::new()
        });
        if !restored.is_empty() {
            info!(count = restored.len(), "queue: restored persisted operations");
        }
        let (state, _) = watch::channel(QueueState { queued_operations: restored, ..QueueState::default() });
        Self { inner: Arc::new(QueueInner { state, store: Box::new(store), persist: Mutex::new(()) }) }
    }

    /// In-memory queue.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(MemoryQueueStore::new())
    }

    /// Append an operation. Returns the queued entry.
    pub fn queue_operation(&self, operation: Operation, room_id: RoomId, actor_id: ActorId) -> PendingOperation {
        let entry = PendingOperation::new(operation, room_id, actor_id);
        self.inner.state.send_modify(|s| s.queued_operations.push(entry.clone()));
        info!(%room_id, id = %entry.id, kind = entry.operation.event_name(), "queue: operation queued");
        self.persist();
        entry
    }

    /// Drain entries for `publisher`'s room in FIFO order.
    ///
    /// Returns how many entries were published. A concurrent drain or an
    /// offline queue makes this a no-op returning `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Returns the first publish failure; that entry and everything after it
    /// stay queued.
    pub async fn sync_queue<P>(&self, publisher: &P) -> Result<usize, TransportError>
    where
        P: Publisher + ?Sized,
    {
        if !self.try_begin_sync() {
            return Ok(0);
        }
        let room_id = publisher.room_id();
        let mut published = 0;
        let result = loop {
            if !self.inner.state.borrow().is_online {
                break Ok(published);
            }
            let Some(entry) = self.next_for_room(room_id) else {
                break Ok(published);
            };
            match publisher.publish(&entry.operation).await {
                Ok(()) => {
                    self.remove(entry.id);
                    published += 1;
                }
                Err(e) => {
                    warn!(%room_id, id = %entry.id, error = %e, "queue: replay failed; keeping remainder");
                    break Err(e);
                }
            }
        };
        self.inner.state.send_modify(|s| s.is_syncing = false);
        if published > 0 {
            info!(%room_id, count = published, remaining = self.len(), "queue: replayed operations");
        }
        result
    }

    fn try_begin_sync(&self) -> bool {
        self.inner.state.send_if_modified(|s| {
            if s.is_syncing || !s.is_online {
                return false;
            }
            s.is_syncing = true;
            true
        })
    }

    fn next_for_room(&self, room_id: RoomId) -> Option<PendingOperation> {
        self.inner
            .state
            .borrow()
            .queued_operations
            .iter()
            .find(|e| e.room_id == room_id)
            .cloned()
    }

    fn remove(&self, id: Uuid) {
        self.inner.state.send_modify(|s| s.queued_operations.retain(|e| e.id != id));
        self.persist();
    }

    /// Record connectivity. Returns `true` on an offline → online transition.
    pub fn set_online(&self, online: bool) -> bool {
        let mut became_online = false;
        self.inner.state.send_if_modified(|s| {
            if s.is_online == online {
                return false;
            }
            became_online = online;
            s.is_online = online;
            true
        });
        became_online
    }

    #[must_use]
    pub fn get_state(&self) -> QueueState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn on_state_change(&self) -> watch::Receiver<QueueState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.state.borrow().is_online
    }

    #[must_use]
    pub fn is_syncing(&self) -> bool {
        self.inner.state.borrow().is_syncing
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.borrow().queued_operations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries queued for `room_id`.
    #[must_use]
    pub fn len_for_room(&self, room_id: RoomId) -> usize {
        self.inner
            .state
            .borrow()
            .queued_operations
            .iter()
            .filter(|e| e.room_id == room_id)
            .count()
    }

    fn persist(&self) {
        let _guard = self.inner.persist.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let snapshot = self.inner.state.borrow().queued_operations.clone();
        if let Err(e) = self.inner.store.save(&snapshot) {
            error!(error = %e, count = snapshot.len(), "queue: failed to persist operations");
        }
    }
}
