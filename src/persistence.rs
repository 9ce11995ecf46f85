//! Write-behind persistence of local writes.
//!
//! DESIGN
//! ======
//! Each session owns one `WriteBehind`. Local operations are recorded into a
//! pending map keyed by shape id, so repeated edits to one shape coalesce and
//! a remove supersedes a pending upsert (and vice versa). A background task
//! flushes the map to a `PersistenceSink` every interval, and the session
//! flushes once more on leave.
//!
//! The sink is a best-effort copy: nothing in the sync engine ever reads it
//! back.
//!
//! ERROR HANDLING
//! ==============
//! Pending entries are cleared only after a successful write, and only if
//! they were not superseded while the write was in flight. A failed flush
//! keeps everything for the next tick.

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::operation::Operation;
use crate::shape::{RoomId, ShapeId, ShapeRecord};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("persistence sink unavailable: {0}")]
    Unavailable(String),
}

impl frames::ErrorCode for PersistError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
            Self::Unavailable(_) => "E_SINK_UNAVAILABLE",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

/// Eventually-consistent store keyed by room.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn upsert_rows(&self, room_id: RoomId, rows: &[ShapeRecord]) -> Result<(), PersistError>;

    async fn delete_rows(&self, room_id: RoomId, ids: &[ShapeId]) -> Result<(), PersistError>;
}

// =============================================================================
// WRITE-BEHIND
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum PendingWrite {
    Upsert(ShapeRecord),
    Delete,
}

#[derive(Debug, Clone)]
struct PendingEntry {
    seq: u64,
    write: PendingWrite,
}

struct WriteBehindInner {
    room_id: RoomId,
    sink: Arc<dyn PersistenceSink>,
    pending: Mutex<HashMap<ShapeId, PendingEntry>>,
    seq: AtomicU64,
    /// Serializes flushes; released even when a flush is cancelled.
    flush_lock: tokio::sync::Mutex<()>,
}

impl WriteBehindInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<ShapeId, PendingEntry>> {
        self.pending.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Coalescing buffer in front of a [`PersistenceSink`] for one room.
pub struct WriteBehind {
    inner: Arc<WriteBehindInner>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WriteBehind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehind")
            .field("room_id", &self.inner.room_id)
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl WriteBehind {
    /// Buffer without a background task; call [`WriteBehind::flush`] manually.
    #[must_use]
    pub fn new(room_id: RoomId, sink: Arc<dyn PersistenceSink>) -> Self {
        let inner = WriteBehindInner {
            room_id,
            sink,
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            flush_lock: tokio::sync::Mutex::new(()),
        };
        Self { inner: Arc::new(inner), task: None }
    }

    /// Buffer with a task flushing every `interval`.
    #[must_use]
    pub fn spawn(room_id: RoomId, sink: Arc<dyn PersistenceSink>, interval: Duration) -> Self {
        let mut this = Self::new(room_id, sink);
        let inner = Arc::clone(&this.inner);
        let interval = interval.max(Duration::from_millis(1));
        info!(%room_id, ?interval, "persist: write-behind started");
        this.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let _ = flush_inner(&inner).await;
            }
        }));
        this
    }

    /// Record a local operation for the next flush.
    pub fn record(&self, operation: &Operation) {
        let mut pending = self.inner.pending();
        match operation {
            Operation::Upsert(records) => {
                for record in records {
                    let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
                    pending.insert(record.id, PendingEntry { seq, write: PendingWrite::Upsert(record.clone()) });
                }
            }
            Operation::Remove(ids) => {
                for id in ids {
                    let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
                    pending.insert(*id, PendingEntry { seq, write: PendingWrite::Delete });
                }
            }
        }
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.pending().len()
    }

    /// Write everything pending now.
    ///
    /// # Errors
    ///
    /// Returns the first sink failure; unwritten entries stay pending.
    pub async fn flush(&self) -> Result<(), PersistError> {
        flush_inner(&self.inner).await
    }

    /// Stop the background task and flush one last time.
    ///
    /// # Errors
    ///
    /// Returns the final flush failure; those writes are lost.
    pub async fn close(mut self) -> Result<(), PersistError> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let result = flush_inner(&self.inner).await;
        if let Err(e) = &result {
            error!(room_id = %self.inner.room_id, error = %e, pending = self.pending_len(), "persist: final flush failed");
        }
        result
    }
}

impl Drop for WriteBehind {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn flush_inner(inner: &WriteBehindInner) -> Result<(), PersistError> {
    let _guard = inner.flush_lock.lock().await;
    flush_pending(inner).await
}

async fn flush_pending(inner: &WriteBehindInner) -> Result<(), PersistError> {
    // PHASE: SNAPSHOT
    // Clone under the lock, write without it.
    let (upserts, deletes) = {
        let pending = inner.pending();
        if pending.is_empty() {
            return Ok(());
        }
        let mut upserts: Vec<(u64, ShapeRecord)> = Vec::new();
        let mut deletes: Vec<(u64, ShapeId)> = Vec::new();
        for (id, entry) in pending.iter() {
            match &entry.write {
                PendingWrite::Upsert(record) => upserts.push((entry.seq, record.clone())),
                PendingWrite::Delete => deletes.push((entry.seq, *id)),
            }
        }
        (upserts, deletes)
    };

    let room_id = inner.room_id;

    // PHASE: WRITE + ACK
    // Acknowledge only entries whose seq is unchanged since the snapshot.
    if !upserts.is_empty() {
        let rows: Vec<ShapeRecord> = upserts.iter().map(|(_, r)| r.clone()).collect();
        if let Err(e) = inner.sink.upsert_rows(room_id, &rows).await {
            error!(%room_id, error = %e, count = rows.len(), "persist: upsert flush failed");
            return Err(e);
        }
        acknowledge(inner, upserts.iter().map(|(seq, r)| (r.id, *seq)));
    }

    if !deletes.is_empty() {
        let ids: Vec<ShapeId> = deletes.iter().map(|(_, id)| *id).collect();
        if let Err(e) = inner.sink.delete_rows(room_id, &ids).await {
            error!(%room_id, error = %e, count = ids.len(), "persist: delete flush failed");
            return Err(e);
        }
        acknowledge(inner, deletes.iter().map(|(seq, id)| (*id, *seq)));
    }

    Ok(())
}

fn acknowledge(inner: &WriteBehindInner, flushed: impl Iterator<Item = (ShapeId, u64)>) {
    let mut pending = inner.pending();
    for (id, seq) in flushed {
        // EDGE: keep the entry if it was rewritten after the snapshot.
        if pending.get(&id).is_some_and(|e| e.seq == seq) {
            pending.remove(&id);
        }
    }
}

// =============================================================================
// SINKS
// =============================================================================

/// PostgreSQL sink over the `shapes` table.
#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or migrations fail.
    pub async fn connect(database_url: &str) -> Result<Self, PersistError> {
        let pool = PgPoolOptions::new().max_connections(5).connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(sqlx::Error::from)?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl PersistenceSink for PgSink {
    async fn upsert_rows(&self, room_id: RoomId, rows: &[ShapeRecord]) -> Result<(), PersistError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                "INSERT INTO shapes (room_id, id, kind, attributes, group_id, z_index, updated_at, updated_by)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (room_id, id) DO UPDATE SET
                    kind = EXCLUDED.kind,
                    attributes = EXCLUDED.attributes,
                    group_id = EXCLUDED.group_id,
                    z_index = EXCLUDED.z_index,
                    updated_at = EXCLUDED.updated_at,
                    updated_by = EXCLUDED.updated_by",
            )
            .bind(room_id)
            .bind(row.id)
            .bind(row.kind.as_str())
            .bind(&row.attributes)
            .bind(row.group_id)
            .bind(row.z_index)
            .bind(row.updated_at)
            .bind(row.updated_by)
            .execute(tx.as_mut())
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_rows(&self, room_id: RoomId, ids: &[ShapeId]) -> Result<(), PersistError> {
        sqlx::query("DELETE FROM shapes WHERE room_id = $1 AND id = ANY($2)")
            .bind(room_id)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory sink; can be told to fail for testing retry behavior.
#[derive(Debug, Default)]
pub struct MemorySink {
    rows: Mutex<HashMap<(RoomId, ShapeId), ShapeRecord>>,
    failing: AtomicBool,
    writes: AtomicU64,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<(RoomId, ShapeId), ShapeRecord>> {
        self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self, room_id: RoomId, id: ShapeId) -> Option<ShapeRecord> {
        self.rows().get(&(room_id, id)).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful sink calls so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), PersistError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(PersistError::Unavailable("memory sink set to fail".into()));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl PersistenceSink for MemorySink {
    async fn upsert_rows(&self, room_id: RoomId, rows: &[ShapeRecord]) -> Result<(), PersistError> {
        self.check()?;
        let mut stored = self.rows();
        for row in rows {
            stored.insert((room_id, row.id), row.clone());
        }
        Ok(())
    }

    async fn delete_rows(&self, room_id: RoomId, ids: &[ShapeId]) -> Result<(), PersistError> {
        self.check()?;
        let mut stored = self.rows();
        for id in ids {
            stored.remove(&(room_id, *id));
        }
        Ok(())
    }
}
