use serde_json::json;
use uuid::Uuid;

use super::*;
use crate::shape::ShapeKind;

fn record(fill: &str) -> ShapeRecord {
    ShapeRecord::new(ShapeKind::Rect, json!({"fill": fill}), Uuid::new_v4())
}

fn buffer(sink: &Arc<MemorySink>) -> (RoomId, WriteBehind) {
    let room = Uuid::new_v4();
    let dyn_sink: Arc<dyn PersistenceSink> = sink.clone();
    (room, WriteBehind::new(room, dyn_sink))
}

// =============================================================================
// Coalescing
// =============================================================================

#[tokio::test]
async fn repeated_upserts_coalesce_to_latest() {
    let sink = Arc::new(MemorySink::new());
    let (room, wb) = buffer(&sink);
    let first = record("red");
    let mut second = first.clone();
    second.attributes = json!({"fill": "blue"});

    wb.record(&Operation::Upsert(vec![first.clone()]));
    wb.record(&Operation::Upsert(vec![second.clone()]));
    assert_eq!(wb.pending_len(), 1);

    wb.flush().await.unwrap();
    assert_eq!(sink.get(room, first.id), Some(second));
    assert_eq!(sink.write_count(), 1);
    assert_eq!(wb.pending_len(), 0);
}

#[tokio::test]
async fn remove_supersedes_pending_upsert() {
    let sink = Arc::new(MemorySink::new());
    let (room, wb) = buffer(&sink);
    let rec = record("red");

    wb.record(&Operation::Upsert(vec![rec.clone()]));
    wb.record(&Operation::Remove(vec![rec.id]));
    wb.flush().await.unwrap();

    assert!(sink.get(room, rec.id).is_none());
    assert_eq!(wb.pending_len(), 0);
}

#[tokio::test]
async fn upsert_after_remove_resurrects_row() {
    let sink = Arc::new(MemorySink::new());
    let (room, wb) = buffer(&sink);
    let rec = record("red");

    wb.record(&Operation::Remove(vec![rec.id]));
    wb.record(&Operation::Upsert(vec![rec.clone()]));
    wb.flush().await.unwrap();
    assert_eq!(sink.get(room, rec.id), Some(rec));
}

#[tokio::test]
async fn flush_with_nothing_pending_skips_sink() {
    let sink = Arc::new(MemorySink::new());
    let (_, wb) = buffer(&sink);
    wb.flush().await.unwrap();
    assert_eq!(sink.write_count(), 0);
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn failed_flush_keeps_entries_for_retry() {
    let sink = Arc::new(MemorySink::new());
    let (room, wb) = buffer(&sink);
    let rec = record("red");
    wb.record(&Operation::Upsert(vec![rec.clone()]));

    sink.set_failing(true);
    let err = wb.flush().await.unwrap_err();
    assert!(matches!(err, PersistError::Unavailable(_)));
    assert_eq!(wb.pending_len(), 1);
    assert!(sink.is_empty());

    sink.set_failing(false);
    wb.flush().await.unwrap();
    assert_eq!(sink.get(room, rec.id), Some(rec));
    assert_eq!(wb.pending_len(), 0);
}

#[tokio::test]
async fn close_flushes_remaining_writes() {
    let sink = Arc::new(MemorySink::new());
    let room = Uuid::new_v4();
    let dyn_sink: Arc<dyn PersistenceSink> = sink.clone();
    let wb = WriteBehind::spawn(room, dyn_sink, Duration::from_secs(3600));
    let rec = record("red");
    wb.record(&Operation::Upsert(vec![rec.clone()]));

    wb.close().await.unwrap();
    assert_eq!(sink.get(room, rec.id), Some(rec));
}

#[tokio::test]
async fn background_task_flushes_on_interval() {
    let sink = Arc::new(MemorySink::new());
    let room = Uuid::new_v4();
    let dyn_sink: Arc<dyn PersistenceSink> = sink.clone();
    let wb = WriteBehind::spawn(room, dyn_sink, Duration::from_millis(10));
    let rec = record("red");
    wb.record(&Operation::Upsert(vec![rec.clone()]));

    for _ in 0..100 {
        if sink.get(room, rec.id).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(sink.get(room, rec.id), Some(rec));
    assert_eq!(wb.pending_len(), 0);
}

#[test]
fn persist_error_codes() {
    use frames::ErrorCode;
    let err = PersistError::Unavailable("down".into());
    assert_eq!(err.error_code(), "E_SINK_UNAVAILABLE");
    assert!(err.retryable());
}
