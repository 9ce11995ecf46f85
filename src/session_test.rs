use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use super::*;
use crate::persistence::MemorySink;
use crate::shape::ShapeKind;
use crate::transport::MemoryBroker;

fn fast_config() -> SyncConfig {
    SyncConfig { presence_track_delay: Duration::from_millis(10), ..SyncConfig::default() }
}

async fn open(broker: &MemoryBroker, room: RoomId, name: &str) -> Session {
    let options = SessionOptions::new(Identity::new(name), room).with_config(fast_config());
    let mut session = Session::join(&broker.transport(), options).await.unwrap();
    session.pump_pending();
    session
}

fn rect(session: &Session, fill: &str) -> ShapeRecord {
    ShapeRecord::new(ShapeKind::Rect, json!({"fill": fill}), session.identity().actor_id)
}

/// Poll both sessions until `done` holds or the attempts run out.
async fn wait_until(a: &mut Session, b: &mut Session, done: impl Fn(&Session, &Session) -> bool) {
    for _ in 0..100 {
        a.pump_pending();
        b.pump_pending();
        if done(a, b) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Local commands
// =============================================================================

#[tokio::test]
async fn join_starts_connecting_then_goes_online() {
    let broker = MemoryBroker::new();
    let options = SessionOptions::new(Identity::new("Ada"), Uuid::new_v4());
    let mut session = Session::join(&broker.transport(), options).await.unwrap();
    assert_eq!(session.connection_state(), ConnectionState::Connecting);

    session.pump().await.unwrap();
    assert_eq!(session.connection_state(), ConnectionState::Online);
    assert!(session.queue().is_online());
}

#[tokio::test]
async fn local_upsert_is_stamped_and_reaches_peer() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;

    let mut record = rect(&alice, "red");
    record.updated_by = Uuid::new_v4();
    record.updated_at = 0;
    let applied = alice.mutate(Operation::Upsert(vec![record.clone()]));
    alice.settle().await.unwrap();

    let Operation::Upsert(stamped) = &applied else {
        panic!("expected upsert");
    };
    assert_eq!(stamped[0].updated_by, alice.identity().actor_id);
    assert!(stamped[0].updated_at > 0);
    assert_eq!(alice.store().get(&record.id), Some(&stamped[0]));

    bob.pump_pending();
    assert_eq!(bob.store().get(&record.id), Some(&stamped[0]));
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn remote_operations_do_not_enter_history() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;

    alice.mutate(Operation::Upsert(vec![rect(&alice, "red")]));
    alice.settle().await.unwrap();
    bob.pump_pending();

    assert_eq!(bob.store().len(), 1);
    assert!(!bob.view().can_undo);
    assert!(alice.view().can_undo);
}

#[tokio::test]
async fn empty_operation_is_ignored() {
    let broker = MemoryBroker::new();
    let mut alice = open(&broker, Uuid::new_v4(), "Alice").await;
    alice.mutate(Operation::Remove(Vec::new()));
    alice.settle().await.unwrap();
    assert!(!alice.view().can_undo);
    assert!(broker.published().is_empty());
}

#[tokio::test]
async fn undo_and_redo_rebroadcast_the_restored_state() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;

    let record = rect(&alice, "red");
    alice.mutate(Operation::Upsert(vec![record.clone()]));
    alice.settle().await.unwrap();
    bob.pump_pending();
    assert!(bob.store().contains(&record.id));

    assert!(alice.undo());
    alice.settle().await.unwrap();
    bob.pump_pending();
    assert!(!alice.store().contains(&record.id));
    assert!(!bob.store().contains(&record.id));

    assert!(alice.redo());
    alice.settle().await.unwrap();
    bob.pump_pending();
    let restored = bob.store().get(&record.id).unwrap();
    assert_eq!(restored.attributes, json!({"fill": "red"}));
    assert_eq!(alice.store().get(&record.id), Some(restored));

    assert!(!alice.redo());
}

#[tokio::test]
async fn undo_restores_the_exact_snapshot_and_sends_it_unchanged() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;

    let record = rect(&alice, "red");
    alice.mutate(Operation::Upsert(vec![record.clone()]));
    alice.settle().await.unwrap();
    let before = alice.store().snapshot();

    // Later clock so a restamp would be visible.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut edited = before.registry[&record.id].clone();
    edited.attributes = json!({"fill": "green"});
    alice.mutate(Operation::Upsert(vec![edited]));

    assert!(alice.undo());
    assert_eq!(alice.store().snapshot(), before);

    alice.settle().await.unwrap();
    wait_until(&mut alice, &mut bob, |_, b| {
        b.store().get(&record.id).is_some_and(|r| r.attributes == json!({"fill": "red"}))
    })
    .await;
    assert_eq!(bob.store().get(&record.id), before.registry.get(&record.id));
}

#[tokio::test]
async fn undo_with_empty_history_publishes_nothing() {
    let broker = MemoryBroker::new();
    let mut alice = open(&broker, Uuid::new_v4(), "Alice").await;
    assert!(!alice.undo());
    alice.settle().await.unwrap();
    assert!(broker.published().is_empty());
}

// =============================================================================
// Offline queue
// =============================================================================

#[tokio::test]
async fn offline_edits_queue_then_drain_in_order() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;

    broker.set_reachable(false);
    alice.pump_pending();
    assert_eq!(alice.connection_state(), ConnectionState::Reconnecting);

    let ops: Vec<Operation> = ["o1", "o2", "o3"]
        .iter()
        .map(|fill| {
            let record = rect(&alice, fill);
            alice.mutate(Operation::Upsert(vec![record]))
        })
        .collect();
    alice.settle().await.unwrap();

    assert_eq!(alice.view().queued, 3);
    assert_eq!(alice.queue().get_state().queued_operations.len(), 3);
    assert_eq!(alice.store().len(), 3);
    assert!(broker.published().is_empty());

    broker.set_reachable(true);
    alice.pump_pending();
    alice.settle().await.unwrap();

    let published: Vec<Operation> = broker.published().into_iter().map(|(_, _, op)| op).collect();
    assert_eq!(published, ops);
    assert_eq!(alice.view().queued, 0);
    assert!(!alice.view().is_syncing);

    bob.pump_pending();
    assert_eq!(bob.store().len(), 3);
}

#[tokio::test]
async fn failed_publish_falls_back_to_queue() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;

    // The outage has not been observed yet, so the direct publish is attempted.
    broker.set_reachable(false);
    alice.mutate(Operation::Upsert(vec![rect(&alice, "red")]));
    alice.settle().await.unwrap();
    assert_eq!(alice.view().queued, 1);

    alice.pump_pending();
    broker.set_reachable(true);
    alice.pump_pending();
    alice.settle().await.unwrap();
    assert_eq!(alice.view().queued, 0);
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn publish_failing_while_online_is_retried_without_new_edits() {
    let broker = MemoryBroker::new();
    let config = SyncConfig { reconnect_base: Duration::from_millis(20), ..fast_config() };
    let options = SessionOptions::new(Identity::new("Alice"), Uuid::new_v4()).with_config(config);
    let mut alice = Session::join(&broker.transport(), options).await.unwrap();
    alice.pump_pending();

    // Closed is never pumped, so the session keeps reading online.
    broker.set_reachable(false);
    alice.mutate(Operation::Upsert(vec![rect(&alice, "red")]));
    alice.settle().await.unwrap();
    assert_eq!(alice.view().queued, 1);
    assert!(alice.queue().is_online());

    broker.set_reachable(true);
    for _ in 0..100 {
        if alice.view().queued == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(alice.view().queued, 0);
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn outage_is_seen_even_when_inbound_is_backed_up() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let options = SessionOptions::new(Identity::new("Alice"), room).with_config(fast_config());
    let mut alice = Session::join(&broker.transport().with_buffer(1), options).await.unwrap();
    alice.pump_pending();
    let mut bob = open(&broker, room, "Bob").await;

    // Bob's edit fills Alice's only inbound slot before the outage.
    bob.mutate(Operation::Upsert(vec![rect(&bob, "blue")]));
    bob.settle().await.unwrap();
    broker.set_reachable(false);
    alice.pump_pending();
    assert_eq!(alice.connection_state(), ConnectionState::Reconnecting);

    alice.mutate(Operation::Upsert(vec![rect(&alice, "red")]));
    alice.settle().await.unwrap();
    assert_eq!(alice.view().queued, 1);

    broker.set_reachable(true);
    alice.pump_pending();
    alice.settle().await.unwrap();
    assert_eq!(alice.connection_state(), ConnectionState::Online);
    assert_eq!(alice.view().queued, 0);
}

#[tokio::test]
async fn queued_operations_survive_a_room_switch() {
    let broker = MemoryBroker::new();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    let queue = OfflineQueue::in_memory();
    let options = SessionOptions::new(Identity::new("Alice"), first)
        .with_config(fast_config())
        .with_queue(queue.clone());
    let mut alice = Session::join(&broker.transport(), options).await.unwrap();
    alice.pump_pending();

    broker.set_reachable(false);
    alice.pump_pending();
    alice.mutate(Operation::Remove(vec![Uuid::new_v4()]));
    alice.settle().await.unwrap();
    broker.set_reachable(true);

    let mut alice = alice.switch_room(&broker.transport(), second).await.unwrap();
    assert_eq!(alice.room_id(), second);
    assert_eq!(broker.member_count(first), 0);
    assert!(alice.store().is_empty());
    alice.pump_pending();
    alice.settle().await.unwrap();

    // Entries for the old room wait for that room's next session.
    assert_eq!(queue.len_for_room(first), 1);
    assert!(broker.published().is_empty());
}

// =============================================================================
// Notices
// =============================================================================

#[tokio::test]
async fn remote_edit_to_selected_shape_raises_notice() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;

    let record = rect(&alice, "red");
    alice.mutate(Operation::Upsert(vec![record.clone()]));
    alice.settle().await.unwrap();
    bob.pump_pending();
    bob.select([record.id]);
    let mut notices = bob.subscribe_notices();

    let mut edited = record.clone();
    edited.attributes = json!({"fill": "blue"});
    alice.mutate(Operation::Upsert(vec![edited]));
    alice.settle().await.unwrap();
    bob.pump_pending();

    assert_eq!(
        notices.try_recv().unwrap(),
        Notice::SelectedShapeModified { shape_id: record.id, by: alice.identity().actor_id }
    );
    assert_eq!(bob.store().get(&record.id).unwrap().attributes, json!({"fill": "blue"}));
}

#[tokio::test]
async fn remote_remove_of_selected_shape_raises_notice_and_prunes_selection() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;

    let record = rect(&alice, "red");
    alice.mutate(Operation::Upsert(vec![record.clone()]));
    alice.settle().await.unwrap();
    bob.pump_pending();
    bob.select([record.id]);
    let mut notices = bob.subscribe_notices();

    alice.mutate(Operation::Remove(vec![record.id]));
    alice.settle().await.unwrap();
    bob.pump_pending();

    assert_eq!(
        notices.try_recv().unwrap(),
        Notice::SelectedShapeDeleted { shape_id: record.id, by: Some(alice.identity().actor_id) }
    );
    assert!(bob.view().selection.is_empty());
}

#[tokio::test]
async fn unselected_edits_raise_no_notice() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;
    let mut notices = bob.subscribe_notices();

    alice.mutate(Operation::Upsert(vec![rect(&alice, "red")]));
    alice.settle().await.unwrap();
    bob.pump_pending();
    assert!(notices.try_recv().is_err());
}

// =============================================================================
// Presence
// =============================================================================

#[tokio::test]
async fn presence_is_announced_after_subscribe() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;

    wait_until(&mut alice, &mut bob, |a, b| a.view().online.len() == 2 && b.view().online.len() == 2).await;

    let alice_id = alice.identity().actor_id;
    let bob_view = bob.view();
    assert_eq!(bob_view.online.len(), 2);
    assert_eq!(bob_view.cursors.len(), 1);
    assert_eq!(bob_view.cursors[&alice_id].name, "Alice");
    assert!(!alice.view().cursors.contains_key(&alice_id));
}

#[tokio::test]
async fn cursor_moves_reach_peers() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;
    let alice_id = alice.identity().actor_id;
    wait_until(&mut alice, &mut bob, |_, b| b.roster().is_online(&alice_id)).await;

    assert!(alice.move_cursor(12.0, 34.0));
    alice.settle().await.unwrap();
    bob.pump_pending();

    let cursor = &bob.view().cursors[&alice_id];
    assert!((cursor.x - 12.0).abs() < f64::EPSILON);
    assert!((cursor.y - 34.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn cursor_updates_are_throttled() {
    let broker = MemoryBroker::new();
    let config = SyncConfig { cursor_throttle: Duration::from_secs(3600), ..fast_config() };
    let options = SessionOptions::new(Identity::new("Alice"), Uuid::new_v4()).with_config(config);
    let mut alice = Session::join(&broker.transport(), options).await.unwrap();

    assert!(alice.move_cursor(1.0, 1.0));
    assert!(!alice.move_cursor(2.0, 2.0));
}

#[tokio::test]
async fn leaving_announces_departure_to_peers() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;
    let mut bob = open(&broker, room, "Bob").await;
    let alice_id = alice.identity().actor_id;
    wait_until(&mut alice, &mut bob, |_, b| b.roster().is_online(&alice_id)).await;

    alice.leave().await.unwrap();
    bob.pump_pending();
    assert!(!bob.roster().is_online(&alice_id));
    assert!(!bob.view().cursors.contains_key(&alice_id));
    assert_eq!(broker.member_count(room), 1);
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn leave_flushes_local_writes_to_sink() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let sink = Arc::new(MemorySink::new());
    let dyn_sink: Arc<dyn PersistenceSink> = sink.clone();
    let config = SyncConfig { persist_flush_interval: Duration::from_secs(3600), ..fast_config() };
    let options = SessionOptions::new(Identity::new("Alice"), room).with_config(config).with_sink(dyn_sink);
    let mut alice = Session::join(&broker.transport(), options).await.unwrap();
    alice.pump_pending();

    let record = rect(&alice, "red");
    let applied = alice.mutate(Operation::Upsert(vec![record.clone()]));
    let Operation::Upsert(stamped) = applied else {
        panic!("expected upsert");
    };
    alice.leave().await.unwrap();

    assert_eq!(sink.get(room, record.id), Some(stamped[0].clone()));
}

#[tokio::test]
async fn remote_writes_are_not_persisted_by_receiver() {
    let broker = MemoryBroker::new();
    let room = Uuid::new_v4();
    let mut alice = open(&broker, room, "Alice").await;

    let sink = Arc::new(MemorySink::new());
    let dyn_sink: Arc<dyn PersistenceSink> = sink.clone();
    let options = SessionOptions::new(Identity::new("Bob"), room).with_config(fast_config()).with_sink(dyn_sink);
    let mut bob = Session::join(&broker.transport(), options).await.unwrap();
    bob.pump_pending();

    alice.mutate(Operation::Upsert(vec![rect(&alice, "red")]));
    alice.settle().await.unwrap();
    bob.pump_pending();
    assert_eq!(bob.store().len(), 1);

    bob.leave().await.unwrap();
    assert!(sink.is_empty());
}

#[test]
fn session_error_codes_delegate() {
    use frames::ErrorCode;
    assert_eq!(SessionError::Closed.error_code(), "E_SESSION_CLOSED");
    let err = SessionError::from(TransportError::NotConnected);
    assert_eq!(err.error_code(), "E_NOT_CONNECTED");
    assert!(err.retryable());
}
