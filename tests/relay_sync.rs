//! End-to-end: replicas syncing through a real relay over WebSocket.

use std::net::SocketAddr;
use std::time::Duration;

use collaboard_sync::config::{RelayConfig, SyncConfig};
use collaboard_sync::presence::Identity;
use collaboard_sync::relay::{self, RelayState};
use collaboard_sync::transport::{ConnectionState, WsTransport};
use collaboard_sync::{Operation, Session, SessionOptions, ShapeKind, ShapeRecord};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

fn test_config() -> SyncConfig {
    SyncConfig {
        presence_track_delay: Duration::from_millis(20),
        publish_timeout: Duration::from_secs(2),
        reconnect_base: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

async fn start_relay_on(listener: TcpListener) -> SocketAddr {
    let addr = listener.local_addr().unwrap();
    let state = RelayState::new(&RelayConfig::default());
    tokio::spawn(relay::serve(listener, state));
    addr
}

async fn start_relay() -> SocketAddr {
    start_relay_on(TcpListener::bind("127.0.0.1:0").await.unwrap()).await
}

async fn open(addr: SocketAddr, room: Uuid, name: &str) -> Session {
    let config = test_config();
    let transport = WsTransport::new(format!("ws://{addr}/ws"), &config);
    let options = SessionOptions::new(Identity::new(name), room).with_config(config);
    Session::join(&transport, options).await.unwrap()
}

/// Pump inbound messages until `done` holds.
async fn pump_until(session: &mut Session, done: impl Fn(&Session) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done(session) {
            session.pump().await.unwrap();
        }
    })
    .await
    .expect("condition not reached in time");
}

fn is_online(session: &Session) -> bool {
    session.connection_state() == ConnectionState::Online
}

#[tokio::test]
async fn two_replicas_converge_through_relay() {
    let addr = start_relay().await;
    let room = Uuid::new_v4();
    let mut alice = open(addr, room, "Alice").await;
    let mut bob = open(addr, room, "Bob").await;
    pump_until(&mut alice, is_online).await;
    pump_until(&mut bob, is_online).await;

    let record = ShapeRecord::new(ShapeKind::Sticky, json!({"text": "hello"}), alice.identity().actor_id);
    alice.mutate(Operation::Upsert(vec![record.clone()]));
    alice.settle().await.unwrap();
    assert_eq!(alice.view().queued, 0);

    pump_until(&mut bob, |s| s.store().contains(&record.id)).await;
    assert_eq!(bob.store().get(&record.id), alice.store().get(&record.id));

    bob.mutate(Operation::Remove(vec![record.id]));
    bob.settle().await.unwrap();
    pump_until(&mut alice, |s| !s.store().contains(&record.id)).await;

    alice.leave().await.unwrap();
    bob.leave().await.unwrap();
}

#[tokio::test]
async fn presence_roster_spans_replicas() {
    let addr = start_relay().await;
    let room = Uuid::new_v4();
    let mut alice = open(addr, room, "Alice").await;
    let mut bob = open(addr, room, "Bob").await;
    let alice_id = alice.identity().actor_id;
    let bob_id = bob.identity().actor_id;

    pump_until(&mut bob, |s| s.roster().is_online(&alice_id) && s.roster().is_online(&bob_id)).await;
    pump_until(&mut alice, |s| s.roster().is_online(&bob_id)).await;
    assert_eq!(bob.view().cursors[&alice_id].name, "Alice");

    alice.leave().await.unwrap();
    pump_until(&mut bob, |s| !s.roster().is_online(&alice_id)).await;
    bob.leave().await.unwrap();
}

#[tokio::test]
async fn edits_made_before_relay_is_up_are_replayed_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let room = Uuid::new_v4();
    let mut alice = open(addr, room, "Alice").await;
    let record = ShapeRecord::new(ShapeKind::Rect, json!({"fill": "none"}), alice.identity().actor_id);
    for fill in ["red", "green", "blue"] {
        let mut next = record.clone();
        next.attributes = json!({"fill": fill});
        alice.mutate(Operation::Upsert(vec![next]));
    }
    alice.settle().await.unwrap();
    assert_eq!(alice.view().queued, 3);
    assert!(!is_online(&alice));

    start_relay_on(TcpListener::bind(addr).await.unwrap()).await;
    let mut bob = open(addr, room, "Bob").await;
    pump_until(&mut bob, is_online).await;

    pump_until(&mut alice, is_online).await;
    alice.settle().await.unwrap();
    assert_eq!(alice.view().queued, 0);

    pump_until(&mut bob, |s| {
        s.store().get(&record.id).is_some_and(|r| r.attributes == json!({"fill": "blue"}))
    })
    .await;
    assert_eq!(bob.store().len(), 1);
}

#[tokio::test]
async fn healthz_answers_ok() {
    let addr = start_relay().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("ok"), "{response}");
}

#[tokio::test]
async fn upgrade_without_actor_is_refused() {
    let addr = start_relay().await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err());
}
