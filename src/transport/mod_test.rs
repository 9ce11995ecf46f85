use frames::ErrorCode;

use super::*;

#[test]
fn channel_status_maps_to_connection_state() {
    assert_eq!(ChannelStatus::Subscribed.connection_state(), ConnectionState::Online);
    assert_eq!(ChannelStatus::ChannelError.connection_state(), ConnectionState::Offline);
    assert_eq!(ChannelStatus::TimedOut.connection_state(), ConnectionState::Reconnecting);
    assert_eq!(ChannelStatus::Closed.connection_state(), ConnectionState::Reconnecting);
}

#[test]
fn only_online_is_online() {
    assert!(ConnectionState::Online.is_online());
    assert!(!ConnectionState::Connecting.is_online());
    assert!(!ConnectionState::Reconnecting.is_online());
    assert!(!ConnectionState::Offline.is_online());
}

#[test]
fn transport_error_codes() {
    assert_eq!(TransportError::NotConnected.error_code(), "E_NOT_CONNECTED");
    assert!(TransportError::Timeout.retryable());
    let rejected = TransportError::Rejected { code: "E_X".into(), message: "m".into() };
    assert_eq!(rejected.error_code(), "E_REJECTED");
    assert!(!rejected.retryable());
}

#[tokio::test]
async fn deliver_drops_broadcasts_when_full_but_never_status() {
    let (tx, mut rx) = inbound_channel(1);
    let leave = Inbound::Presence(PresenceEvent::Leave(uuid::Uuid::new_v4()));
    assert!(deliver(&tx, leave.clone()));
    assert!(deliver(&tx, Inbound::Presence(PresenceEvent::Sync(vec![]))));
    assert!(deliver(&tx, Inbound::Status(ChannelStatus::Closed)));
    assert!(deliver(&tx, Inbound::Status(ChannelStatus::Subscribed)));

    assert_eq!(rx.recv().await, Some(Inbound::Status(ChannelStatus::Closed)));
    assert_eq!(rx.try_recv(), Some(Inbound::Status(ChannelStatus::Subscribed)));
    assert_eq!(rx.recv().await, Some(leave));
    assert_eq!(rx.try_recv(), None);

    drop(rx);
    assert!(tx.is_closed());
    assert!(!deliver(&tx, Inbound::Status(ChannelStatus::Subscribed)));
}
