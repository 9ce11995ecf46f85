//! In-process broker for tests and embedding.
//!
//! Every `MemoryTransport` created from one `MemoryBroker` shares its rooms.
//! Fan-out excludes the sender, presence follows the relay's join/sync/leave
//! pattern, and `set_reachable(false)` simulates a network outage: members
//! see `Closed`, publishes fail, and restoring reachability emits
//! `Subscribed` again.

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{
    Channel, ChannelStatus, Inbound, InboundSender, Publisher, RemoteOperation, Subscription, Transport,
    TransportError, deliver, inbound_channel,
};
use crate::operation::Operation;
use crate::presence::{PresenceEvent, PresenceState};
use crate::shape::{ActorId, RoomId};

const DEFAULT_MEMORY_BUFFER: usize = 1024;

struct Member {
    actor_id: ActorId,
    tx: InboundSender,
    presence: Option<PresenceState>,
}

#[derive(Default)]
struct BrokerInner {
    rooms: HashMap<RoomId, HashMap<Uuid, Member>>,
    unreachable: bool,
    published: Vec<(RoomId, Option<ActorId>, Operation)>,
}

impl BrokerInner {
    fn presences(&self, room_id: RoomId) -> Vec<PresenceState> {
        let mut states: Vec<PresenceState> = self
            .rooms
            .get(&room_id)
            .map(|members| members.values().filter_map(|m| m.presence.clone()).collect())
            .unwrap_or_default();
        states.sort_by_key(|s| s.id);
        states
    }

    fn fan_out(&self, room_id: RoomId, except: Option<Uuid>, message: &Inbound) {
        let Some(members) = self.rooms.get(&room_id) else {
            return;
        };
        for (conn_id, member) in members {
            if Some(*conn_id) == except {
                continue;
            }
            deliver(&member.tx, message.clone());
        }
    }
}

/// Shared in-process room registry.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A transport bound to this broker.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { broker: self.clone(), buffer: DEFAULT_MEMORY_BUFFER }
    }

    /// Toggle simulated connectivity for every member.
    pub fn set_reachable(&self, reachable: bool) {
        let mut inner = self.lock();
        if inner.unreachable != reachable {
            return;
        }
        inner.unreachable = !reachable;
        let status = if reachable { ChannelStatus::Subscribed } else { ChannelStatus::Closed };
        debug!(reachable, "memory: reachability changed");
        for members in inner.rooms.values() {
            for member in members.values() {
                deliver(&member.tx, Inbound::Status(status));
            }
        }
    }

    #[must_use]
    pub fn is_reachable(&self) -> bool {
        !self.lock().unreachable
    }

    /// Every operation accepted so far, in acceptance order.
    #[must_use]
    pub fn published(&self) -> Vec<(RoomId, Option<ActorId>, Operation)> {
        self.lock().published.clone()
    }

    /// Number of live subscriptions in `room_id`.
    #[must_use]
    pub fn member_count(&self, room_id: RoomId) -> usize {
        self.lock().rooms.get(&room_id).map_or(0, HashMap::len)
    }
}

/// [`Transport`] over a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    broker: MemoryBroker,
    buffer: usize,
}

impl MemoryTransport {
    #[must_use]
    pub fn with_buffer(mut self, buffer: usize) -> Self {
        self.buffer = buffer.max(1);
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn join(&self, room_id: RoomId, actor_id: ActorId) -> Result<Subscription, TransportError> {
        let (tx, inbound) = inbound_channel(self.buffer);
        let conn_id = Uuid::new_v4();
        {
            let mut inner = self.broker.lock();
            if !inner.unreachable {
                deliver(&tx, Inbound::Status(ChannelStatus::Subscribed));
                let roster = inner.presences(room_id);
                deliver(&tx, Inbound::Presence(PresenceEvent::Sync(roster)));
            }
            inner
                .rooms
                .entry(room_id)
                .or_default()
                .insert(conn_id, Member { actor_id, tx, presence: None });
        }
        debug!(%room_id, %actor_id, "memory: joined room");

        let channel = MemoryChannel { broker: self.broker.clone(), room_id, actor_id, conn_id };
        Ok(Subscription { channel: Arc::new(channel), inbound })
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    room_id: RoomId,
    actor_id: ActorId,
    conn_id: Uuid,
}

impl MemoryChannel {
    fn connected<'a>(&self, inner: &'a mut BrokerInner) -> Result<&'a mut Member, TransportError> {
        if inner.unreachable {
            return Err(TransportError::NotConnected);
        }
        inner
            .rooms
            .get_mut(&self.room_id)
            .and_then(|members| members.get_mut(&self.conn_id))
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl Publisher for MemoryChannel {
    fn room_id(&self) -> RoomId {
        self.room_id
    }

    async fn publish(&self, operation: &Operation) -> Result<(), TransportError> {
        let mut inner = self.broker.lock();
        let from = self.connected(&mut inner)?.actor_id;
        let message = Inbound::Operation(RemoteOperation { from: Some(from), operation: operation.clone() });
        inner.fan_out(self.room_id, Some(self.conn_id), &message);
        inner.published.push((self.room_id, Some(from), operation.clone()));
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn track(&self, state: &PresenceState) -> Result<(), TransportError> {
        let mut inner = self.broker.lock();
        self.connected(&mut inner)?.presence = Some(state.clone());
        inner.fan_out(self.room_id, None, &Inbound::Presence(PresenceEvent::Join(state.clone())));
        let roster = inner.presences(self.room_id);
        inner.fan_out(self.room_id, None, &Inbound::Presence(PresenceEvent::Sync(roster)));
        Ok(())
    }

    async fn unsubscribe(&self) {
        let mut inner = self.broker.lock();
        let Some(members) = inner.rooms.get_mut(&self.room_id) else {
            return;
        };
        let Some(member) = members.remove(&self.conn_id) else {
            return;
        };
        if members.is_empty() {
            inner.rooms.remove(&self.room_id);
        }
        if member.presence.is_some() {
            inner.fan_out(self.room_id, None, &Inbound::Presence(PresenceEvent::Leave(member.actor_id)));
            let roster = inner.presences(self.room_id);
            inner.fan_out(self.room_id, None, &Inbound::Presence(PresenceEvent::Sync(roster)));
        }
        debug!(room_id = %self.room_id, actor_id = %self.actor_id, "memory: left room");
    }
}
