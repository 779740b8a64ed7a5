//! In-memory hub routing server events to connected viewers.
//!
//! Every connection gets one bounded channel at registration; room
//! membership is a subscriber list per room code. Broadcasts use
//! `try_send`, and a subscriber that stays full for too many consecutive
//! broadcasts is evicted rather than allowed to apply backpressure to the
//! whole room.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use roomcast_core::models::{ConnectionId, Fingerprint, RoomCode};

use crate::proto::ServerEvent;

/// Capacity of each per-connection outbound channel.
const CHANNEL_CAPACITY: usize = 256;

/// Consecutive full-channel drops before a subscriber is disconnected.
const MAX_CONSECUTIVE_DROPS: u32 = 10;

#[derive(Debug)]
struct Subscriber {
    connection_id: ConnectionId,
    sender: mpsc::Sender<ServerEvent>,
    consecutive_drops: Arc<AtomicU32>,
}

impl Clone for Subscriber {
    fn clone(&self) -> Self {
        Self {
            connection_id: self.connection_id.clone(),
            sender: self.sender.clone(),
            consecutive_drops: self.consecutive_drops.clone(),
        }
    }
}

/// Everything the hub knows about a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub remote_addr: IpAddr,
    pub joined_at: DateTime<Utc>,
    pub room: Option<RoomCode>,
    pub fingerprint: Option<Fingerprint>,
    sender: mpsc::Sender<ServerEvent>,
}

#[derive(Debug, Default)]
pub struct SessionHub {
    rooms: DashMap<RoomCode, Vec<Subscriber>>,
    connections: DashMap<ConnectionId, ConnectionMeta>,
}

impl SessionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh connection and hand back its outbound receiver.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        remote_addr: IpAddr,
    ) -> mpsc::Receiver<ServerEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.connections.insert(
            connection_id.clone(),
            ConnectionMeta {
                remote_addr,
                joined_at: Utc::now(),
                room: None,
                fingerprint: None,
                sender: tx,
            },
        );
        info!(connection = %connection_id, remote = %remote_addr, "Connection registered");
        rx
    }

    /// Drop a connection entirely (disconnect).
    pub fn unregister(&self, connection_id: &ConnectionId) {
        self.leave_room(connection_id);
        if self.connections.remove(connection_id).is_some() {
            info!(connection = %connection_id, "Connection unregistered");
        }
    }

    /// Add a connection to a room's broadcast group, leaving any previous
    /// room first.
    pub fn join_room(&self, connection_id: &ConnectionId, room: &RoomCode) {
        self.leave_room(connection_id);

        let Some(mut meta) = self.connections.get_mut(connection_id) else {
            warn!(connection = %connection_id, "join_room for unknown connection");
            return;
        };
        meta.room = Some(room.clone());
        let subscriber = Subscriber {
            connection_id: connection_id.clone(),
            sender: meta.sender.clone(),
            consecutive_drops: Arc::new(AtomicU32::new(0)),
        };
        drop(meta);

        self.rooms.entry(room.clone()).or_default().push(subscriber);
        debug!(connection = %connection_id, room = %room, "Joined broadcast group");
    }

    /// Remove a connection from its room group, if any.
    pub fn leave_room(&self, connection_id: &ConnectionId) {
        let previous = self
            .connections
            .get_mut(connection_id)
            .and_then(|mut meta| meta.room.take());
        let Some(room) = previous else { return };

        if let Some(mut subscribers) = self.rooms.get_mut(&room) {
            subscribers.retain(|s| s.connection_id != *connection_id);
            if subscribers.is_empty() {
                drop(subscribers);
                self.rooms.remove(&room);
            }
        }
        debug!(connection = %connection_id, room = %room, "Left broadcast group");
    }

    pub fn set_fingerprint(&self, connection_id: &ConnectionId, fingerprint: Fingerprint) {
        if let Some(mut meta) = self.connections.get_mut(connection_id) {
            meta.fingerprint = Some(fingerprint);
        }
    }

    #[must_use]
    pub fn meta(&self, connection_id: &ConnectionId) -> Option<ConnectionMeta> {
        self.connections.get(connection_id).map(|m| m.clone())
    }

    #[must_use]
    pub fn room_of(&self, connection_id: &ConnectionId) -> Option<RoomCode> {
        self.connections
            .get(connection_id)
            .and_then(|m| m.room.clone())
    }

    /// Deliver an event to every member of a room exactly once. Returns the
    /// number of successful sends.
    pub fn broadcast_room(&self, room: &RoomCode, event: &ServerEvent) -> usize {
        let mut sent = 0;
        let mut evict = Vec::new();

        if let Some(subscribers) = self.rooms.get(room) {
            for subscriber in subscribers.iter() {
                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => {
                        subscriber.consecutive_drops.store(0, Ordering::Relaxed);
                        sent += 1;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let drops =
                            subscriber.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                        if drops >= MAX_CONSECUTIVE_DROPS {
                            warn!(
                                connection = %subscriber.connection_id,
                                room = %room,
                                drops,
                                "Evicting persistently slow subscriber"
                            );
                            evict.push(subscriber.connection_id.clone());
                        } else {
                            warn!(
                                connection = %subscriber.connection_id,
                                room = %room,
                                "Subscriber channel full, dropping event"
                            );
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        evict.push(subscriber.connection_id.clone());
                    }
                }
            }
        }

        // The room read guard is released before unregister takes writes.
        for connection_id in evict {
            self.unregister(&connection_id);
        }
        sent
    }

    /// Deliver to one connection.
    pub fn send_to(&self, connection_id: &ConnectionId, event: &ServerEvent) -> bool {
        let Some(meta) = self.connections.get(connection_id) else {
            return false;
        };
        match meta.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Targeted send failed");
                false
            }
        }
    }

    /// Deliver to every connection in a room bound to a fingerprint.
    pub fn send_to_fingerprint(
        &self,
        room: &RoomCode,
        fingerprint: &Fingerprint,
        event: &ServerEvent,
    ) -> usize {
        let mut sent = 0;
        if let Some(subscribers) = self.rooms.get(room) {
            for subscriber in subscribers.iter() {
                let matches = self
                    .connections
                    .get(&subscriber.connection_id)
                    .is_some_and(|meta| meta.fingerprint.as_ref() == Some(fingerprint));
                if matches && subscriber.sender.try_send(event.clone()).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Process-wide broadcast (e.g. `rooms-updated`).
    pub fn broadcast_global(&self, event: &ServerEvent) -> usize {
        let mut sent = 0;
        for meta in &self.connections {
            if meta.value().sender.try_send(event.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    #[must_use]
    pub fn members_of(&self, room: &RoomCode) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|subs| subs.iter().map(|s| s.connection_id.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn room_member_count(&self, room: &RoomCode) -> usize {
        self.rooms.get(room).map_or(0, |subs| subs.len())
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Shutdown teardown: drop every subscriber list and connection entry.
    /// Each write pump observes its closed channel, closes its socket, and
    /// the read loop unwinds, so the accept loop can finish draining.
    pub fn disconnect_all(&self) {
        let dropped = self.connections.len();
        self.rooms.clear();
        self.connections.clear();
        if dropped > 0 {
            info!(dropped, "Closed all connections for shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn local() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn sync_event() -> ServerEvent {
        ServerEvent::ViewerCount(1)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_once() {
        let hub = SessionHub::new();
        let room = RoomCode::normalize("ABC234");
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        let mut rx1 = hub.register(c1.clone(), local());
        let mut rx2 = hub.register(c2.clone(), local());
        hub.join_room(&c1, &room);
        hub.join_room(&c2, &room);

        assert_eq!(hub.broadcast_room(&room, &sync_event()), 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());
        assert!(rx1.try_recv().is_err(), "exactly once");
    }

    #[tokio::test]
    async fn leaving_stops_delivery() {
        let hub = SessionHub::new();
        let room = RoomCode::normalize("ABC234");
        let c1 = ConnectionId::new();
        let _rx = hub.register(c1.clone(), local());
        hub.join_room(&c1, &room);
        hub.leave_room(&c1);
        assert_eq!(hub.broadcast_room(&room, &sync_event()), 0);
        assert_eq!(hub.room_member_count(&room), 0);
    }

    #[tokio::test]
    async fn rejoining_moves_rooms() {
        let hub = SessionHub::new();
        let first = RoomCode::normalize("AAA234");
        let second = RoomCode::normalize("BBB234");
        let conn = ConnectionId::new();
        let _rx = hub.register(conn.clone(), local());
        hub.join_room(&conn, &first);
        hub.join_room(&conn, &second);
        assert_eq!(hub.room_member_count(&first), 0);
        assert_eq!(hub.room_member_count(&second), 1);
        assert_eq!(hub.room_of(&conn), Some(second));
    }

    #[tokio::test]
    async fn fingerprint_targeting_skips_other_devices() {
        let hub = SessionHub::new();
        let room = RoomCode::normalize("ABC234");
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        let mut rx1 = hub.register(c1.clone(), local());
        let mut rx2 = hub.register(c2.clone(), local());
        hub.join_room(&c1, &room);
        hub.join_room(&c2, &room);
        hub.set_fingerprint(&c1, Fingerprint::from("V1"));
        hub.set_fingerprint(&c2, Fingerprint::from("V2"));

        let event = ServerEvent::BslDriftUpdate {
            drift_values: std::collections::HashMap::from([(0, -3)]),
        };
        assert_eq!(
            hub.send_to_fingerprint(&room, &Fingerprint::from("V1"), &event),
            1
        );
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcasts_arrive_in_emission_order() {
        let hub = SessionHub::new();
        let room = RoomCode::normalize("ABC234");
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        let mut rx1 = hub.register(c1.clone(), local());
        let mut rx2 = hub.register(c2.clone(), local());
        hub.join_room(&c1, &room);
        hub.join_room(&c2, &room);

        for count in 0..5 {
            hub.broadcast_room(&room, &ServerEvent::ViewerCount(count));
        }
        for rx in [&mut rx1, &mut rx2] {
            for expected in 0..5 {
                match rx.recv().await {
                    Some(ServerEvent::ViewerCount(count)) => assert_eq!(count, expected),
                    other => panic!("unexpected event: {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn disconnect_all_closes_every_channel() {
        let hub = SessionHub::new();
        let room = RoomCode::normalize("ABC234");
        let c1 = ConnectionId::new();
        let c2 = ConnectionId::new();
        let mut rx1 = hub.register(c1.clone(), local());
        let mut rx2 = hub.register(c2.clone(), local());
        hub.join_room(&c1, &room);
        hub.join_room(&c2, &room);

        hub.disconnect_all();
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.room_member_count(&room), 0);
        // Receivers observe end-of-stream, which ends the write pumps.
        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_receiver_is_evicted_on_broadcast() {
        let hub = SessionHub::new();
        let room = RoomCode::normalize("ABC234");
        let conn = ConnectionId::new();
        let rx = hub.register(conn.clone(), local());
        hub.join_room(&conn, &room);
        drop(rx);

        assert_eq!(hub.broadcast_room(&room, &sync_event()), 0);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.room_member_count(&room), 0);
    }
}
