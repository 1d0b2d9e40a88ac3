// src/hub.rs

use crate::{
    connection::{Connection, ConnectionId, ConnectionState, Enqueue},
    models::{BroadcastMessage, Envelope, Payload, RoomId},
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A room's live membership. Only exists in the registry while non-empty.
#[derive(Default)]
struct Room {
    clients: HashMap<ConnectionId, Arc<Connection>>,
}

type Registry = HashMap<RoomId, Room>;

/// Owns the room registry and the fan-out to live connections.
///
/// Every mutation happens under one exclusive lock, so a room's membership is
/// only ever seen after a complete register or unregister. Nothing is awaited
/// while the lock is held: enqueues are non-blocking and a recipient whose
/// queue is full is dropped on the spot.
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    rooms: Arc<Mutex<Registry>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` to its room, creating the room if needed, then tells the
    /// other members that the user joined.
    ///
    /// A closed connection is never re-registered.
    pub fn register(&self, conn: &Arc<Connection>) {
        {
            let mut rooms = self.rooms.lock();
            if conn.is_closed() {
                debug!(conn_id = %conn.id, "refusing to register a closed connection");
                return;
            }
            let room = rooms.entry(conn.room_id).or_default();
            room.clients.insert(conn.id, Arc::clone(conn));
            conn.transition(ConnectionState::Registered);
            info!(
                conn_id = %conn.id,
                user_id = conn.user_id,
                room_id = conn.room_id,
                members = room.clients.len(),
                "client registered"
            );
        }

        let notice = Envelope::user_joined(conn.user_id, &conn.username);
        self.announce(conn.room_id, &notice, Some(conn.id));
    }

    /// Removes `conn` from its room and closes its outbound queue.
    ///
    /// Unregistering a connection that is not currently registered only makes
    /// sure its queue is closed. Returns whether the connection was removed.
    pub fn unregister(&self, conn: &Connection) -> bool {
        let removed = {
            let mut rooms = self.rooms.lock();
            let removed = remove_locked(&mut rooms, conn);
            // Closed under the lock, so a racing register sees it.
            let _ = conn.close();
            removed
        };

        if removed {
            let notice = Envelope::user_left(conn.user_id, &conn.username);
            self.announce(conn.room_id, &notice, None);
        }
        removed
    }

    /// Delivers `payload` to every connection in `room_id` at the time of the call.
    ///
    /// Never blocks: a recipient whose queue is full is forcibly unregistered
    /// before this returns, and delivery to the others is unaffected.
    pub fn broadcast(&self, room_id: RoomId, payload: impl Into<Payload>) {
        self.fan_out(
            BroadcastMessage {
                room_id,
                payload: payload.into(),
            },
            None,
        );
    }

    /// Snapshot of the connection ids currently in `room_id`.
    pub fn room_members(&self, room_id: RoomId) -> Vec<ConnectionId> {
        self.rooms
            .lock()
            .get(&room_id)
            .map(|room| room.clients.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room_id: RoomId) -> usize {
        self.rooms
            .lock()
            .get(&room_id)
            .map_or(0, |room| room.clients.len())
    }

    /// Number of rooms with at least one live connection.
    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn is_registered(&self, conn: &Connection) -> bool {
        self.rooms
            .lock()
            .get(&conn.room_id)
            .is_some_and(|room| room.clients.contains_key(&conn.id))
    }

    fn announce(&self, room_id: RoomId, notice: &Envelope, exclude: Option<ConnectionId>) {
        match notice.to_payload() {
            Ok(payload) => self.fan_out(BroadcastMessage { room_id, payload }, exclude),
            Err(e) => warn!(room_id, error = %e, "failed to serialize room notice"),
        }
    }

    /// Runs a broadcast and the `user_left` notices of any connection it evicts.
    fn fan_out(&self, first: BroadcastMessage, exclude: Option<ConnectionId>) {
        let mut pending = VecDeque::from([(first, exclude)]);
        while let Some((message, exclude)) = pending.pop_front() {
            for evicted in self.deliver(&message, exclude) {
                let notice = Envelope::user_left(evicted.user_id, &evicted.username);
                match notice.to_payload() {
                    Ok(payload) => pending.push_back((
                        BroadcastMessage {
                            room_id: evicted.room_id,
                            payload,
                        },
                        None,
                    )),
                    Err(e) => warn!(error = %e, "failed to serialize room notice"),
                }
            }
        }
    }

    /// Enqueues onto every member except `exclude`; returns the members that were evicted.
    fn deliver(
        &self,
        message: &BroadcastMessage,
        exclude: Option<ConnectionId>,
    ) -> Vec<Arc<Connection>> {
        let mut rooms = self.rooms.lock();
        let Some(room) = rooms.get(&message.room_id) else {
            return Vec::new();
        };

        let mut failed = Vec::new();
        let mut delivered = 0usize;
        for (id, conn) in &room.clients {
            if exclude == Some(*id) {
                continue;
            }
            match conn.try_enqueue(Arc::clone(&message.payload)) {
                Enqueue::Queued => delivered += 1,
                Enqueue::Full => {
                    conn.transition(ConnectionState::Backpressured);
                    warn!(
                        conn_id = %conn.id,
                        user_id = conn.user_id,
                        room_id = message.room_id,
                        "outbound queue full, dropping client"
                    );
                    failed.push(Arc::clone(conn));
                }
                Enqueue::Closed => {
                    debug!(conn_id = %conn.id, "outbound queue already closed, dropping client");
                    failed.push(Arc::clone(conn));
                }
            }
        }
        debug!(room_id = message.room_id, delivered, dropped = failed.len(), "broadcast");

        for conn in &failed {
            let _ = remove_locked(&mut rooms, conn);
        }
        failed
    }
}

/// Removes `conn` from the registry, closing its queue and dropping its room if emptied.
fn remove_locked(rooms: &mut Registry, conn: &Connection) -> bool {
    let Some(room) = rooms.get_mut(&conn.room_id) else {
        return false;
    };
    if room.clients.remove(&conn.id).is_none() {
        return false;
    }
    let _ = conn.close();
    info!(
        conn_id = %conn.id,
        user_id = conn.user_id,
        room_id = conn.room_id,
        remaining = room.clients.len(),
        "client unregistered"
    );
    if room.clients.is_empty() {
        let _ = rooms.remove(&conn.room_id);
        debug!(room_id = conn.room_id, "room deleted (no clients)");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{USER_JOINED, USER_LEFT};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn connect(
        hub: &ConnectionHub,
        user_id: i64,
        room_id: RoomId,
        capacity: usize,
    ) -> (Arc<Connection>, mpsc::Receiver<Payload>) {
        let (conn, rx) = Connection::new(user_id, format!("user{user_id}"), room_id, capacity);
        hub.register(&conn);
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Payload>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(serde_json::from_str(&payload).unwrap());
        }
        out
    }

    #[test]
    fn room_exists_only_while_occupied() {
        let hub = ConnectionHub::new();
        assert_eq!(hub.room_count(), 0);

        let (a, _ra) = connect(&hub, 1, 7, 8);
        let (b, _rb) = connect(&hub, 2, 7, 8);
        assert_eq!(hub.room_count(), 1);
        assert_eq!(hub.member_count(7), 2);

        assert!(hub.unregister(&a));
        assert_eq!(hub.room_count(), 1);
        assert!(hub.unregister(&b));
        assert_eq!(hub.room_count(), 0);
        assert!(hub.room_members(7).is_empty());
    }

    #[test]
    fn interleaved_rooms_keep_the_invariant() {
        let hub = ConnectionHub::new();
        let mut live = Vec::new();
        for i in 0..12 {
            live.push(connect(&hub, i, i % 3, 32));
        }
        assert_eq!(hub.room_count(), 3);

        // Empty room 1 completely, leave one member in room 2.
        for (conn, _) in &live {
            if conn.room_id == 1 || (conn.room_id == 2 && conn.user_id != 2) {
                let _ = hub.unregister(conn);
            }
        }
        assert_eq!(hub.room_count(), 2);
        assert_eq!(hub.member_count(1), 0);
        assert_eq!(hub.member_count(2), 1);
        assert_eq!(hub.member_count(0), 4);
    }

    #[test]
    fn join_notice_goes_to_existing_members_only() {
        let hub = ConnectionHub::new();
        let (a, mut ra) = connect(&hub, 1, 7, 8);
        assert!(drain(&mut ra).is_empty());

        let (_b, mut rb) = connect(&hub, 2, 7, 8);
        let seen_by_a = drain(&mut ra);
        assert_eq!(seen_by_a.len(), 1);
        assert_eq!(seen_by_a[0].kind, USER_JOINED);
        assert_eq!(seen_by_a[0].user_id, Some(2));
        assert!(drain(&mut rb).is_empty());
        assert_eq!(a.state(), ConnectionState::Registered);
    }

    #[test]
    fn broadcast_reaches_only_the_target_room() {
        let hub = ConnectionHub::new();
        let (_a, mut ra) = connect(&hub, 1, 7, 8);
        let (_b, mut rb) = connect(&hub, 2, 7, 8);
        let (_c, mut rc) = connect(&hub, 3, 8, 8);
        let _ = drain(&mut ra);

        hub.broadcast(7, r#"{"type":"message","content":"hi"}"#);

        assert_eq!(drain(&mut ra)[0].content, json!("hi"));
        assert_eq!(drain(&mut rb)[0].content, json!("hi"));
        assert!(drain(&mut rc).is_empty());
    }

    #[test]
    fn broadcast_to_missing_room_is_a_no_op() {
        let hub = ConnectionHub::new();
        hub.broadcast(99, "{}");
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn later_joiner_does_not_see_earlier_broadcast() {
        let hub = ConnectionHub::new();
        let (_a, _ra) = connect(&hub, 1, 7, 8);
        hub.broadcast(7, r#"{"type":"message","content":"early"}"#);
        let (_b, mut rb) = connect(&hub, 2, 7, 8);
        assert!(drain(&mut rb).is_empty());
    }

    #[test]
    fn saturated_recipient_is_evicted_and_others_still_receive() {
        let hub = ConnectionHub::new();
        let (a, mut ra) = connect(&hub, 1, 7, 1);
        let (b, mut rb) = connect(&hub, 2, 7, 8);
        // A's single slot already holds B's join notice.
        assert_eq!(a.try_enqueue(Payload::from("filler")), Enqueue::Full);

        hub.broadcast(7, r#"{"type":"message","content":"after"}"#);

        assert!(!hub.is_registered(&a));
        assert!(a.is_closed());
        assert!(hub.is_registered(&b));
        assert_eq!(hub.member_count(7), 1);

        let seen_by_b = drain(&mut rb);
        assert_eq!(seen_by_b.len(), 2);
        assert_eq!(seen_by_b[0].content, json!("after"));
        assert_eq!(seen_by_b[1].kind, USER_LEFT);
        assert_eq!(seen_by_b[1].user_id, Some(1));

        // A keeps whatever was queued before eviction, then the queue ends.
        assert_eq!(drain(&mut ra).len(), 1);
        assert!(matches!(
            ra.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));

        hub.broadcast(7, r#"{"type":"message","content":"later"}"#);
        assert_eq!(drain(&mut rb).len(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let hub = ConnectionHub::new();
        let (a, _ra) = connect(&hub, 1, 7, 8);
        let (_b, mut rb) = connect(&hub, 2, 7, 8);

        assert!(hub.unregister(&a));
        assert!(!hub.unregister(&a));

        let left: Vec<_> = drain(&mut rb)
            .into_iter()
            .filter(|e| e.kind == USER_LEFT)
            .collect();
        assert_eq!(left.len(), 1);
    }

    #[test]
    fn unregistering_an_unknown_connection_closes_its_queue() {
        let hub = ConnectionHub::new();
        let (stray, mut rx) = Connection::new(5, "stray", 7, 4);
        assert!(!hub.unregister(&stray));
        assert!(stray.is_closed());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn closed_connection_is_not_reused() {
        let hub = ConnectionHub::new();
        let (a, _ra) = connect(&hub, 1, 7, 8);
        let _ = hub.unregister(&a);
        hub.register(&a);
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn concurrent_register_and_unregister_leave_no_empty_rooms() {
        let hub = ConnectionHub::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let hub = hub.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let (conn, _rx) = Connection::new(t * 100 + i, "u", i % 4, 4);
                        hub.register(&conn);
                        hub.broadcast(i % 4, "{}");
                        let _ = hub.unregister(&conn);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(hub.room_count(), 0);
    }

    #[test]
    fn racing_register_and_unregister_never_leave_a_closed_member() {
        for round in 0..200 {
            let hub = ConnectionHub::new();
            let (conn, _rx) = Connection::new(round, "u", 3, 4);
            let registrar = {
                let hub = hub.clone();
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || hub.register(&conn))
            };
            let _ = hub.unregister(&conn);
            registrar.join().unwrap();

            assert!(conn.is_closed());
            assert!(!hub.is_registered(&conn));
            assert_eq!(hub.room_count(), 0);
        }
    }
}
