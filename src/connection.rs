// src/connection.rs

use crate::models::{Payload, RoomId, UserId};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Default capacity of a connection's outbound queue.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub type ConnectionId = Uuid;

/// Lifecycle of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Active,
    /// Observed only between a fan-out finding the queue full and the forced unregister.
    Backpressured,
    Closed,
}

/// Outcome of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    Full,
    Closed,
}

/// Per-socket state: who is on the other end, which room they are in, and
/// the bounded queue feeding their write task.
///
/// The queue has exactly one sender, held here. Dropping it via [`Connection::close`]
/// is what tells the write task to send a close frame and stop.
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    pub room_id: RoomId,
    outbound: Mutex<Option<mpsc::Sender<Payload>>>,
    state: Mutex<ConnectionState>,
}

impl Connection {
    /// Creates a connection in the `Connecting` state together with the
    /// receiving end of its outbound queue.
    pub fn new(
        user_id: UserId,
        username: impl Into<String>,
        room_id: RoomId,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id: Uuid::new_v4(),
            user_id,
            username: username.into(),
            room_id,
            outbound: Mutex::new(Some(tx)),
            state: Mutex::new(ConnectionState::Connecting),
        };
        (Arc::new(conn), rx)
    }

    /// Pushes a payload without waiting for room in the queue.
    pub fn try_enqueue(&self, payload: Payload) -> Enqueue {
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Enqueue::Closed;
        };
        match tx.try_send(payload) {
            Ok(()) => Enqueue::Queued,
            Err(TrySendError::Full(_)) => Enqueue::Full,
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Closes the outbound queue. Returns `true` only for the call that actually closed it.
    pub(crate) fn close(&self) -> bool {
        let closed = self.outbound.lock().take().is_some();
        *self.state.lock() = ConnectionState::Closed;
        closed
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Moves to `next` unless the connection is already closed.
    pub(crate) fn transition(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state != ConnectionState::Closed {
            *state = next;
        }
    }

    /// `Registered -> Active` on the first frame in either direction.
    pub(crate) fn mark_active(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Registered {
            *state = ConnectionState::Active;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("room_id", &self.room_id)
            .field("state", &self.state())
            .finish()
    }
}
