// src/state.rs

use crate::{
    connection::OUTBOUND_QUEUE_CAPACITY, database::MessageStore, hub::ConnectionHub,
    identity::IdentityProvider, presence::PresenceTracker,
};
use std::sync::Arc;

/// The application's shared state, accessible from all request handlers.
/// Built once in `main.rs` and handed to the router; every field is a cheap handle.
#[derive(Clone)]
pub struct AppState {
    pub hub: ConnectionHub,
    pub presence: Arc<PresenceTracker>,
    pub messages: Arc<dyn MessageStore>,
    pub identity: Arc<dyn IdentityProvider>,
    /// Capacity of each new connection's outbound queue.
    pub outbound_capacity: usize,
}

impl AppState {
    pub fn new(
        hub: ConnectionHub,
        presence: Arc<PresenceTracker>,
        messages: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            hub,
            presence,
            messages,
            identity,
            outbound_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }
}
