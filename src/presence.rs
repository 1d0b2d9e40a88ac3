// src/presence.rs

use crate::{database::UserStore, models::UserId};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

/// A user with no heartbeat for this long is offline.
pub const PRESENCE_TTL: Duration = Duration::from_secs(2 * 60);

/// Period of the background pass that evicts stale entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat-driven liveness, independent of open chat sockets.
///
/// The in-memory map is the source of truth for [`is_online`](Self::is_online)
/// and [`online_users`](Self::online_users). The user store is told about
/// changes after the fact by a single writer task, which applies them in the
/// order the map changed. Its latency or failures never reach callers.
///
/// Timestamps use tokio's clock, which tests pause and advance.
pub struct PresenceTracker {
    last_seen: RwLock<HashMap<UserId, Instant>>,
    users: Arc<dyn UserStore>,
    writer: OnceLock<mpsc::UnboundedSender<StatusChange>>,
    ttl: Duration,
}

/// A pending write to the user store.
#[derive(Debug, Clone, Copy)]
struct StatusChange {
    user_id: UserId,
    is_online: bool,
    at: DateTime<Utc>,
}

impl PresenceTracker {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self::with_ttl(users, PRESENCE_TTL)
    }

    pub fn with_ttl(users: Arc<dyn UserStore>, ttl: Duration) -> Self {
        Self {
            last_seen: RwLock::new(HashMap::new()),
            users,
            writer: OnceLock::new(),
            ttl,
        }
    }

    /// Refreshes `user_id`'s last heartbeat.
    pub fn heartbeat(&self, user_id: UserId) {
        let mut last_seen = self.last_seen.write();
        let _ = last_seen.insert(user_id, Instant::now());
        self.propagate(user_id, true);
        drop(last_seen);
        debug!(user_id, "heartbeat");
    }

    /// Marks `user_id` online. Same effect as a heartbeat.
    pub fn user_connected(&self, user_id: UserId) {
        let mut last_seen = self.last_seen.write();
        let _ = last_seen.insert(user_id, Instant::now());
        self.propagate(user_id, true);
        drop(last_seen);
        info!(user_id, "user connected");
    }

    /// Marks `user_id` offline right away, without waiting for the TTL.
    pub fn user_disconnected(&self, user_id: UserId) {
        let mut last_seen = self.last_seen.write();
        let _ = last_seen.remove(&user_id);
        self.propagate(user_id, false);
        drop(last_seen);
        info!(user_id, "user disconnected");
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        let now = Instant::now();
        self.last_seen
            .read()
            .get(&user_id)
            .is_some_and(|seen| self.is_fresh(now, *seen))
    }

    /// Every user whose last heartbeat is within the TTL, in ascending id order.
    pub fn online_users(&self) -> Vec<UserId> {
        let now = Instant::now();
        let mut online: Vec<UserId> = self
            .last_seen
            .read()
            .iter()
            .filter(|(_, seen)| self.is_fresh(now, **seen))
            .map(|(user_id, _)| *user_id)
            .collect();
        online.sort_unstable();
        online
    }

    /// Evicts every stale entry and reports each eviction to the user store.
    /// Returns the evicted users.
    pub fn sweep(&self) -> Vec<UserId> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut last_seen = self.last_seen.write();
            last_seen.retain(|user_id, seen| {
                let fresh = self.is_fresh(now, *seen);
                if !fresh {
                    evicted.push(*user_id);
                }
                fresh
            });
            for user_id in &evicted {
                self.propagate(*user_id, false);
            }
        }

        for user_id in &evicted {
            info!(user_id, "presence expired, marking offline");
        }
        evicted
    }

    /// Starts the periodic sweep on the current runtime.
    pub fn start_sweep(self: &Arc<Self>, period: Duration) -> SweepHandle {
        let tracker = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the first immediate tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = tracker.sweep();
                if !evicted.is_empty() {
                    debug!(count = evicted.len(), "presence sweep evicted users");
                }
            }
        });
        SweepHandle { task }
    }

    fn is_fresh(&self, now: Instant, seen: Instant) -> bool {
        now.saturating_duration_since(seen) < self.ttl
    }

    /// Queues a store write. Callers hold the map's write lock, so writes for
    /// a user reach the store in the same order as the map changes.
    fn propagate(&self, user_id: UserId, is_online: bool) {
        let change = StatusChange {
            user_id,
            is_online,
            at: Utc::now(),
        };
        let writer = self.writer.get_or_init(|| spawn_writer(Arc::clone(&self.users)));
        if writer.send(change).is_err() {
            warn!(user_id, is_online, "presence writer gone, status update dropped");
        }
    }
}

/// Starts the task that applies status changes one at a time, in queue order.
/// It ends once the tracker, and with it the sender, is dropped.
fn spawn_writer(users: Arc<dyn UserStore>) -> mpsc::UnboundedSender<StatusChange> {
    let (tx, mut rx) = mpsc::unbounded_channel::<StatusChange>();
    let _ = tokio::spawn(async move {
        while let Some(change) = rx.recv().await {
            if let Err(e) = users
                .update_online_status(change.user_id, change.is_online, change.at)
                .await
            {
                warn!(
                    user_id = change.user_id,
                    is_online = change.is_online,
                    error = %e,
                    "failed to update online status"
                );
            }
        }
        debug!("presence writer stopped");
    });
    tx
}

/// Owner of the background sweep task. The sweep runs until [`SweepHandle::stop`].
pub struct SweepHandle {
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn stop(self) {
        self.task.abort();
        info!("presence sweep stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
