// src/database.rs

use crate::{
    error::StoreError,
    models::{RoomId, UserId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::{Row, postgres::PgPool};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Durable chat history. Called off the delivery path; a failure never blocks a broadcast.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists one chat message and returns its record id.
    async fn create(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<i64, StoreError>;
}

/// Durable user records: the online flag mirrored from presence, and display names.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn update_online_status(
        &self,
        user_id: UserId,
        is_online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn username(&self, user_id: UserId) -> Result<Option<String>, StoreError>;
}

/// Connects to PostgreSQL and creates the tables this service writes to if they don't exist.
pub async fn setup_database(url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPool::connect(url).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            is_online BOOLEAN NOT NULL DEFAULT FALSE,
            last_seen_at TIMESTAMPTZ
        )",
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS messages (
            id BIGSERIAL PRIMARY KEY,
            room_id BIGINT NOT NULL,
            sender_id BIGINT NOT NULL,
            content TEXT NOT NULL,
            is_read BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS messages_room_id_idx ON messages (room_id)")
        .execute(&pool)
        .await?;

    info!("PostgreSQL database setup complete");
    Ok(pool)
}

/// PostgreSQL-backed message and user store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn create(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO messages (room_id, sender_id, content) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(room_id)
        .bind(sender_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("id")?)
    }
}

#[async_trait]
impl UserStore for PgStore {
    async fn update_online_status(
        &self,
        user_id: UserId,
        is_online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET is_online = $1, last_seen_at = $2 WHERE id = $3")
            .bind(is_online)
            .bind(last_seen_at)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(user_id));
        }
        Ok(())
    }

    async fn username(&self, user_id: UserId) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT name FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<String, _>("name")?)),
            None => Ok(None),
        }
    }
}

/// A persisted chat message, as recorded by [`MemoryMessageStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub content: String,
}

/// In-process message store, used when no database is configured.
#[derive(Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(
        &self,
        room_id: RoomId,
        sender_id: UserId,
        content: &str,
    ) -> Result<i64, StoreError> {
        let mut messages = self.messages.lock();
        let id = messages.len() as i64 + 1;
        messages.push(StoredMessage {
            id,
            room_id,
            sender_id,
            content: content.to_string(),
        });
        Ok(id)
    }
}

/// One `update_online_status` call, as recorded by [`MemoryUserStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// In-process user store. Records every status update it accepts.
#[derive(Default)]
pub struct MemoryUserStore {
    names: Mutex<HashMap<UserId, String>>,
    updates: Mutex<Vec<StatusUpdate>>,
    failing: AtomicBool,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user_id: UserId, name: impl Into<String>) {
        let _ = self.names.lock().insert(user_id, name.into());
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().clone()
    }

    pub fn updates_for(&self, user_id: UserId) -> Vec<StatusUpdate> {
        self.updates
            .lock()
            .iter()
            .filter(|u| u.user_id == user_id)
            .copied()
            .collect()
    }

    /// Makes every subsequent status update fail, to simulate an unavailable database.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn update_online_status(
        &self,
        user_id: UserId,
        is_online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.updates.lock().push(StatusUpdate {
            user_id,
            is_online,
            last_seen_at,
        });
        Ok(())
    }

    async fn username(&self, user_id: UserId) -> Result<Option<String>, StoreError> {
        Ok(self.names.lock().get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_message_store_assigns_sequential_ids() {
        let store = MemoryMessageStore::new();
        assert_eq!(store.create(1, 2, "hi").await.unwrap(), 1);
        assert_eq!(store.create(1, 3, "yo").await.unwrap(), 2);
        let messages = store.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].sender_id, 3);
        assert_eq!(messages[1].content, "yo");
    }

    #[tokio::test]
    async fn memory_user_store_records_updates() {
        let store = MemoryUserStore::new();
        store.insert_user(4, "dana");
        assert_eq!(store.username(4).await.unwrap().as_deref(), Some("dana"));
        assert!(store.username(5).await.unwrap().is_none());

        store.update_online_status(4, true, Utc::now()).await.unwrap();
        store.set_failing(true);
        assert!(store.update_online_status(4, false, Utc::now()).await.is_err());
        let updates = store.updates_for(4);
        assert_eq!(updates.len(), 1);
        assert!(updates[0].is_online);
    }
}
