// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Identifier of a user account, as issued by the user store.
pub type UserId = i64;

/// Identifier of a chat room.
pub type RoomId = i64;

/// Server-synthesized type tags.
pub const USER_JOINED: &str = "user_joined";
pub const USER_LEFT: &str = "user_left";
pub const PONG: &str = "pong";

/// The wire message exchanged over a chat connection, in both directions.
///
/// Clients only need to send `type` and `content`; the server stamps the
/// remaining fields before anything leaves it. Unset fields are omitted
/// from the serialized form.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// How the read side treats an inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Connected,
    Ping,
    Chat,
    Other,
}

impl MessageKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "connected" => Self::Connected,
            "ping" => Self::Ping,
            "message" | "chat" => Self::Chat,
            _ => Self::Other,
        }
    }
}

impl Envelope {
    /// Parses a client frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn message_kind(&self) -> MessageKind {
        MessageKind::from_tag(&self.kind)
    }

    /// Stamps sender identity and the server clock onto a client envelope.
    pub fn stamp(mut self, user_id: UserId, username: &str) -> Self {
        self.user_id = Some(user_id);
        self.username = Some(username.to_string());
        self.timestamp = Some(Utc::now());
        self
    }

    pub fn pong() -> Self {
        Self {
            kind: PONG.to_string(),
            content: Value::String(PONG.to_string()),
            timestamp: Some(Utc::now()),
            user_id: None,
            username: None,
        }
    }

    pub fn user_joined(user_id: UserId, username: &str) -> Self {
        Self::notice(USER_JOINED, format!("{username} joined the room"), user_id, username)
    }

    pub fn user_left(user_id: UserId, username: &str) -> Self {
        Self::notice(USER_LEFT, format!("{username} left the room"), user_id, username)
    }

    fn notice(kind: &str, content: String, user_id: UserId, username: &str) -> Self {
        Self {
            kind: kind.to_string(),
            content: Value::String(content),
            timestamp: Some(Utc::now()),
            user_id: Some(user_id),
            username: Some(username.to_string()),
        }
    }

    /// Serializes into the shared payload handed to the hub.
    pub fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        serde_json::to_string(self).map(Payload::from)
    }
}

/// A serialized outbound frame. Shared between every recipient of a fan-out.
pub type Payload = Arc<str>;

/// An instruction to fan `payload` out to the current membership of `room_id`.
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub room_id: RoomId,
    pub payload: Payload,
}
