//! Integration tests: the real router on an ephemeral port, driven by websocket clients.

use futures_util::{SinkExt, StreamExt};
use realtime_chat::{
    database::{MemoryMessageStore, MemoryUserStore},
    hub::ConnectionHub,
    identity::{JwtIdentity, issue_token},
    models::{Envelope, RoomId, UserId},
    presence::PresenceTracker,
    routes::build_router,
    state::AppState,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

const SECRET: &[u8] = b"integration-secret";
const ROOM: RoomId = 5;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    hub: ConnectionHub,
    presence: Arc<PresenceTracker>,
    messages: Arc<MemoryMessageStore>,
}

async fn start_server() -> Server {
    let users = Arc::new(MemoryUserStore::new());
    users.insert_user(1, "alice");
    users.insert_user(2, "bob");
    let messages = Arc::new(MemoryMessageStore::new());
    let hub = ConnectionHub::new();
    let presence = Arc::new(PresenceTracker::new(users.clone()));

    let state = AppState::new(
        hub.clone(),
        presence.clone(),
        messages.clone(),
        Arc::new(JwtIdentity::new(SECRET, users)),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    Server {
        addr,
        hub,
        presence,
        messages,
    }
}

async fn connect(server: &Server, user_id: UserId) -> Client {
    let token = issue_token(SECRET, user_id, "u@example.com", chrono::Duration::hours(1)).unwrap();
    let url = format!("ws://{}/api/v1/chat/rooms/{ROOM}/ws?token={token}", server.addr);
    let (client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
}

/// Waits until the hub sees `count` members in the test room.
async fn wait_for_members(server: &Server, count: usize) {
    for _ in 0..100 {
        if server.hub.member_count(ROOM) == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room never reached {count} members");
}

/// Next envelopes from the server; a batched frame yields several.
async fn next_envelopes(client: &mut Client) -> Vec<Envelope> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return text
                .as_str()
                .split('\n')
                .map(|line| serde_json::from_str(line).unwrap())
                .collect();
        }
    }
}

/// Collects everything that arrives within a short quiet window.
async fn quiet_window(client: &mut Client) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Ok(Some(Ok(frame))) =
        tokio::time::timeout(Duration::from_millis(200), client.next()).await
    {
        if let Message::Text(text) = frame {
            out.extend(
                text.as_str()
                    .split('\n')
                    .map(|line| serde_json::from_str::<Envelope>(line).unwrap()),
            );
        }
    }
    out
}

async fn send(client: &mut Client, body: serde_json::Value) {
    client.send(Message::text(body.to_string())).await.unwrap();
}

#[tokio::test]
async fn join_message_and_persistence_scenario() {
    let server = start_server().await;

    let mut a = connect(&server, 1).await;
    wait_for_members(&server, 1).await;
    let mut b = connect(&server, 2).await;
    wait_for_members(&server, 2).await;

    let joined = next_envelopes(&mut a).await;
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0].kind, "user_joined");
    assert_eq!(joined[0].user_id, Some(2));
    assert!(quiet_window(&mut b).await.is_empty());

    send(&mut a, json!({"type": "message", "content": "hi"})).await;

    for client in [&mut a, &mut b] {
        let got = next_envelopes(client).await;
        assert_eq!(got[0].kind, "message");
        assert_eq!(got[0].content, json!("hi"));
        assert_eq!(got[0].user_id, Some(1));
        assert_eq!(got[0].username.as_deref(), Some("alice"));
    }

    for _ in 0..100 {
        if !server.messages.messages().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let saved = server.messages.messages();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].content, "hi");
    assert_eq!(saved[0].room_id, ROOM);
}

#[tokio::test]
async fn ping_is_answered_only_to_the_sender() {
    let server = start_server().await;
    let mut a = connect(&server, 1).await;
    wait_for_members(&server, 1).await;
    let mut b = connect(&server, 2).await;
    wait_for_members(&server, 2).await;
    let _ = next_envelopes(&mut a).await;

    send(&mut b, json!({"type": "ping"})).await;

    let got = next_envelopes(&mut b).await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].kind, "pong");
    assert!(quiet_window(&mut a).await.is_empty());
}

#[tokio::test]
async fn closing_a_socket_notifies_the_room_and_frees_it() {
    let server = start_server().await;
    let mut a = connect(&server, 1).await;
    wait_for_members(&server, 1).await;
    let mut b = connect(&server, 2).await;
    wait_for_members(&server, 2).await;
    let _ = next_envelopes(&mut a).await;

    b.close(None).await.unwrap();
    let left = next_envelopes(&mut a).await;
    assert_eq!(left[0].kind, "user_left");
    assert_eq!(left[0].user_id, Some(2));
    wait_for_members(&server, 1).await;

    a.close(None).await.unwrap();
    wait_for_members(&server, 0).await;
    assert_eq!(server.hub.room_count(), 0);
}

#[tokio::test]
async fn malformed_frames_keep_the_connection_open() {
    let server = start_server().await;
    let mut a = connect(&server, 1).await;
    wait_for_members(&server, 1).await;

    a.send(Message::text("{not json")).await.unwrap();
    send(&mut a, json!({"type": "chat", "content": ["not", "text"]})).await;
    send(&mut a, json!({"type": "chat", "content": "ok"})).await;

    let got = next_envelopes(&mut a).await;
    assert_eq!(got[0].content, json!("ok"));
    assert_eq!(server.hub.member_count(ROOM), 1);
}

#[tokio::test]
async fn upgrade_without_token_is_refused() {
    let server = start_server().await;
    let url = format!("ws://{}/api/v1/chat/rooms/{ROOM}/ws", server.addr);
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected an HTTP rejection, got {other:?}"),
    }
    assert_eq!(server.hub.room_count(), 0);
}

#[tokio::test]
async fn open_socket_and_heartbeat_presence_are_independent() {
    let server = start_server().await;
    let _a = connect(&server, 1).await;
    wait_for_members(&server, 1).await;

    // Connected over the socket, but never heartbeated.
    assert!(!server.presence.is_online(1));

    // Heartbeating without any socket.
    server.presence.heartbeat(2);
    assert!(server.presence.is_online(2));
    assert_eq!(server.hub.member_count(ROOM), 1);
    assert_eq!(server.presence.online_users(), vec![2]);
}
