// src/websocket.rs

use crate::{
    connection::{Connection, Enqueue},
    database::MessageStore,
    error::FrameError,
    hub::ConnectionHub,
    identity::{AuthUser, Identity},
    models::{Envelope, MessageKind, Payload, RoomId},
    state::AppState,
};
use axum::{
    body::Bytes,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{
    sink::{Sink, SinkExt},
    stream::{Stream, StreamExt},
};
use serde_json::Value;
use std::{fmt::Display, sync::Arc, time::Duration};
use tokio::{sync::mpsc, time::timeout};
use tracing::{debug, info, warn};

/// Time allowed to write one frame to the peer.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between two frames from the peer, pongs included.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Interval between liveness pings. Must stay below `PONG_WAIT`.
pub const PING_PERIOD: Duration = Duration::from_secs(PONG_WAIT.as_secs() * 9 / 10);

/// Largest inbound frame accepted; bigger frames are dropped.
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// `GET /api/v1/chat/rooms/{id}/ws`: upgrades an authenticated caller into a room connection.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(room_id): Path<RoomId>,
    AuthUser(identity): AuthUser,
) -> impl IntoResponse {
    info!(
        user_id = identity.user_id,
        username = %identity.username,
        room_id,
        "user joining room"
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity, room_id))
}

/// Manages the lifecycle of one upgraded socket.
async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity, room_id: RoomId) {
    let (conn, outbound) = Connection::new(
        identity.user_id,
        identity.username,
        room_id,
        state.outbound_capacity,
    );
    let (sink, stream) = socket.split();
    run_connection(conn, outbound, sink, stream, state.hub, state.messages).await;
}

/// Registers `conn` and drives its read and write pumps until either stops.
///
/// The writer runs as its own task; the reader runs here. Whichever finishes
/// first ends the other: a finished reader unregisters, which closes the queue
/// and lets the writer send its close frame; a finished writer cancels the reader.
pub async fn run_connection<W, R, E>(
    conn: Arc<Connection>,
    outbound: mpsc::Receiver<Payload>,
    sink: W,
    stream: R,
    hub: ConnectionHub,
    messages: Arc<dyn MessageStore>,
) where
    W: Sink<Message> + Send + Unpin + 'static,
    W::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    hub.register(&conn);

    let mut write_task = tokio::spawn(write_pump(
        Arc::clone(&conn),
        outbound,
        sink,
        hub.clone(),
    ));

    let writer_finished = tokio::select! {
        () = read_pump(&conn, stream, &hub, &messages) => false,
        _ = &mut write_task => true,
    };

    // No-op when a pump already did it.
    let _ = hub.unregister(&conn);

    if !writer_finished && timeout(WRITE_WAIT, &mut write_task).await.is_err() {
        warn!(conn_id = %conn.id, "writer did not finish in time, aborting");
        write_task.abort();
    }
    info!(conn_id = %conn.id, user_id = conn.user_id, room_id = conn.room_id, "connection closed");
}

/// The only reader of the socket. Exits on a read error, a close frame, the end
/// of the stream, or `PONG_WAIT` of silence, and then unregisters the connection.
pub async fn read_pump<R, E>(
    conn: &Arc<Connection>,
    mut stream: R,
    hub: &ConnectionHub,
    messages: &Arc<dyn MessageStore>,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let frame = match timeout(PONG_WAIT, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                warn!(conn_id = %conn.id, error = %e, "websocket receive error");
                break;
            }
            Ok(None) => {
                debug!(conn_id = %conn.id, "websocket stream ended");
                break;
            }
            Err(_) => {
                info!(conn_id = %conn.id, "read deadline exceeded");
                break;
            }
        };
        conn.mark_active();

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text.into(),
                Err(_) => {
                    warn!(conn_id = %conn.id, "dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Close(frame) => {
                info!(conn_id = %conn.id, reason = ?frame, "client initiated close");
                break;
            }
            // Control frames only refresh the read deadline.
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if let Err(e) = handle_text(conn, text.as_str(), hub, messages) {
            warn!(conn_id = %conn.id, user_id = conn.user_id, error = %e, "dropping inbound frame");
        }
    }

    let _ = hub.unregister(conn);
}

/// Decodes one client frame and dispatches on its type tag.
fn handle_text(
    conn: &Connection,
    text: &str,
    hub: &ConnectionHub,
    messages: &Arc<dyn MessageStore>,
) -> Result<(), FrameError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(FrameError::TooLarge {
            size: text.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }
    let envelope = Envelope::parse(text)?;

    match envelope.message_kind() {
        MessageKind::Connected => {
            info!(conn_id = %conn.id, room_id = conn.room_id, "client confirmed connection");
        }
        MessageKind::Ping => {
            // Replies go straight onto the sender's own queue, never through the hub.
            let pong = Envelope::pong().to_payload()?;
            if conn.try_enqueue(pong) != Enqueue::Queued {
                debug!(conn_id = %conn.id, "pong dropped, outbound queue unavailable");
            }
        }
        MessageKind::Chat => {
            let Value::String(content) = &envelope.content else {
                return Err(FrameError::NonTextContent);
            };
            let content = content.clone();
            let payload = envelope.stamp(conn.user_id, &conn.username).to_payload()?;
            persist(messages, conn, content);
            hub.broadcast(conn.room_id, payload);
        }
        MessageKind::Other => {
            let payload = envelope.stamp(conn.user_id, &conn.username).to_payload()?;
            hub.broadcast(conn.room_id, payload);
        }
    }
    Ok(())
}

/// Saves a chat message in the background. Delivery never waits on it.
fn persist(messages: &Arc<dyn MessageStore>, conn: &Connection, content: String) {
    let messages = Arc::clone(messages);
    let (room_id, sender_id) = (conn.room_id, conn.user_id);
    let _ = tokio::spawn(async move {
        match messages.create(room_id, sender_id, &content).await {
            Ok(message_id) => debug!(message_id, room_id, sender_id, "message saved"),
            Err(e) => warn!(room_id, sender_id, error = %e, "failed to save message"),
        }
    });
}

/// The only writer of the socket. Sends queued payloads, batching whatever is
/// already waiting into one frame, and pings every `PING_PERIOD`. When the
/// queue closes it sends a close frame and stops; a failed write unregisters
/// the connection.
pub async fn write_pump<W>(
    conn: Arc<Connection>,
    mut outbound: mpsc::Receiver<Payload>,
    mut sink: W,
    hub: ConnectionHub,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ticker = tokio::time::interval(PING_PERIOD);
    // Skip the first immediate tick
    ticker.tick().await;

    loop {
        let frame = tokio::select! {
            next = outbound.recv() => match next {
                Some(first) => Message::Text(coalesce(&first, &mut outbound).into()),
                None => {
                    // The hub closed the queue.
                    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                    debug!(conn_id = %conn.id, "writer stopped");
                    return;
                }
            },
            _ = ticker.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(WRITE_WAIT, sink.send(frame)).await {
            Ok(Ok(())) => conn.mark_active(),
            Ok(Err(e)) => {
                warn!(conn_id = %conn.id, error = %e, "websocket write failed");
                break;
            }
            Err(_) => {
                warn!(conn_id = %conn.id, "write deadline exceeded");
                break;
            }
        }
    }

    let _ = hub.unregister(&conn);
}

/// Joins `first` with the payloads queued right now, newline-separated.
fn coalesce(first: &str, outbound: &mut mpsc::Receiver<Payload>) -> String {
    let queued = outbound.len();
    let mut batch = String::from(first);
    for _ in 0..queued {
        match outbound.try_recv() {
            Ok(next) => {
                batch.push('\n');
                batch.push_str(&next);
            }
            Err(_) => break,
        }
    }
    batch
}
