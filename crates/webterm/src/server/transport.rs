//! Per-connection socket pumps for the live channel.
//!
//! The hub owns registration and routing; this module only moves frames
//! between one socket and its hub client queue, and keeps the connection
//! alive with pings.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};
use webterm_daemon::hub::{ClientConnection, ClientId, WsMessage};
use webterm_daemon::{Hub, HubError, SessionId};

use super::{ApiError, AppState, ConnectionSlot};

/// Interval between keepalive pings.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
/// How long a single outbound write may take.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Connection is dropped when nothing arrives for this long.
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Largest accepted inbound message.
pub const MAX_FRAME_BYTES: usize = 8192;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    session: Option<String>,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> Response {
    let slot = match state.acquire_connection() {
        Ok(slot) => slot,
        Err(e) => {
            warn!(error = %e, "Refusing live connection");
            return ApiError::from(e).into_response();
        }
    };
    let session_id = params
        .session
        .and_then(|raw| SessionId::try_new(raw).ok());

    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| serve_socket(socket, state.hub().clone(), session_id, slot))
}

async fn serve_socket(
    mut socket: WebSocket,
    hub: Hub,
    session_id: Option<SessionId>,
    _slot: ConnectionSlot,
) {
    let registered = match session_id {
        Some(id) => hub.register(id.clone()).await.map_err(|e| (Some(id), e)),
        None => Err((None, HubError::SessionNotFound(String::new()))),
    };

    let connection = match registered {
        Ok(connection) => connection,
        Err((id, error)) => {
            debug!(session_id = ?id, error = %error, "Rejecting live connection");
            let frame = WsMessage::error(id.as_ref(), &error);
            if let Ok(text) = frame.to_json() {
                let _ = timeout(WRITE_WAIT, socket.send(Message::Text(text))).await;
            }
            let _ = timeout(WRITE_WAIT, socket.send(Message::Close(None))).await;
            return;
        }
    };

    let ClientConnection {
        id,
        session_id,
        outbound,
        closed,
    } = connection;
    info!(client_id = %id, session_id = %session_id, "Live connection opened");

    let (sink, stream) = socket.split();
    let mut writer = tokio::spawn(write_pump(sink, outbound, closed.clone(), id));
    read_pump(stream, &hub, id, closed).await;

    hub.unregister(id);
    if timeout(WRITE_WAIT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(client_id = %id, session_id = %session_id, "Live connection closed");
}

/// Feeds inbound text frames to the hub until the peer goes away, goes
/// silent past [`PONG_WAIT`], or the hub closes this client.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    hub: &Hub,
    client: ClientId,
    mut closed: watch::Receiver<bool>,
) {
    let mut deadline = Instant::now() + PONG_WAIT;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                warn!(client_id = %client, "Peer stopped responding");
                break;
            }
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
            }
            frame = stream.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        debug!(client_id = %client, error = %e, "Socket read failed");
                        break;
                    }
                    None => break,
                };
                deadline = Instant::now() + PONG_WAIT;
                match message {
                    Message::Text(text) => hub.handle_text(client, &text),
                    Message::Binary(bytes) => {
                        hub.handle_text(client, &String::from_utf8_lossy(&bytes))
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
        }
    }
}

/// Drains the client's queue onto the socket and sends periodic pings.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<WsMessage>,
    mut closed: watch::Receiver<bool>,
    client: ClientId,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + PING_PERIOD, PING_PERIOD);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            queued = outbound.recv() => match queued {
                Some(frame) => match frame.to_json() {
                    Ok(text) => Message::Text(text),
                    Err(e) => {
                        warn!(client_id = %client, error = %e, "Dropping unserializable frame");
                        continue;
                    }
                },
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
                continue;
            }
        };

        match timeout(WRITE_WAIT, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(client_id = %client, error = %e, "Socket write failed");
                return;
            }
            Err(_) => {
                warn!(client_id = %client, "Socket write timed out");
                return;
            }
        }
    }

    // Frames queued before the close still go out.
    while let Ok(frame) = outbound.try_recv() {
        let Ok(text) = frame.to_json() else { continue };
        if !matches!(timeout(WRITE_WAIT, sink.send(Message::Text(text))).await, Ok(Ok(()))) {
            return;
        }
    }
    let _ = timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
}
