//! WebSocket handling

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use taskroom_protocol::ClientMessage;

use crate::auth::HandshakeParams;
use crate::dispatch::Outbound;
use crate::session::ConnectionSession;
use crate::state::AppState;

/// Per-connection outbound queue depth.
const OUTBOUND_QUEUE: usize = 256;
/// How long the writer gets to flush queued frames after the read side ends.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket upgrade handler. The handshake is checked before upgrading.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user_id = match state.identity.authenticate(&params) {
        Ok(user_id) => user_id,
        Err(e) => {
            warn!(
                component = "websocket",
                event = "ws.handshake.refused",
                policy = state.identity.name(),
                reason = %e,
                "Refusing WebSocket upgrade"
            );
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Handle an authenticated WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let conn_id = state.next_connection_id();
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        user_id = %user_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);

    // Only this task touches the sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let result = match frame {
                Outbound::Json(msg) => match serde_json::to_string(&msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                Outbound::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                return;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let mut session = ConnectionSession::open(
        conn_id,
        user_id,
        outbound_tx.clone(),
        Arc::clone(&state.registry),
        state.store.clone(),
    );

    loop {
        let next = match state.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, ws_rx.next()).await {
                Ok(next) => next,
                Err(_) => {
                    info!(
                        component = "websocket",
                        event = "ws.connection.idle_timeout",
                        connection_id = conn_id,
                        idle_secs = limit.as_secs(),
                        "Closing idle connection"
                    );
                    break;
                }
            },
            None => ws_rx.next().await,
        };
        let Some(result) = next else {
            break;
        };

        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(Outbound::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = text.len(),
                    payload_preview = %truncate_for_log(text.as_str(), 240),
                    "Failed to parse client message"
                );
                session.reject_frame(&e.to_string()).await;
            }
            Ok(client_msg) => session.handle(client_msg).await,
        }

        if session.is_closed() {
            break;
        }
    }

    let user_id = session.user_id().to_string();
    debug!(
        component = "websocket",
        event = "ws.connection.ending",
        connection_id = conn_id,
        state = ?session.state(),
        "Tearing down session"
    );
    session.close();
    drop(session);
    drop(outbound_tx);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(
            component = "websocket",
            event = "ws.send.drain_timeout",
            connection_id = conn_id,
            "Writer did not finish flushing before timeout"
        );
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        user_id = %user_id,
        "WebSocket connection closed"
    );
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
