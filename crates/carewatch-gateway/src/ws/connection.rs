use axum::{
    extract::{ws::Message, ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
};
use carewatch_core::config::{CLIENT_CHANNEL_CAPACITY, MAX_PAYLOAD_BYTES};
use carewatch_core::types::ConnId;
use carewatch_protocol::ServerMessage;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::ws::message::{self, ConnState};
use crate::ws::send::ConnectionHandle;

/// Upgrade HTTP to WebSocket at the configured path.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_PAYLOAD_BYTES)
        .on_upgrade(|socket| run_connection(socket, state))
}

/// Per-connection event loop, lives for the entire WS session.
///
/// Inbound frames are handled one at a time; outbound frames queued by the
/// registry are drained in between. Cleanup runs exactly once, after the loop.
async fn run_connection(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = ConnId::new();
    info!(conn_id = %conn_id, "client connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut outbound) = mpsc::channel::<String>(CLIENT_CHANNEL_CAPACITY);
    let conn = ConnectionHandle::new(conn_id.clone(), tx);
    state.ws_clients.insert(conn_id.clone(), conn.clone());

    let mut conn_state = ConnState::Idle;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        conn_state = message::handle(
                            text.as_str(), conn_state, &conn, &state.registry,
                        ).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        conn.send(&ServerMessage::invalid_format());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(conn_id = %conn_id, error = %e, "websocket read failed");
                        break;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                }
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        }
    }

    // Mark the handle closed before cleanup so in-flight fan-out skips it.
    drop(outbound);
    message::close(&conn, &state.registry);
    state.ws_clients.remove(&conn_id);
    info!(conn_id = %conn_id, site_id = ?conn_state.site(), "client disconnected");
}
