//! WebSocket bridge between a client socket and the session coordinator.
//!
//! Each socket gets its own task. Inbound text frames are forwarded to the
//! coordinator as-is; frames the coordinator queues for this connection are
//! written back to the socket. Closing either side ends the task and
//! reports the disconnect exactly once.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::AppState;

/// Upgrade an HTTP request to a relay connection. Mounted at `/` and `/ws`.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(state.config.outbound_buffer);

    let connection_id = match state.coordinator.connect(outbound_tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Rejecting socket");
            let _ = ws_sender.send(Message::Close(None)).await;
            return;
        }
    };

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    // coordinator dropped our queue
                    break;
                };
                if ws_sender.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }

            msg = ws_receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection = %connection_id, error = %e, "WebSocket receive error");
                        break;
                    }
                    // ping/pong are answered by axum
                    Some(Ok(_)) => continue,
                };

                if state.coordinator.frame(connection_id, text).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Err(e) = state.coordinator.disconnect(connection_id).await {
        debug!(connection = %connection_id, error = %e, "Disconnect not delivered");
    }
    debug!(connection = %connection_id, "WebSocket connection closed");
}
