use axum::{
    extract::{
        ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::stream::StreamExt;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collector::broadcaster::OutboundMessage;
use crate::web::AppState;

pub async fn observer_ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer_socket(socket, app_state))
}

/// One task per observer session: greet, subscribe, forward until the socket
/// stops accepting writes. A session that cannot be written to is evicted by
/// ending the task; there is no per-observer buffering.
async fn handle_observer_socket(mut socket: WebSocket, app_state: Arc<AppState>) {
    let client_id = Uuid::new_v4();
    info!(client_id = %client_id, "Observer session established.");

    let welcome = OutboundMessage::new("welcome", json!({ "clientId": client_id }));
    match serde_json::to_string(&welcome) {
        Ok(text) => {
            if socket.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                warn!(client_id = %client_id, "Failed to send welcome. Closing session.");
                return;
            }
        }
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "Failed to serialize welcome.");
            return;
        }
    }

    let mut rx = app_state.broadcaster.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(message) => {
                    let Ok(text) = serde_json::to_string(&message) else {
                        continue;
                    };
                    if socket.send(Message::Text(Utf8Bytes::from(text))).await.is_err() {
                        warn!(client_id = %client_id, "Observer not writable. Evicting session.");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(client_id = %client_id, skipped, "Observer lagged; messages dropped.");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.next() => match incoming {
                Some(Ok(Message::Ping(payload))) => {
                    if socket.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!(client_id = %client_id, "Observer closed the session.");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(client_id = %client_id, error = %e, "Observer socket error.");
                    break;
                }
            },
        }
    }

    info!(client_id = %client_id, "Observer session closed.");
}
