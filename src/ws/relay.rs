use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use super::route::registry_error_reply;
use crate::models::ErrorResponse;
use crate::registry::{new_client_id, DocKey, RelayFrame, RelayHandle};
use crate::state::AppState;

/// `GET /relay/:key`: plain text broadcast for clients without CRDT
/// support. Nothing is merged or stored.
pub async fn relay_socket(
    Path(raw_key): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let key = match DocKey::parse(&raw_key) {
        Ok(key) => key,
        Err(e) => {
            warn!("Rejected relay socket for '{}': {}", raw_key, e);
            return ErrorResponse::reply(StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };
    let relay = match state.registry.acquire_relay(key) {
        Ok(relay) => relay,
        Err(e) => {
            warn!("Refused relay for '{}': {}", raw_key, e);
            return registry_error_reply(&e);
        }
    };
    ws.on_upgrade(move |socket| handle_relay(socket, relay))
}

async fn handle_relay(socket: WebSocket, relay: RelayHandle) {
    let connection_id = new_client_id();
    info!("Relay connection {} established for {}", connection_id, relay.key());

    let (mut sender, mut receiver) = socket.split();
    let bc = relay.sender().clone();
    let mut rbc = bc.subscribe();

    // Socket to channel
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(content) => {
                    let _ = bc.send(RelayFrame {
                        sender_id: connection_id,
                        content,
                    });
                }
                Message::Close(_) => break,
                _ => continue,
            }
        }
    });

    // Channel to socket, skipping our own frames
    let mut write_task = tokio::spawn(async move {
        loop {
            match rbc.recv().await {
                Ok(frame) => {
                    if frame.sender_id == connection_id {
                        continue;
                    }
                    if sender.send(Message::Text(frame.content)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Relay connection {} skipped {} frames", connection_id, skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = (&mut read_task) => write_task.abort(),
        _ = (&mut write_task) => read_task.abort(),
    };
    info!("Relay connection {} terminated for {}", connection_id, relay.key());
}
