use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::session::{self, SyncSession};
use crate::models::ErrorResponse;
use crate::registry::{new_client_id, DocKey, RegistryError};
use crate::state::AppState;

/// Map an acquire failure to the response sent instead of upgrading.
pub(crate) fn registry_error_reply(e: &RegistryError) -> Response {
    match e {
        RegistryError::AuthorityConflict(key) => ErrorResponse::reply(
            StatusCode::CONFLICT,
            format!("'{}' is open in another synchronization mode", key),
        )
        .into_response(),
        RegistryError::Hydration { .. } => {
            ErrorResponse::reply(StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
        RegistryError::Seed { .. } => {
            ErrorResponse::reply(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// `GET /doc/:key` where key is `<roomId>:<fileName>`.
///
/// The document is acquired before the upgrade so that bad keys, storage
/// failures and mode conflicts are plain HTTP errors.
pub async fn doc_socket(
    Path(raw_key): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let key = match DocKey::parse(&raw_key) {
        Ok(key) => key,
        Err(e) => {
            warn!("Rejected document socket for '{}': {}", raw_key, e);
            return ErrorResponse::reply(StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let handle = match state.registry.acquire(key).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to attach to '{}': {}", raw_key, e);
            return registry_error_reply(&e);
        }
    };

    let client_id = new_client_id();
    let ping_every = state.config.ping_interval();
    info!("New document connection {} for {}", client_id, handle.key());
    ws.on_upgrade(move |socket| async move {
        session::run(socket, SyncSession::new(handle, client_id), ping_every).await;
    })
}
