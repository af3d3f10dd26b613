use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::error;

use crate::models::{ErrorResponse, FileExportResponse};
use crate::registry::{DocKey, LiveDocument};
use crate::state::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Resolve a route's room and file to a document currently in memory.
pub(crate) fn live_document(state: &AppState, room_id: &str, file_name: &str) -> Result<(DocKey, Arc<LiveDocument>), ApiError> {
    let key = DocKey::new(room_id, file_name)
        .map_err(|e| ErrorResponse::reply(StatusCode::BAD_REQUEST, e.to_string()))?;
    match state.registry.live_document(&key) {
        Some(document) => Ok((key, document)),
        None => {
            error!("File '{}' is not open in room '{}'", file_name, room_id);
            Err(ErrorResponse::reply(
                StatusCode::NOT_FOUND,
                format!("File '{}' is not open in room '{}'", file_name, room_id),
            ))
        }
    }
}

/// Export the live content of a file
pub async fn file_export(
    State(state): State<Arc<AppState>>,
    Path((room_id, file_name)): Path<(String, String)>,
) -> Result<(StatusCode, Json<FileExportResponse>), ApiError> {
    let (key, document) = live_document(&state, &room_id, &file_name)?;

    let content = state.bridge.flatten(&document).await;
    let state_vector = match serde_json::to_value(document.state_vector().await) {
        Ok(val) => val,
        Err(e) => {
            error!("Failed to serialize state vector for '{}': {}", key, e);
            return Err(ErrorResponse::reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialize state vector for '{}': {}", key, e),
            ));
        }
    };

    Ok((
        StatusCode::OK,
        Json(FileExportResponse {
            sessions: state.registry.session_count(&key) as u32,
            dirty: document.is_dirty(),
            room_id: key.room_id,
            file_name: key.file_name,
            content,
            state_vector,
        }),
    ))
}
