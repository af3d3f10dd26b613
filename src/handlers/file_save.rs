use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use super::file_export::live_document;
use crate::models::{ErrorResponse, FileSaveResponse};
use crate::persistence::StorageError;
use crate::state::AppState;

/// Flatten a live file and write it to storage
pub async fn file_save(
    State(state): State<Arc<AppState>>,
    Path((room_id, file_name)): Path<(String, String)>,
) -> Result<(StatusCode, Json<FileSaveResponse>), (StatusCode, Json<ErrorResponse>)> {
    let (key, document) = live_document(&state, &room_id, &file_name)?;

    match state.bridge.save_document(&document).await {
        Ok(saved) => Ok((
            StatusCode::OK,
            Json(FileSaveResponse {
                room_id: key.room_id,
                file_name: key.file_name,
                chars: saved.chars as u64,
            }),
        )),
        Err(e @ StorageError::NotFound { .. }) => Err(ErrorResponse::reply(StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => Err(ErrorResponse::reply(StatusCode::BAD_GATEWAY, e.to_string())),
    }
}
