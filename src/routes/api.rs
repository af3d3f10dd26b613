use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers::{diagnostics, file_export, file_save, health_check, ready_check};
use crate::state::AppState;

/// Create API routes
pub fn create_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/v1/diagnostics", get(diagnostics))
        .route("/v1/rooms/:room_id/files/:file_name", get(file_export))
        .route("/v1/rooms/:room_id/files/:file_name/save", post(file_save))
}
