use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::debug;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check endpoint
pub async fn ready_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    debug!("Readiness check requested");
    let stats = state.registry.stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        message: format!("Service is ready, {} live documents", stats.live_documents),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
