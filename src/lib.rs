pub mod awareness;
pub mod config;
pub mod crdt;
pub mod db;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod persistence;
pub mod registry;
pub mod routes;
pub mod state;
pub mod utils;
pub mod ws;

use axum::{http::HeaderValue, routing::get, Json, Router};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;

use crate::docs::ApiDoc;
use crate::routes::create_api_routes;

pub use config::Config;
pub use state::AppState;

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origin_list()
        .into_iter()
        .filter_map(|origin| match HeaderValue::from_str(&origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring CORS origin '{}': {}", origin, e);
                None
            }
        })
        .collect();
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// The full HTTP surface: REST API, OpenAPI document and document sockets.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        // Mount API routes
        .nest("/api", create_api_routes())
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .route("/doc/:key", get(ws::doc_socket));
    if state.config.legacy_relay {
        router = router.route("/relay/:key", get(ws::relay_socket));
    }
    router
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
