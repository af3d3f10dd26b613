use std::panic;
use synapse_doc::{app, AppState, Config};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}, using defaults");
        Config::default()
    });

    // Initialize tracing
    let default_filter = format!(
        "synapse_doc={},tower_http=debug,axum::rejection=trace,info",
        config.log_level
    );
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    info!("Starting server...");
    if !config.is_development() {
        info!("Environment: {}", config.environment);
    }

    let address = config.server_address();
    let legacy_relay = config.legacy_relay;
    let state = AppState::from_config(config).await;
    let _tasks = state.spawn_background_tasks();
    let app_routes = app(state);

    let listener = match tokio::net::TcpListener::bind(&address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", address, e);
            std::process::exit(1);
        }
    };

    info!("🚀 Server running on http://{}", address);
    info!("📡 Document sockets available at ws://{}/doc/<roomId>:<fileName>", address);
    if legacy_relay {
        warn!("Legacy relay enabled at ws://{}/relay/<roomId>:<fileName>", address);
    }
    info!("📚 OpenAPI document at http://{}/api-docs/openapi.json", address);

    if let Err(e) = axum::serve(listener, app_routes).await {
        error!("Server error: {}", e);
    }
}
