use axum::{extract::State, http::StatusCode, Json};
use std::sync::{Arc, Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

use crate::models::DiagnosticsResponse;
use crate::state::AppState;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Registry and host diagnostics
pub async fn diagnostics(State(state): State<Arc<AppState>>) -> (StatusCode, Json<DiagnosticsResponse>) {
    let stats = state.registry.stats();

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Sessions: {}, Docs: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.sessions,
        stats.live_documents
    );

    (
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_docs: stats.live_documents as u32,
            n_parked_docs: stats.parked_documents as u32,
            n_sessions: stats.sessions as u32,
            n_dirty_docs: stats.dirty_documents as u32,
            n_rooms: stats.rooms as u32,
            n_awareness: stats.awareness_entries as u32,
            n_relay_channels: stats.relay_channels as u32,
            n_relay_conn: stats.relay_connections as u32,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    )
}
