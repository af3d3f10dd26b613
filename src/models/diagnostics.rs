use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub n_docs: u32,
    pub n_parked_docs: u32,
    pub n_sessions: u32,
    pub n_dirty_docs: u32,
    pub n_rooms: u32,
    pub n_awareness: u32,
    pub n_relay_channels: u32,
    pub n_relay_conn: u32,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
