use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Live state of a shared file
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileExportResponse {
    pub room_id: String,
    pub file_name: String,
    pub content: String,
    /// Replica id -> number of integrated operations
    #[schema(value_type = Object)]
    pub state_vector: serde_json::Value,
    pub sessions: u32,
    pub dirty: bool,
}
