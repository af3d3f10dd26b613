use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Result of an explicit save
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileSaveResponse {
    pub room_id: String,
    pub file_name: String,
    pub chars: u64,
}
