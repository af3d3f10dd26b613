use utoipa::OpenApi;
use crate::awareness::{AwarenessEntry, AwarenessState, CursorRange};
use crate::models::*;

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service is ready", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Registry and host diagnostics
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Current diagnostics", body = DiagnosticsResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

/// Export the live content of a file
#[utoipa::path(
    get,
    path = "/api/v1/rooms/{room_id}/files/{file_name}",
    params(
        ("room_id" = String, Path, description = "Room identifier"),
        ("file_name" = String, Path, description = "File name within the room")
    ),
    responses(
        (status = 200, description = "Live file content", body = FileExportResponse),
        (status = 400, description = "Invalid room or file name", body = ErrorResponse),
        (status = 404, description = "File is not open", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn file_export_doc() {}

/// Save the live content of a file to storage
#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/files/{file_name}/save",
    params(
        ("room_id" = String, Path, description = "Room identifier"),
        ("file_name" = String, Path, description = "File name within the room")
    ),
    responses(
        (status = 200, description = "File saved", body = FileSaveResponse),
        (status = 404, description = "File is not open, or has no stored record. Saves never create records, so without a database every save of a new file is a 404", body = ErrorResponse),
        (status = 502, description = "Storage failed", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn file_save_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        diagnostics_doc,
        file_export_doc,
        file_save_doc,
    ),
    components(
        schemas(
            HealthResponse,
            DiagnosticsResponse,
            FileExportResponse,
            FileSaveResponse,
            ErrorResponse,
            AwarenessEntry,
            AwarenessState,
            CursorRange
        )
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
