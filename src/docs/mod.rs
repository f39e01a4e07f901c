use utoipa::OpenApi;
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
        (status = 200, description = "Room hub is ready", body = ReadyResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Live room and replication counters
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Server diagnostics", body = DiagnosticsResponse),
        (status = 401, description = "Missing or invalid token"),
        (status = 403, description = "Cloud Admin access required", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

/// End a live room
#[utoipa::path(
    post,
    path = "/api/v1/rooms/{room_id}/end",
    params(
        ("room_id" = String, Path, description = "Room identifier")
    ),
    request_body = EndRoomRequest,
    responses(
        (status = 200, description = "Members notified", body = EndRoomResponse),
        (status = 401, description = "Missing or invalid token"),
        (status = 403, description = "Service access required", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn room_end_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        diagnostics_doc,
        room_end_doc,
    ),
    components(
        schemas(HealthResponse, ReadyResponse, DiagnosticsResponse, EndRoomRequest, EndRoomResponse, ErrorResponse)
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
