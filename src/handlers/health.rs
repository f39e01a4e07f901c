use axum::{extract::State, Json};
use tracing::debug;

use crate::app::AppState;
use crate::models::{HealthResponse, ReadyResponse};

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        service: state.config.cloud_service_name.clone(),
        message: "Server is running".to_string(),
    })
}

/// Readiness check endpoint
pub async fn ready_check(State(state): State<AppState>) -> Json<ReadyResponse> {
    debug!("Readiness check requested");
    let stats = state.hub.stats().await;
    Json(ReadyResponse {
        status: "ok".to_string(),
        message: "Room hub is accepting connections".to_string(),
        rooms: stats.rooms as u32,
    })
}
