use crate::{app::AppState, auth::auth, models::{DiagnosticsResponse, ErrorResponse}};
use axum::{extract::{Extension, State}, http::StatusCode, Json};
use tracing::info;

/// Live room and replication counters
pub async fn diagnostics(
    State(state): State<AppState>,
    Extension(prpls): Extension<Vec<String>>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {

    // Only cloud admins may inspect the server
    let _ = auth::ensure_cloud_admin(&prpls)?;

    let hub = state.hub.stats().await;
    let relay = state.relay.stats().await;

    info!(
        "Diagnostics: Conn: {}, Rooms: {}, Members: {}, Doc rooms: {}, Doc conn: {}",
        hub.connections, hub.rooms, hub.members, relay.rooms, relay.connections
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_conn: hub.connections as u32,
            n_rooms: hub.rooms as u32,
            n_members: hub.members as u32,
            n_doc_rooms: relay.rooms as u32,
            n_doc_conn: relay.connections as u32,
        }),
    ))
}
