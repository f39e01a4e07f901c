use crate::{app::AppState, auth::auth, models::{EndRoomRequest, EndRoomResponse, ErrorResponse}};
use axum::{extract::{Extension, Path, State}, http::StatusCode, Json};
use tracing::info;

/// End a live room, notifying every connected member.
///
/// Ending a room nobody is connected to is not an error; `notified` is 0.
pub async fn room_end(
    State(state): State<AppState>,
    Extension(prpls): Extension<Vec<String>>,
    Path(room_id): Path<String>,
    Json(request): Json<EndRoomRequest>,
) -> Result<(StatusCode, Json<EndRoomResponse>), (StatusCode, Json<ErrorResponse>)> {

    // Ending rooms is reserved to the room service
    let caller = auth::ensure_service(&prpls)?;

    let notified = state
        .hub
        .end_room(&room_id, &request.room_name, request.force)
        .await;
    info!(
        "Room {} ended by {} (force={}), {} connection(s) notified",
        room_id, caller, request.force, notified
    );

    Ok((
        StatusCode::OK,
        Json(EndRoomResponse {
            room_id,
            notified: notified as u32,
        }),
    ))
}
