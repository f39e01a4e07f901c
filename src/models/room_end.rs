use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Request body for ending a live room session
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndRoomRequest {
    pub room_name: String,
    /// `true` when the room was deleted out from under its members
    #[serde(default)]
    pub force: bool,
}

/// Response for ending a live room session
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndRoomResponse {
    pub room_id: String,
    pub notified: u32,
}
