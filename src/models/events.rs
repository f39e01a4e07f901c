use serde::{Deserialize, Serialize};

use super::presence::{Identity, MemberState, Position, SelectionRange};

// Event channel wire format: {"event": "<kebab-case name>", "data": {...}}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EmptyPayload {}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub room_id: String,
    pub user: Identity,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRef {
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserPayload {
    pub user_id: String,
    pub username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CursorPositionPayload {
    pub position: Position,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CursorMovedPayload {
    pub user_id: String,
    pub username: String,
    pub position: Position,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SelectionPayload {
    pub selection: SelectionRange,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSelectionPayload {
    pub user_id: String,
    pub username: String,
    pub selection: SelectionRange,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LanguagePayload {
    pub language: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequestPayload {
    pub room_id: String,
    pub requested_by_username: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoinedPayload {
    pub room_id: String,
    pub members: Vec<MemberState>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUsersPayload {
    pub room_id: String,
    pub online_users: Vec<Identity>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomClosedPayload {
    pub room_name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub message: String,
}

/// Events sent by a client over the event channel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinRoom(JoinRoomPayload),
    LeaveRoom(EmptyPayload),
    CursorPosition(CursorPositionPayload),
    SelectionChange(SelectionPayload),
    SelectionClear(EmptyPayload),
    UserTyping(RoomRef),
    UserStoppedTyping(UserRef),
    LanguageChange(LanguagePayload),
    RequestCreatorSave(SaveRequestPayload),
    ContentSavedConfirmation(RoomRef),
}

/// Events sent by the room server over the event channel
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    RoomJoined(RoomJoinedPayload),
    UserJoined(UserPayload),
    UserLeft(UserPayload),
    OnlineUsersUpdated(OnlineUsersPayload),
    CursorMoved(CursorMovedPayload),
    SelectionChange(RemoteSelectionPayload),
    SelectionClear(UserRef),
    UserTyping(UserPayload),
    UserStoppedTyping(UserRef),
    LanguageChanged(LanguagePayload),
    RequestCreatorSave(SaveRequestPayload),
    ContentSavedConfirmation(RoomRef),
    RoomEnded(RoomClosedPayload),
    RoomForceDeleted(RoomClosedPayload),
    Error(ErrorPayload),
}

impl ServerEvent {
    /// Wire name of the event, as used by `EventChannel::on`
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::RoomJoined(_) => "room-joined",
            ServerEvent::UserJoined(_) => "user-joined",
            ServerEvent::UserLeft(_) => "user-left",
            ServerEvent::OnlineUsersUpdated(_) => "online-users-updated",
            ServerEvent::CursorMoved(_) => "cursor-moved",
            ServerEvent::SelectionChange(_) => "selection-change",
            ServerEvent::SelectionClear(_) => "selection-clear",
            ServerEvent::UserTyping(_) => "user-typing",
            ServerEvent::UserStoppedTyping(_) => "user-stopped-typing",
            ServerEvent::LanguageChanged(_) => "language-changed",
            ServerEvent::RequestCreatorSave(_) => "request-creator-save",
            ServerEvent::ContentSavedConfirmation(_) => "content-saved-confirmation",
            ServerEvent::RoomEnded(_) => "room-ended",
            ServerEvent::RoomForceDeleted(_) => "room-force-deleted",
            ServerEvent::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MemberRole;
    use serde_json::json;

    #[test]
    fn client_events_use_kebab_case_envelope() {
        let event = ClientEvent::JoinRoom(JoinRoomPayload {
            room_id: "R1".to_string(),
            user: Identity::new("u1", "ada", MemberRole::Admin),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "join-room",
                "data": {
                    "roomId": "R1",
                    "user": { "userId": "u1", "username": "ada", "role": "admin" }
                }
            })
        );

        let leave = serde_json::to_value(ClientEvent::LeaveRoom(EmptyPayload::default())).unwrap();
        assert_eq!(leave, json!({ "event": "leave-room", "data": {} }));
    }

    #[test]
    fn server_event_name_matches_wire_tag() {
        let event = ServerEvent::ContentSavedConfirmation(RoomRef { room_id: "R1".to_string() });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], json!(event.name()));

        let parsed: ServerEvent = serde_json::from_value(json!({
            "event": "online-users-updated",
            "data": { "roomId": "R1", "onlineUsers": [{ "userId": "u2", "username": "bob" }] }
        }))
        .unwrap();
        assert_eq!(parsed.name(), "online-users-updated");
    }
}
