use serde::{Deserialize, Serialize};

/// Role of a member inside a room. The admin is the room creator and the
/// only member allowed to flush live content to the durable store on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    #[default]
    Member,
}

/// A room member as reported by the room service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default)]
    pub is_online: bool,
}

/// Cached copy of a room owned by the external room service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub online_count: u32,
}

impl Room {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            members: Vec::new(),
            content: String::new(),
            language: default_language(),
            online_count: 0,
        }
    }

    /// The room creator, if the member list carries one
    pub fn admin(&self) -> Option<&Member> {
        self.members.iter().find(|m| m.role == MemberRole::Admin)
    }

    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    /// Role of a user in this room. Unknown users are plain members.
    pub fn role_of(&self, user_id: &str) -> MemberRole {
        self.member(user_id).map(|m| m.role).unwrap_or_default()
    }
}

/// Partial update sent to the room service. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

pub fn default_language() -> String {
    "plaintext".to_string()
}
