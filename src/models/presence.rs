use serde::{Deserialize, Serialize};
use std::fmt;

use super::room::MemberRole;

/// Zero-based cursor position in the editor's line/column model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: Position,
    pub end: Position,
}

/// Who a connection claims to be when joining a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub role: MemberRole,
}

impl Identity {
    pub fn new(user_id: &str, username: &str, role: MemberRole) -> Self {
        Self {
            user_id: user_id.to_string(),
            username: username.to_string(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == MemberRole::Admin
    }
}

/// One entry of a membership snapshot, including the member's ephemeral state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberState {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionRange>,
    #[serde(default)]
    pub typing: bool,
}

impl MemberState {
    pub fn identity(&self) -> Identity {
        Identity::new(&self.user_id, &self.username, self.role)
    }
}

/// Display color, always rendered as `#rrggbb`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Color(String);

impl Color {
    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Color(format!("#{:02x}{:02x}{:02x}", r, g, b))
    }

    pub fn from_hex(hex: &str) -> Self {
        Color(hex.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
