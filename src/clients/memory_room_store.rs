use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::RoomStore;
use crate::error::StoreError;
use crate::models::{Member, MemberRole, Room, RoomUpdate};

/// Largest content the store accepts, in bytes
pub const MAX_CONTENT_BYTES: usize = 1_000_000;

#[derive(Debug, Default)]
struct StoreState {
    rooms: HashMap<String, Room>,
    updates: Vec<(String, RoomUpdate)>,
    joins: Vec<String>,
}

/// In-process room store used by tests and local runs
#[derive(Debug, Default)]
pub struct MemoryRoomStore {
    state: Mutex<StoreState>,
}

impl MemoryRoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_room(&self, room: Room) {
        self.state().rooms.insert(room.id.clone(), room);
    }

    pub fn remove_room(&self, room_id: &str) -> Option<Room> {
        self.state().rooms.remove(room_id)
    }

    pub fn room(&self, room_id: &str) -> Option<Room> {
        self.state().rooms.get(room_id).cloned()
    }

    /// Every accepted `update_room` call, oldest first
    pub fn updates(&self) -> Vec<(String, RoomUpdate)> {
        self.state().updates.clone()
    }

    pub fn update_count(&self) -> usize {
        self.state().updates.len()
    }

    pub fn join_count(&self, room_id: &str) -> usize {
        self.state().joins.iter().filter(|id| id.as_str() == room_id).count()
    }
}

#[async_trait]
impl RoomStore for MemoryRoomStore {
    async fn get_room(&self, room_id: &str, _skip_cache: bool) -> Result<Room, StoreError> {
        self.room(room_id)
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))
    }

    async fn update_room(&self, room_id: &str, update: RoomUpdate) -> Result<(), StoreError> {
        if let Some(content) = &update.content {
            if content.len() > MAX_CONTENT_BYTES {
                return Err(StoreError::Rejected {
                    status: 413,
                    message: format!("content exceeds {} bytes", MAX_CONTENT_BYTES),
                });
            }
        }

        let mut state = self.state();
        let room = state
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| StoreError::NotFound(room_id.to_string()))?;
        if let Some(content) = &update.content {
            room.content = content.clone();
        }
        if let Some(language) = &update.language {
            room.language = language.clone();
        }
        state.updates.push((room_id.to_string(), update));
        Ok(())
    }

    async fn join_room(&self, room_id: &str) -> Result<(), StoreError> {
        let mut state = self.state();
        if !state.rooms.contains_key(room_id) {
            return Err(StoreError::NotFound(room_id.to_string()));
        }
        state.joins.push(room_id.to_string());
        Ok(())
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), StoreError> {
        if self.state().rooms.contains_key(room_id) {
            Ok(())
        } else {
            Err(StoreError::NotFound(room_id.to_string()))
        }
    }
}

impl MemoryRoomStore {
    /// Room with an admin and the given members, all offline
    pub fn room_with_members(room_id: &str, name: &str, admin: (&str, &str), members: &[(&str, &str)]) -> Room {
        let mut room = Room::new(room_id, name);
        room.members.push(Member {
            user_id: admin.0.to_string(),
            username: admin.1.to_string(),
            role: MemberRole::Admin,
            is_online: false,
        });
        for (user_id, username) in members {
            room.members.push(Member {
                user_id: user_id.to_string(),
                username: username.to_string(),
                role: MemberRole::Member,
                is_online: false,
            });
        }
        room
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn oversized_content_is_rejected_without_writing() {
        let store = MemoryRoomStore::new();
        store.insert_room(Room::new("R1", "Room"));

        let update = RoomUpdate {
            content: Some("x".repeat(MAX_CONTENT_BYTES + 1)),
            language: None,
        };
        let err = store.update_room("R1", update).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected { status: 413, .. }));
        assert_eq!(store.update_count(), 0);
        assert_eq!(store.room("R1").unwrap().content, "");
    }

    #[tokio::test]
    async fn partial_update_keeps_other_fields() {
        let store = MemoryRoomStore::new();
        store.insert_room(Room::new("R1", "Room"));
        store
            .update_room("R1", RoomUpdate { content: None, language: Some("rust".to_string()) })
            .await
            .unwrap();
        let room = store.get_room("R1", true).await.unwrap();
        assert_eq!(room.language, "rust");
        assert_eq!(room.content, "");
        assert!(matches!(
            store.get_room("missing", false).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
