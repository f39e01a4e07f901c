pub mod memory_room_store;
pub mod room_service_client;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{Room, RoomUpdate};

pub use memory_room_store::MemoryRoomStore;
pub use room_service_client::RoomServiceClient;

/// Narrow interface to the external room service.
///
/// Everything except `update_room` is idempotent; `update_room` is last writer
/// wins on `content`.
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// Fetch a room. `skip_cache` forces a round-trip to the service.
    async fn get_room(&self, room_id: &str, skip_cache: bool) -> Result<Room, StoreError>;

    async fn update_room(&self, room_id: &str, update: RoomUpdate) -> Result<(), StoreError>;

    async fn join_room(&self, room_id: &str) -> Result<(), StoreError>;

    async fn leave_room(&self, room_id: &str) -> Result<(), StoreError>;
}
