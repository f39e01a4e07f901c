use async_trait::async_trait;
use moka::future::Cache;
use reqwest::{Client, RequestBuilder, Response};
use std::time::Duration;
use tracing::{debug, warn};

use super::RoomStore;
use crate::error::StoreError;
use crate::models::{Room, RoomUpdate};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const ROOM_CACHE_TTL: Duration = Duration::from_secs(2);
const ROOM_CACHE_CAPACITY: u64 = 256;

/// REST client for the room service, authenticated with the user's bearer token
#[derive(Clone)]
pub struct RoomServiceClient {
    client: Client,
    base_url: String,
    token: String,
    rooms: Cache<String, Room>,
}

impl RoomServiceClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let rooms = Cache::builder()
            .max_capacity(ROOM_CACHE_CAPACITY)
            .time_to_live(ROOM_CACHE_TTL)
            .build();

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            rooms,
        })
    }

    fn room_url(&self, room_id: &str) -> String {
        format!("{}/rooms/{}", self.base_url, room_id)
    }

    async fn send(&self, room_id: &str, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        warn!("Room service returned {} for room {}: {}", status, room_id, message);
        Err(StoreError::from_status(room_id, status.as_u16(), message))
    }
}

#[async_trait]
impl RoomStore for RoomServiceClient {
    async fn get_room(&self, room_id: &str, skip_cache: bool) -> Result<Room, StoreError> {
        if !skip_cache {
            if let Some(room) = self.rooms.get(room_id).await {
                debug!("Room {} served from cache", room_id);
                return Ok(room);
            }
        }

        let response = self.send(room_id, self.client.get(self.room_url(room_id))).await?;
        let room: Room = response
            .json()
            .await
            .map_err(|e| StoreError::Network(format!("invalid room payload: {}", e)))?;
        self.rooms.insert(room_id.to_string(), room.clone()).await;
        Ok(room)
    }

    async fn update_room(&self, room_id: &str, update: RoomUpdate) -> Result<(), StoreError> {
        let request = self.client.put(self.room_url(room_id)).json(&update);
        self.send(room_id, request).await?;
        self.rooms.invalidate(room_id).await;
        Ok(())
    }

    async fn join_room(&self, room_id: &str) -> Result<(), StoreError> {
        let url = format!("{}/join", self.room_url(room_id));
        self.send(room_id, self.client.post(url)).await?;
        self.rooms.invalidate(room_id).await;
        Ok(())
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), StoreError> {
        let url = format!("{}/leave", self.room_url(room_id));
        self.send(room_id, self.client.post(url)).await?;
        self.rooms.invalidate(room_id).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_urls_ignore_trailing_slash() {
        let client = RoomServiceClient::new("http://rooms.test/api/", "t").unwrap();
        assert_eq!(client.room_url("R1"), "http://rooms.test/api/rooms/R1");
    }

    #[tokio::test]
    async fn unreachable_service_is_a_network_error() {
        let client = RoomServiceClient::new("http://127.0.0.1:9", "t").unwrap();
        let err = client.get_room("R1", true).await.unwrap_err();
        assert!(matches!(err, StoreError::Network(_)));
    }
}
