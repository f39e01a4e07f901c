use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::roomhub::RoomHub;
use crate::app::AppState;
use crate::models::ClientEvent;
use crate::services::auth_service;

#[derive(Debug, Deserialize)]
pub struct SocketParams {
    pub token: Option<String>,
}

/// Event channel websocket
pub async fn events_ws_handler(
    State(state): State<AppState>,
    Query(params): Query<SocketParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let principals =
        match auth_service::authenticate(&state.config, &headers, params.token.as_deref()) {
            Ok(principals) => principals,
            Err(e) => {
                warn!("Rejected event socket: {}", e);
                return StatusCode::UNAUTHORIZED.into_response();
            }
        };
    info!("New event socket connection");
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_event_socket(socket, hub, principals))
}

async fn handle_event_socket(socket: WebSocket, hub: Arc<RoomHub>, principals: Vec<String>) {
    let (conn, mut events) = hub.open_connection(principals).await;
    let (mut sender, mut receiver) = socket.split();
    let replies = hub.clone();

    // Hub -> socket
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to encode {} for connection {}: {}", event.name(), conn, e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Socket -> hub; only text frames carry events
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => replies.handle(conn, event).await,
                Err(e) => {
                    warn!("Malformed event on connection {}: {}", conn, e);
                    replies.reject(conn, format!("Malformed event: {}", e)).await;
                }
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };
    hub.close(conn).await;
    info!("Event socket {} terminated", conn);
}
