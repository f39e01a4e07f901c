use axum::{
    extract::{ws::{Message, WebSocket, WebSocketUpgrade}, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tracing::{error, info, warn};

use super::docrelay::DocRelay;
use super::events_socket::SocketParams;
use crate::app::AppState;
use crate::models::{ClientDocMessage, ServerDocMessage};
use crate::services::auth_service;

/// Replication websocket for one room
pub async fn docs_ws_handler(
    Path(room_id): Path<String>,
    State(state): State<AppState>,
    Query(params): Query<SocketParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = auth_service::authenticate(&state.config, &headers, params.token.as_deref()) {
        warn!("Rejected replication socket for room {}: {}", room_id, e);
        return StatusCode::UNAUTHORIZED.into_response();
    }
    info!("New replication socket for room {}", room_id);
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| handle_doc_socket(socket, room_id, relay))
}

async fn handle_doc_socket(socket: WebSocket, room_id: String, relay: Arc<DocRelay>) {
    let subscription = Arc::new(relay.subscribe(&room_id).await);
    let mut updates = subscription.updates();
    let (sender, mut receiver) = socket.split();

    // Both tasks write to the socket
    let sender1 = Arc::new(Mutex::new(sender));
    let sender2 = sender1.clone();

    let relay1 = relay.clone();
    let subscription1 = subscription.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };
            let message: ClientDocMessage = match serde_json::from_str(&text) {
                Ok(message) => message,
                Err(e) => {
                    error!("Failed to parse message for room {}: {}", subscription1.room_id, e);
                    continue;
                }
            };
            if let Some(reply) = relay1.handle(&subscription1, message) {
                if send(&sender1, &reply).await.is_err() {
                    break;
                }
            }
        }
    });

    let subscription2 = subscription.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(message) => {
                    // Skip messages from this connection to prevent echo
                    if subscription2.is_own(&message) {
                        continue;
                    }
                    if send(&sender2, &ServerDocMessage::Update(message.update)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Replica {} lagged {} updates", subscription2.conn_id, n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        _ = (&mut recv_task) => send_task.abort(),
        _ = (&mut send_task) => recv_task.abort(),
    };

    relay.unsubscribe(&subscription).await;
    info!("Replication socket for room {} terminated", room_id);
}

async fn send<S>(sender: &Mutex<S>, message: &ServerDocMessage) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(message).map_err(|e| {
        error!("Failed to encode replication message: {}", e);
    })?;
    sender.lock().await.send(Message::Text(text)).await.map_err(|_| ())
}
