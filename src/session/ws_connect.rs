use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use super::channel::{EventConnector, EventLink};
use super::doc_channel::{DocConnector, DocLink};
use crate::config::SessionConfig;
use crate::error::SessionError;

/// Event channel over a websocket to the room server
pub struct WsEventConnector {
    url: String,
}

impl WsEventConnector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            url: config.events_url(),
        }
    }
}

#[async_trait]
impl EventConnector for WsEventConnector {
    async fn connect(&self, token: &str) -> Result<EventLink, SessionError> {
        let (outgoing, incoming) = open(&with_token(&self.url, token)?).await?;
        Ok(EventLink { outgoing, incoming })
    }
}

/// Replication channel over a websocket to the document relay
pub struct WsDocConnector {
    config: SessionConfig,
}

impl WsDocConnector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl DocConnector for WsDocConnector {
    async fn connect(&self, room_id: &str, token: &str) -> Result<DocLink, SessionError> {
        let url = with_token(&self.config.docs_url(room_id), token)?;
        let (outgoing, incoming) = open(&url).await?;
        Ok(DocLink { outgoing, incoming })
    }
}

/// Append the bearer token as an escaped `token` query pair
fn with_token(base: &str, token: &str) -> Result<String, SessionError> {
    reqwest::Url::parse_with_params(base, &[("token", token)])
        .map(String::from)
        .map_err(|e| SessionError::Transport(format!("invalid url {}: {}", base, e)))
}

/// Connect and bridge the socket to a pair of typed channels.
/// The incoming channel closes when the socket does.
async fn open<Out, In>(
    url: &str,
) -> Result<(mpsc::UnboundedSender<Out>, mpsc::UnboundedReceiver<In>), SessionError>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))?;
    debug!("Websocket connected to {}", url.split('?').next().unwrap_or(url));

    let (mut sink, mut stream) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Out>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<In>();

    tokio::spawn(async move {
        let mut send_task = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode outgoing message: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut recv_task = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<In>(text.as_str()) {
                        Ok(message) => {
                            if in_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping malformed frame: {}", e),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        tokio::select! {
            _ = (&mut send_task) => recv_task.abort(),
            _ = (&mut recv_task) => send_task.abort(),
        };
    });

    Ok((out_tx, in_rx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_escaped_into_the_query() {
        let url = with_token("ws://localhost:8080/ws/docs/R1", "a&b+c=d").unwrap();
        assert_eq!(url, "ws://localhost:8080/ws/docs/R1?token=a%26b%2Bc%3Dd");

        let parsed = reqwest::Url::parse(&url).unwrap();
        let token: Vec<_> = parsed.query_pairs().collect();
        assert_eq!(token.len(), 1);
        assert_eq!(token[0].1, "a&b+c=d");
    }

    #[test]
    fn unparsable_base_is_a_transport_error() {
        assert!(matches!(
            with_token("not a url", "t"),
            Err(SessionError::Transport(_))
        ));
    }
}
