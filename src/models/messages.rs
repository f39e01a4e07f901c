use serde::{Deserialize, Serialize};
use serde_with::{serde_as, base64::Base64};

// Replication channel messages. The payloads are opaque loro updates/snapshots.

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadMessage {
    pub user: String,
    pub peer: String,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMessage {
    #[serde_as(as = "Base64")]
    pub delta: Vec<u8>,
    pub user: String,
    pub peer: String,
    /// Origin tag of the transaction that produced the delta
    pub origin: String,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    #[serde_as(as = "Base64")]
    pub state: Vec<u8>,
    pub user: String,
    pub peer: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    pub user: String,
    pub peer: String,
}

#[serde_as]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitMessage {
    #[serde_as(as = "Base64")]
    pub snapshot: Vec<u8>,
    /// Set for the first loader of a fresh relay room only; that client seeds
    /// the durable content.
    pub seed: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PongMessage {
    pub date: String,
}

/// Messages a replica sends to the document relay
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ClientDocMessage {
    #[serde(rename = "load")]
    Load(LoadMessage),
    #[serde(rename = "update")]
    Update(UpdateMessage),
    #[serde(rename = "sync")]
    Sync(SyncMessage),
    #[serde(rename = "ping")]
    Ping(PingMessage),
}

/// Messages the document relay sends to a replica
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ServerDocMessage {
    #[serde(rename = "init")]
    Init(InitMessage),
    #[serde(rename = "update")]
    Update(UpdateMessage),
    #[serde(rename = "pong")]
    Pong(PongMessage),
}

#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub sender_id: String,
    pub update: UpdateMessage,
}
