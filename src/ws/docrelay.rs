use chrono::Utc;
use loro::{ExportMode, LoroDoc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::document::replicated::{ORIGIN_REPLICATION_SYNC, TEXT_CONTAINER};
use crate::models::{
    BroadcastMessage, ClientDocMessage, InitMessage, PongMessage, ServerDocMessage, UpdateMessage,
};

/// Relay-side copy of one room's document
struct DocRoom {
    doc: Mutex<LoroDoc>,
    updates: broadcast::Sender<BroadcastMessage>,
    subscribers: AtomicUsize,
    seeded: AtomicBool,
}

impl DocRoom {
    fn new() -> Self {
        let doc = LoroDoc::new();
        let _ = doc.get_text(TEXT_CONTAINER);
        let (updates, _) = broadcast::channel(1024);
        Self {
            doc: Mutex::new(doc),
            updates,
            subscribers: AtomicUsize::new(0),
            seeded: AtomicBool::new(false),
        }
    }

    fn doc(&self) -> MutexGuard<'_, LoroDoc> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Option<Vec<u8>> {
        match self.doc().export(ExportMode::Snapshot) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!("Failed to export relay snapshot: {}", e);
                None
            }
        }
    }
}

/// A replica's attachment to a relay room
pub struct DocSubscription {
    pub room_id: String,
    pub conn_id: String,
    room: Arc<DocRoom>,
}

impl DocSubscription {
    /// Updates from the other replicas of the room
    pub fn updates(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.room.updates.subscribe()
    }

    /// Whether a broadcast originated from this subscription
    pub fn is_own(&self, message: &BroadcastMessage) -> bool {
        message.sender_id == self.conn_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayStats {
    pub rooms: usize,
    pub connections: usize,
}

/// Fans loro updates out to every replica of a room and keeps a server
/// replica that answers loads and absorbs full-state resyncs.
#[derive(Default)]
pub struct DocRelay {
    rooms: RwLock<HashMap<String, Arc<DocRoom>>>,
    next_conn: AtomicU64,
}

impl DocRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, room_id: &str) -> DocSubscription {
        let room = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .entry(room_id.to_string())
                .or_insert_with(|| {
                    info!("Relay room {} created", room_id);
                    Arc::new(DocRoom::new())
                })
                .clone();
            room.subscribers.fetch_add(1, Ordering::SeqCst);
            room
        };
        let conn_id = format!("doc-{}", self.next_conn.fetch_add(1, Ordering::SeqCst));
        debug!("Replica {} attached to room {}", conn_id, room_id);
        DocSubscription {
            room_id: room_id.to_string(),
            conn_id,
            room,
        }
    }

    pub async fn unsubscribe(&self, subscription: &DocSubscription) {
        let mut rooms = self.rooms.write().await;
        let remaining = subscription.room.subscribers.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            let same = rooms
                .get(&subscription.room_id)
                .map(|r| Arc::ptr_eq(r, &subscription.room))
                .unwrap_or(false);
            if same {
                rooms.remove(&subscription.room_id);
                info!("Relay room {} released", subscription.room_id);
            }
        }
    }

    /// Handle one message from a replica; returns the direct reply, if any
    pub fn handle(&self, subscription: &DocSubscription, message: ClientDocMessage) -> Option<ServerDocMessage> {
        let room = &subscription.room;
        let room_id = &subscription.room_id;
        match message {
            ClientDocMessage::Load(load) => {
                info!("Load for room {}: user={}, peer={}", room_id, load.user, load.peer);
                let snapshot = room.snapshot()?;
                // Only the first loader of a fresh room seeds it
                let seed = !room.seeded.swap(true, Ordering::SeqCst);
                Some(ServerDocMessage::Init(InitMessage { snapshot, seed }))
            }
            ClientDocMessage::Update(update) => {
                if let Err(e) = room.doc().import(&update.delta) {
                    warn!("Rejected update from peer {} in room {}: {}", update.peer, room_id, e);
                    return None;
                }
                let message = BroadcastMessage {
                    sender_id: subscription.conn_id.clone(),
                    update,
                };
                if room.updates.send(message).is_err() {
                    debug!("No other replicas in room {}", room_id);
                }
                None
            }
            ClientDocMessage::Sync(sync) => {
                let missing = {
                    let doc = room.doc();
                    let before = doc.oplog_vv();
                    if let Err(e) = doc.import(&sync.state) {
                        warn!("Rejected state from peer {} in room {}: {}", sync.peer, room_id, e);
                        return None;
                    }
                    if doc.oplog_vv() == before {
                        None
                    } else {
                        doc.export(ExportMode::updates(&before)).ok()
                    }
                };
                // Heal the other replicas right away
                if let Some(delta) = missing {
                    debug!("Resync from peer {} carried missing ops for room {}", sync.peer, room_id);
                    let _ = room.updates.send(BroadcastMessage {
                        sender_id: subscription.conn_id.clone(),
                        update: UpdateMessage {
                            delta,
                            user: sync.user,
                            peer: sync.peer,
                            origin: ORIGIN_REPLICATION_SYNC.to_string(),
                        },
                    });
                }
                let snapshot = room.snapshot()?;
                Some(ServerDocMessage::Init(InitMessage { snapshot, seed: false }))
            }
            ClientDocMessage::Ping(_) => Some(ServerDocMessage::Pong(PongMessage {
                date: Utc::now().to_rfc3339(),
            })),
        }
    }

    pub async fn stats(&self) -> RelayStats {
        let rooms = self.rooms.read().await;
        RelayStats {
            rooms: rooms.len(),
            connections: rooms
                .values()
                .map(|r| r.subscribers.load(Ordering::SeqCst))
                .sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{OriginTag, ReplicatedDocument, TextRange};
    use crate::models::{LoadMessage, PingMessage, SyncMessage};

    fn load() -> ClientDocMessage {
        ClientDocMessage::Load(LoadMessage {
            user: "u".to_string(),
            peer: "p".to_string(),
        })
    }

    #[tokio::test]
    async fn only_first_loader_of_fresh_room_seeds() {
        let relay = DocRelay::new();
        let first = relay.subscribe("R1").await;
        let second = relay.subscribe("R1").await;

        let seeds: Vec<bool> = [&first, &second, &first]
            .iter()
            .map(|sub| match relay.handle(sub, load()) {
                Some(ServerDocMessage::Init(init)) => init.seed,
                other => panic!("expected init, got {:?}", other),
            })
            .collect();
        assert_eq!(seeds, vec![true, false, false]);

        relay.unsubscribe(&first).await;
        relay.unsubscribe(&second).await;
        assert_eq!(relay.stats().await, RelayStats::default());

        let fresh = relay.subscribe("R1").await;
        assert!(matches!(
            relay.handle(&fresh, load()),
            Some(ServerDocMessage::Init(InitMessage { seed: true, .. }))
        ));
    }

    #[tokio::test]
    async fn updates_fan_out_to_other_replicas() {
        let relay = DocRelay::new();
        let a = relay.subscribe("R1").await;
        let b = relay.subscribe("R1").await;
        let mut b_updates = b.updates();

        let (doc, mut outbound) = ReplicatedDocument::attach("R1");
        doc.apply_local_edit(TextRange::caret(0), "fn main() {}").unwrap();
        let update = outbound.try_recv().unwrap();
        let message = UpdateMessage {
            delta: update.delta,
            user: "alice".to_string(),
            peer: doc.peer().to_string(),
            origin: update.origin.to_string(),
        };
        assert!(relay.handle(&a, ClientDocMessage::Update(message)).is_none());

        let received = b_updates.recv().await.unwrap();
        assert!(a.is_own(&received));
        assert!(!b.is_own(&received));

        // A late loader gets the text through the relay snapshot
        let (late, _late_out) = ReplicatedDocument::attach("R1");
        match relay.handle(&b, load()) {
            Some(ServerDocMessage::Init(init)) => {
                late.apply_remote_update(&init.snapshot, OriginTag::replication_sync()).unwrap();
            }
            other => panic!("expected init, got {:?}", other),
        }
        assert_eq!(late.get_snapshot(), "fn main() {}");
        doc.detach();
        late.detach();
    }

    #[tokio::test]
    async fn sync_heals_missing_updates() {
        let relay = DocRelay::new();
        let a = relay.subscribe("R1").await;
        let b = relay.subscribe("R1").await;
        let mut b_updates = b.updates();

        // Edit made while the update itself was lost
        let (doc, _outbound) = ReplicatedDocument::attach("R1");
        doc.apply_local_edit(TextRange::caret(0), "lost").unwrap();
        let sync = ClientDocMessage::Sync(SyncMessage {
            state: doc.export_state().unwrap(),
            user: "alice".to_string(),
            peer: doc.peer().to_string(),
        });
        assert!(matches!(
            relay.handle(&a, sync.clone()),
            Some(ServerDocMessage::Init(InitMessage { seed: false, .. }))
        ));
        let healed = b_updates.recv().await.unwrap();
        assert_eq!(healed.update.origin, ORIGIN_REPLICATION_SYNC);

        // Nothing new the second time
        relay.handle(&a, sync);
        assert!(b_updates.try_recv().is_err());

        assert!(matches!(
            relay.handle(&a, ClientDocMessage::Ping(PingMessage { user: "u".into(), peer: "p".into() })),
            Some(ServerDocMessage::Pong(_))
        ));
        doc.detach();
    }
}
