use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use super::channel::ChannelStatus;
use super::supervisor::backoff_delay;
use crate::document::{OriginTag, OutboundUpdate, ReplicatedDocument};
use crate::error::SessionError;
use crate::models::{
    ClientDocMessage, LoadMessage, ServerDocMessage, SyncMessage, UpdateMessage,
};

/// One established replication connection
pub struct DocLink {
    pub outgoing: mpsc::UnboundedSender<ClientDocMessage>,
    pub incoming: mpsc::UnboundedReceiver<ServerDocMessage>,
}

/// Opens replication connections for a room
#[async_trait]
pub trait DocConnector: Send + Sync {
    async fn connect(&self, room_id: &str, token: &str) -> Result<DocLink, SessionError>;
}

/// Relay's answer to a load or sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitNotice {
    /// This replica was the first to load a fresh relay room
    pub seed: bool,
}

#[derive(Debug, Clone)]
pub struct DocChannelTimings {
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub resync: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DocInner {
    connector: Arc<dyn DocConnector>,
    document: Arc<ReplicatedDocument>,
    user_id: String,
    token: String,
    timings: DocChannelTimings,
    status: watch::Sender<ChannelStatus>,
    inits: broadcast::Sender<InitNotice>,
    kick: Notify,
    closed: AtomicBool,
}

/// Replication transport of one replicated document, independent of the
/// event channel. Reconnects with capped backoff and periodically sends the
/// full state so the relay can heal dropped updates.
pub struct DocumentChannel {
    inner: Arc<DocInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DocumentChannel {
    pub fn new(
        connector: Arc<dyn DocConnector>,
        document: Arc<ReplicatedDocument>,
        user_id: &str,
        token: &str,
        timings: DocChannelTimings,
    ) -> Self {
        let (status, _) = watch::channel(ChannelStatus::Disconnected);
        let (inits, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(DocInner {
                connector,
                document,
                user_id: user_id.to_string(),
                token: token.to_string(),
                timings,
                status,
                inits,
                kick: Notify::new(),
                closed: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    /// Start replicating; `outbound` is the queue returned by `ReplicatedDocument::attach`
    pub fn start(&self, outbound: mpsc::UnboundedReceiver<OutboundUpdate>) {
        let mut task = lock(&self.task);
        if task.is_some() {
            warn!("Replication for room {} already started", self.inner.document.room_id());
            return;
        }
        *task = Some(tokio::spawn(run(self.inner.clone(), outbound)));
    }

    pub fn status(&self) -> ChannelStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    pub fn subscribe_init(&self) -> broadcast::Receiver<InitNotice> {
        self.inner.inits.subscribe()
    }

    /// Disconnect and dial again immediately
    pub fn reconnect(&self) {
        self.inner.kick.notify_one();
    }

    pub fn stop(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        self.inner.status.send_replace(ChannelStatus::Disconnected);
    }
}

impl Drop for DocumentChannel {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

fn update_message(inner: &DocInner, update: OutboundUpdate) -> ClientDocMessage {
    ClientDocMessage::Update(UpdateMessage {
        delta: update.delta,
        user: inner.user_id.clone(),
        peer: inner.document.peer().to_string(),
        origin: update.origin.to_string(),
    })
}

fn sync_message(inner: &DocInner) -> Option<ClientDocMessage> {
    match inner.document.export_state() {
        Ok(state) => Some(ClientDocMessage::Sync(SyncMessage {
            state,
            user: inner.user_id.clone(),
            peer: inner.document.peer().to_string(),
        })),
        Err(e) => {
            warn!("Failed to export state for resync: {}", e);
            None
        }
    }
}

fn on_message(inner: &DocInner, message: ServerDocMessage) {
    let room_id = inner.document.room_id();
    match message {
        ServerDocMessage::Init(init) => {
            if let Err(e) = inner
                .document
                .apply_remote_update(&init.snapshot, OriginTag::replication_sync())
            {
                warn!("Failed to apply snapshot for room {}: {}", room_id, e);
                return;
            }
            inner.document.mark_synced();
            let _ = inner.inits.send(InitNotice { seed: init.seed });
        }
        ServerDocMessage::Update(update) => {
            if let Err(e) = inner
                .document
                .apply_remote_update(&update.delta, OriginTag::new(update.origin))
            {
                warn!("Failed to apply update from peer {} in room {}: {}", update.peer, room_id, e);
            }
        }
        ServerDocMessage::Pong(pong) => debug!("Pong for room {} at {}", room_id, pong.date),
    }
}

async fn dial(inner: &DocInner) -> Result<DocLink, SessionError> {
    let connect = inner.connector.connect(inner.document.room_id(), &inner.token);
    match tokio::time::timeout(inner.timings.connect_timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::ConnectTimeout(inner.timings.connect_timeout)),
    }
}

/// Returns `false` once the document has been detached
async fn pump(
    inner: &DocInner,
    link: DocLink,
    outbound: &mut mpsc::UnboundedReceiver<OutboundUpdate>,
) -> bool {
    let DocLink { outgoing, mut incoming } = link;

    let load = ClientDocMessage::Load(LoadMessage {
        user: inner.user_id.clone(),
        peer: inner.document.peer().to_string(),
    });
    if outgoing.send(load).is_err() {
        return true;
    }
    // Reconnecting replica: hand the relay whatever it may have missed
    if inner.document.is_synced() {
        if let Some(sync) = sync_message(inner) {
            if outgoing.send(sync).is_err() {
                return true;
            }
        }
    }

    let period = inner.timings.resync;
    let mut resync = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            message = incoming.recv() => match message {
                Some(message) => on_message(inner, message),
                None => return true,
            },
            update = outbound.recv() => match update {
                Some(update) => {
                    if outgoing.send(update_message(inner, update)).is_err() {
                        return true;
                    }
                }
                None => return false,
            },
            _ = resync.tick() => {
                if let Some(sync) = sync_message(inner) {
                    if outgoing.send(sync).is_err() {
                        return true;
                    }
                }
            }
            _ = inner.kick.notified() => {
                debug!("Replication reconnect requested for room {}", inner.document.room_id());
                return true;
            }
        }
    }
}

async fn run(inner: Arc<DocInner>, mut outbound: mpsc::UnboundedReceiver<OutboundUpdate>) {
    let room_id = inner.document.room_id().to_string();
    let mut attempt: u32 = 0;
    let mut first = true;

    while !inner.closed.load(Ordering::SeqCst) {
        inner.status.send_replace(if first {
            ChannelStatus::Connecting
        } else {
            ChannelStatus::Reconnecting
        });
        first = false;

        match dial(&inner).await {
            Ok(link) => {
                attempt = 0;
                inner.status.send_replace(ChannelStatus::Connected);
                info!("Replication connected for room {}", room_id);
                let keep_going = pump(&inner, link, &mut outbound).await;
                inner.status.send_replace(ChannelStatus::Disconnected);
                if !keep_going {
                    info!("Document for room {} detached, replication stopped", room_id);
                    break;
                }
                warn!("Replication link lost for room {}", room_id);
            }
            Err(e) => {
                inner.status.send_replace(ChannelStatus::Disconnected);
                debug!("Replication connect for room {} failed: {}", room_id, e);
            }
        }

        let delay = backoff_delay(inner.timings.backoff_base, inner.timings.backoff_cap, attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.kick.notified() => {}
        }
    }
    inner.status.send_replace(ChannelStatus::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::InitMessage;
    use std::sync::atomic::AtomicUsize;

    type FarEnd = (mpsc::UnboundedReceiver<ClientDocMessage>, mpsc::UnboundedSender<ServerDocMessage>);

    struct GatedConnector {
        gate: tokio::sync::Semaphore,
        dials: AtomicUsize,
        far_ends: Mutex<Vec<FarEnd>>,
    }

    #[async_trait]
    impl DocConnector for GatedConnector {
        async fn connect(&self, _room_id: &str, _token: &str) -> Result<DocLink, SessionError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.gate
                .acquire()
                .await
                .map_err(|e| SessionError::Transport(e.to_string()))?
                .forget();
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            lock(&self.far_ends).push((out_rx, in_tx));
            Ok(DocLink { outgoing: out_tx, incoming: in_rx })
        }
    }

    fn timings() -> DocChannelTimings {
        DocChannelTimings {
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(5),
            resync: Duration::from_secs(30),
        }
    }

    async fn until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    fn gated(permits: usize) -> Arc<GatedConnector> {
        Arc::new(GatedConnector {
            gate: tokio::sync::Semaphore::new(permits),
            dials: AtomicUsize::new(0),
            far_ends: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn loads_then_applies_init_snapshot() {
        let connector = gated(1);
        let (document, outbound) = ReplicatedDocument::attach("R1");
        let channel = DocumentChannel::new(connector.clone(), document.clone(), "u1", "t", timings());
        let mut inits = channel.subscribe_init();
        channel.start(outbound);
        until(|| !lock(&connector.far_ends).is_empty()).await;

        let (source, _) = ReplicatedDocument::attach("R1");
        source.replace_all("fn main() {}", OriginTag::initial_load()).unwrap();
        let snapshot = source.export_state().unwrap();
        {
            let mut far_ends = lock(&connector.far_ends);
            let (server_rx, server_tx) = &mut far_ends[0];
            assert!(matches!(server_rx.try_recv(), Ok(ClientDocMessage::Load(_))));
            server_tx
                .send(ServerDocMessage::Init(InitMessage { snapshot, seed: false }))
                .unwrap();
        }

        assert_eq!(inits.recv().await.unwrap(), InitNotice { seed: false });
        assert!(document.is_synced());
        assert_eq!(document.get_snapshot(), "fn main() {}");
        channel.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_during_dial_is_not_lost() {
        let connector = gated(0);
        let (document, outbound) = ReplicatedDocument::attach("R1");
        let channel = DocumentChannel::new(connector.clone(), document, "u1", "t", timings());
        channel.start(outbound);
        until(|| connector.dials.load(Ordering::SeqCst) == 1).await;

        channel.reconnect();
        connector.gate.add_permits(2);

        until(|| connector.dials.load(Ordering::SeqCst) == 2).await;
        let mut status = channel.watch_status();
        status.wait_for(|s| s.is_connected()).await.unwrap();
        channel.stop();
    }
}
