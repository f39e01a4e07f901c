use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast::error::RecvError, mpsc, oneshot};
use tracing::debug;

use super::docrelay::DocRelay;
use super::roomhub::RoomHub;
use crate::auth::auth::OPEN_ACCESS_PRPL;
use crate::error::SessionError;
use crate::models::{ClientDocMessage, ClientEvent, ServerDocMessage, ServerEvent};
use crate::session::{DocConnector, DocLink, EventConnector, EventLink};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handles to cut live in-process links, as a dropped socket would
#[derive(Default)]
struct Links {
    available: AtomicBool,
    dials: AtomicUsize,
    kills: Mutex<Vec<oneshot::Sender<()>>>,
}

impl Links {
    fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            ..Self::default()
        }
    }

    fn open(&self) -> Result<oneshot::Receiver<()>, SessionError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("server unavailable".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        lock(&self.kills).push(tx);
        Ok(rx)
    }

    fn sever(&self) {
        for kill in lock(&self.kills).drain(..) {
            let _ = kill.send(());
        }
    }
}

/// Connects event channels straight to an in-process `RoomHub`
pub struct LocalEventConnector {
    hub: Arc<RoomHub>,
    links: Links,
}

impl LocalEventConnector {
    pub fn new(hub: Arc<RoomHub>) -> Self {
        Self {
            hub,
            links: Links::new(),
        }
    }

    /// Drop every live link
    pub fn sever(&self) {
        self.links.sever();
    }

    /// Refuse (or accept again) new connections
    pub fn set_available(&self, available: bool) {
        self.links.available.store(available, Ordering::SeqCst);
    }

    /// Number of connection attempts so far
    pub fn dials(&self) -> usize {
        self.links.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventConnector for LocalEventConnector {
    async fn connect(&self, _token: &str) -> Result<EventLink, SessionError> {
        let kill = self.links.open()?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_events(self.hub.clone(), out_rx, in_tx, kill));
        Ok(EventLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

async fn serve_events(
    hub: Arc<RoomHub>,
    mut inbound: mpsc::UnboundedReceiver<ClientEvent>,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    mut kill: oneshot::Receiver<()>,
) {
    // In-process links stand in for an open server
    let (conn, mut events) = hub.open_connection(vec![OPEN_ACCESS_PRPL.to_string()]).await;
    loop {
        tokio::select! {
            event = inbound.recv() => match event {
                Some(event) => hub.handle(conn, event).await,
                None => break,
            },
            event = events.recv() => match event {
                Some(event) => {
                    if outbound.send(event).is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut kill => {
                debug!("Local event link {} severed", conn);
                break;
            }
        }
    }
    hub.close(conn).await;
}

/// Connects replication channels straight to an in-process `DocRelay`
pub struct LocalDocConnector {
    relay: Arc<DocRelay>,
    links: Links,
}

impl LocalDocConnector {
    pub fn new(relay: Arc<DocRelay>) -> Self {
        Self {
            relay,
            links: Links::new(),
        }
    }

    pub fn sever(&self) {
        self.links.sever();
    }

    pub fn set_available(&self, available: bool) {
        self.links.available.store(available, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.links.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocConnector for LocalDocConnector {
    async fn connect(&self, room_id: &str, _token: &str) -> Result<DocLink, SessionError> {
        let kill = self.links.open()?;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_docs(
            self.relay.clone(),
            room_id.to_string(),
            out_rx,
            in_tx,
            kill,
        ));
        Ok(DocLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

async fn serve_docs(
    relay: Arc<DocRelay>,
    room_id: String,
    mut inbound: mpsc::UnboundedReceiver<ClientDocMessage>,
    outbound: mpsc::UnboundedSender<ServerDocMessage>,
    mut kill: oneshot::Receiver<()>,
) {
    let subscription = relay.subscribe(&room_id).await;
    let mut updates = subscription.updates();
    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(message) => {
                    if let Some(reply) = relay.handle(&subscription, message) {
                        if outbound.send(reply).is_err() {
                            break;
                        }
                    }
                }
                None => break,
            },
            broadcast = updates.recv() => match broadcast {
                Ok(message) => {
                    if subscription.is_own(&message) {
                        continue;
                    }
                    if outbound.send(ServerDocMessage::Update(message.update)).is_err() {
                        break;
                    }
                }
                // Periodic resync heals what a lagging replica skipped
                Err(RecvError::Lagged(n)) => debug!("Local replica lagged {} updates", n),
                Err(RecvError::Closed) => break,
            },
            _ = &mut kill => break,
        }
    }
    relay.unsubscribe(&subscription).await;
}
