use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::supervisor::backoff_delay;
use crate::error::SessionError;
use crate::models::{ClientEvent, EmptyPayload, Identity, JoinRoomPayload, ServerEvent};

/// One established event-channel connection
pub struct EventLink {
    pub outgoing: mpsc::UnboundedSender<ClientEvent>,
    pub incoming: mpsc::UnboundedReceiver<ServerEvent>,
}

/// Opens event-channel connections to the room server
#[async_trait]
pub trait EventConnector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<EventLink, SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl ChannelStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelStatus::Connected)
    }
}

type EventHandler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ChannelInner {
    connector: Arc<dyn EventConnector>,
    connect_timeout: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    token: Mutex<Option<String>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    membership: Mutex<Option<JoinRoomPayload>>,
    handlers: Mutex<HashMap<&'static str, Vec<EventHandler>>>,
    events: broadcast::Sender<ServerEvent>,
    status: watch::Sender<ChannelStatus>,
    kick: Notify,
    closed: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Reconnecting channel carrying membership, ephemeral and arbitration events.
///
/// Membership does not survive a reconnect: whenever a new link is installed
/// and the channel holds a room membership, `join-room` is sent again with the
/// last known identity.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<ChannelInner>,
}

impl EventChannel {
    pub fn new(
        connector: Arc<dyn EventConnector>,
        connect_timeout: Duration,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(512);
        let (status, _) = watch::channel(ChannelStatus::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                connector,
                connect_timeout,
                backoff_base,
                backoff_cap,
                token: Mutex::new(None),
                outgoing: Mutex::new(None),
                membership: Mutex::new(None),
                handlers: Mutex::new(HashMap::new()),
                events,
                status,
                kick: Notify::new(),
                closed: AtomicBool::new(false),
                pump: Mutex::new(None),
            }),
        }
    }

    /// Connect and start supervising the link.
    ///
    /// Fails when no connection is established within the connect timeout or
    /// the transport reports an error. The channel keeps retrying in the
    /// background either way.
    pub async fn connect(&self, token: &str) -> Result<(), SessionError> {
        *lock(&self.inner.token) = Some(token.to_string());
        self.inner.closed.store(false, Ordering::SeqCst);
        if let Some(pump) = lock(&self.inner.pump).take() {
            pump.abort();
        }

        self.inner.status.send_replace(ChannelStatus::Connecting);
        let result = dial(&self.inner).await;
        let (initial, outcome) = match result {
            Ok(link) => (Some(install(&self.inner, link)), Ok(())),
            Err(e) => {
                warn!("Event channel connect failed: {}", e);
                self.inner.status.send_replace(ChannelStatus::Disconnected);
                (None, Err(e))
            }
        };

        let inner = self.inner.clone();
        *lock(&self.inner.pump) = Some(tokio::spawn(run(inner, initial)));
        outcome
    }

    /// Join a room and remember the membership for re-joins
    pub fn join_room(&self, room_id: &str, identity: Identity) -> Result<(), SessionError> {
        let payload = JoinRoomPayload {
            room_id: room_id.to_string(),
            user: identity,
        };
        *lock(&self.inner.membership) = Some(payload.clone());
        self.emit(ClientEvent::JoinRoom(payload))
    }

    pub fn leave_room(&self) -> Result<(), SessionError> {
        if lock(&self.inner.membership).take().is_none() {
            return Ok(());
        }
        self.emit(ClientEvent::LeaveRoom(EmptyPayload::default()))
    }

    pub fn current_room(&self) -> Option<String> {
        lock(&self.inner.membership).as_ref().map(|m| m.room_id.clone())
    }

    pub fn emit(&self, event: ClientEvent) -> Result<(), SessionError> {
        match lock(&self.inner.outgoing).as_ref() {
            Some(tx) => tx.send(event).map_err(|_| SessionError::NotConnected),
            None => Err(SessionError::NotConnected),
        }
    }

    /// Register a handler for one server event name, e.g. `"user-left"`
    pub fn on<F>(&self, event: &'static str, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.handlers)
            .entry(event)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> ChannelStatus {
        *self.inner.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.status.subscribe()
    }

    /// Drop the current link, if any, and dial again without waiting for backoff
    pub fn reconnect(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        let running = lock(&self.inner.pump)
            .as_ref()
            .map(|pump| !pump.is_finished())
            .unwrap_or(false);
        if running {
            self.inner.kick.notify_one();
        } else if lock(&self.inner.token).is_some() {
            let inner = self.inner.clone();
            *lock(&self.inner.pump) = Some(tokio::spawn(run(inner, None)));
        }
    }

    pub fn disconnect(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        lock(&self.inner.outgoing).take();
        if let Some(pump) = lock(&self.inner.pump).take() {
            pump.abort();
        }
        self.inner.status.send_replace(ChannelStatus::Disconnected);
        info!("Event channel disconnected");
    }
}

async fn dial(inner: &ChannelInner) -> Result<EventLink, SessionError> {
    let token = lock(&inner.token).clone().unwrap_or_default();
    match tokio::time::timeout(inner.connect_timeout, inner.connector.connect(&token)).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::ConnectTimeout(inner.connect_timeout)),
    }
}

fn install(inner: &ChannelInner, link: EventLink) -> mpsc::UnboundedReceiver<ServerEvent> {
    let EventLink { outgoing, incoming } = link;
    let membership = lock(&inner.membership).clone();
    if let Some(payload) = membership {
        info!("Re-joining room {} after connect", payload.room_id);
        if outgoing.send(ClientEvent::JoinRoom(payload)).is_err() {
            warn!("Link closed before re-join could be sent");
        }
    }
    *lock(&inner.outgoing) = Some(outgoing);
    inner.status.send_replace(ChannelStatus::Connected);
    info!("Event channel connected");
    incoming
}

fn dispatch(inner: &ChannelInner, event: ServerEvent) {
    let handlers = lock(&inner.handlers)
        .get(event.name())
        .cloned()
        .unwrap_or_default();
    for handler in handlers {
        handler(&event);
    }
    // Nobody listening is fine
    let _ = inner.events.send(event);
}

async fn run(inner: Arc<ChannelInner>, initial: Option<mpsc::UnboundedReceiver<ServerEvent>>) {
    let mut incoming = initial;
    let mut attempt: u32 = 0;

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }

        match incoming.take() {
            Some(mut rx) => {
                attempt = 0;
                loop {
                    tokio::select! {
                        event = rx.recv() => match event {
                            Some(event) => dispatch(&inner, event),
                            None => {
                                warn!("Event channel link lost");
                                break;
                            }
                        },
                        _ = inner.kick.notified() => {
                            debug!("Event channel reconnect requested");
                            break;
                        }
                    }
                }
                lock(&inner.outgoing).take();
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.status.send_replace(ChannelStatus::Disconnected);
            }
            None => {
                let delay = backoff_delay(inner.backoff_base, inner.backoff_cap, attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = inner.kick.notified() => {}
                }
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }

                inner.status.send_replace(ChannelStatus::Reconnecting);
                match dial(&inner).await {
                    Ok(link) => incoming = Some(install(&inner, link)),
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        debug!("Event channel reconnect attempt {} failed: {}", attempt, e);
                        inner.status.send_replace(ChannelStatus::Disconnected);
                    }
                }
            }
        }
    }
}
