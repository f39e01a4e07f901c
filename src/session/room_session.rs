use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::arbitration::{ArbitrationTimings, SaveArbitrator, SavePrompt, SyncReport, SyncTarget};
use super::channel::{EventChannel, EventConnector};
use super::doc_channel::{DocChannelTimings, DocConnector, DocumentChannel, InitNotice};
use super::supervisor::{self, DegradedCause};
use crate::clients::RoomStore;
use crate::config::SessionConfig;
use crate::document::{
    content_checksum, DocumentChange, OriginTag, ReplicatedDocument, TextRange,
};
use crate::error::{SessionError, StoreError, SyncError};
use crate::models::{
    ClientEvent, Color, CursorPositionPayload, EmptyPayload, Identity, LanguagePayload,
    MemberRole, MemberState, Position, Room, RoomRef, RoomUpdate, SelectionPayload, SelectionRange,
    ServerEvent,
};
use crate::presence::{ColorAssigner, PresenceRegistry};

/// Collaborators a session is built from
pub struct SessionDeps {
    pub events: Arc<dyn EventConnector>,
    pub docs: Arc<dyn DocConnector>,
    pub store: Arc<dyn RoomStore>,
    pub prompt: Arc<dyn SavePrompt>,
    pub config: SessionConfig,
}

/// Who is entering which room
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub room_id: String,
    pub user_id: String,
    pub username: String,
    pub token: String,
}

/// User-facing message produced by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Toast(String),
    BlockingDialog(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Ended { room_name: String },
    ForceDeleted { room_name: String },
    /// The room disappeared from the room service
    RoomGone,
}

/// What moved the local cursor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorCause {
    User,
    DocumentChange(OriginTag),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Authoritative membership from the server, self included
    MembershipSnapshot(Vec<MemberState>),
    MemberJoined { user_id: String, username: String },
    MemberLeft { user_id: String, username: String },
    CursorMoved { user_id: String, position: Position, color: Color },
    SelectionChanged { user_id: String, selection: Option<SelectionRange> },
    TypingChanged { user_id: String, typing: bool },
    LanguageChanged(String),
    OnlineUsers(Vec<Identity>),
    DocumentChanged(DocumentChange),
    Notice(Notice),
    RoomClosed(CloseReason),
    BannerChanged(Option<DegradedCause>),
}

pub(crate) struct SessionState {
    pub(crate) presence: PresenceRegistry,
    pub(crate) colors: ColorAssigner,
    pub(crate) language: String,
    pub(crate) online_count: u32,
    pub(crate) last_sent_checksum: String,
    pub(crate) durable_content: String,
    pub(crate) last_typing_emit: Option<Instant>,
    pub(crate) local_typing_until: Option<Instant>,
    pub(crate) banner: Option<DegradedCause>,
    pub(crate) presence_stale: bool,
    /// Roles from the room service's member list
    pub(crate) room_roles: HashMap<String, MemberRole>,
}

impl SessionState {
    /// Best known role of a peer: live presence first, then the room's member list
    fn role_of(&self, user_id: &str) -> MemberRole {
        self.presence
            .get(user_id)
            .map(|entry| entry.role)
            .or_else(|| self.room_roles.get(user_id).copied())
            .unwrap_or_default()
    }

    pub(crate) fn set_room_roles(&mut self, room: &Room) {
        self.room_roles = room
            .members
            .iter()
            .map(|m| (m.user_id.clone(), m.role))
            .collect();
    }
}

/// State shared between the session handle and its background tasks
pub(crate) struct SessionShared {
    pub(crate) ctx: SessionContext,
    pub(crate) role: MemberRole,
    pub(crate) config: SessionConfig,
    pub(crate) store: Arc<dyn RoomStore>,
    pub(crate) prompt: Arc<dyn SavePrompt>,
    pub(crate) events: EventChannel,
    pub(crate) docs: DocumentChannel,
    pub(crate) document: Arc<ReplicatedDocument>,
    pub(crate) arbitrator: SaveArbitrator,
    state: Mutex<SessionState>,
    notifications: broadcast::Sender<SessionEvent>,
    network_online: AtomicBool,
    ended: AtomicBool,
}

impl SessionShared {
    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.notifications.send(event);
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn is_network_online(&self) -> bool {
        self.network_online.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_presence_stale(&self) {
        self.state().presence_stale = true;
    }

    fn target(&self) -> SyncTarget<'_> {
        SyncTarget {
            room_id: &self.ctx.room_id,
            events: &self.events,
            store: self.store.as_ref(),
            document: &self.document,
        }
    }

    fn emit_best_effort(&self, event: ClientEvent) {
        if let Err(e) = self.events.emit(event) {
            debug!("Event not sent: {}", e);
        }
    }

    fn shutdown_channels(&self) {
        self.events.disconnect();
        self.docs.stop();
        self.document.detach();
    }

    /// End the session from the inside, e.g. the room was deleted
    pub(crate) fn close(&self, reason: CloseReason) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing session for room {}: {:?}", self.ctx.room_id, reason);
        self.shutdown_channels();
        self.publish(SessionEvent::RoomClosed(reason));
    }

    fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        let now = Instant::now();
        let me = self.ctx.user_id.as_str();
        match event {
            ServerEvent::RoomJoined(payload) => {
                let others: Vec<MemberState> = payload
                    .members
                    .iter()
                    .filter(|m| m.user_id != me)
                    .cloned()
                    .collect();
                {
                    let mut state = self.state();
                    let dropped = state.presence.replace_all(others, now);
                    for user_id in dropped {
                        state.colors.evict(&user_id);
                    }
                    state
                        .colors
                        .set_online(payload.members.iter().map(|m| m.user_id.clone()));
                    state.presence_stale = false;
                }
                info!("Joined room {} with {} members", payload.room_id, payload.members.len());
                self.publish(SessionEvent::MembershipSnapshot(payload.members));
            }
            ServerEvent::UserJoined(user) => {
                if user.user_id == me {
                    return;
                }
                let is_new = {
                    let mut state = self.state();
                    let role = state.role_of(&user.user_id);
                    let identity = Identity::new(&user.user_id, &user.username, role);
                    state.presence.join(identity, now).is_new
                };
                if is_new {
                    self.publish(SessionEvent::MemberJoined {
                        user_id: user.user_id,
                        username: user.username,
                    });
                }
            }
            ServerEvent::UserLeft(user) => {
                if user.user_id == me {
                    return;
                }
                let effective = {
                    let mut state = self.state();
                    let outcome = state.presence.leave(&user.user_id, now);
                    if outcome.is_effective() {
                        state.colors.evict(&user.user_id);
                    }
                    outcome.is_effective()
                };
                if effective {
                    self.publish(SessionEvent::MemberLeft {
                        user_id: user.user_id,
                        username: user.username,
                    });
                }
            }
            ServerEvent::OnlineUsersUpdated(payload) => {
                {
                    let mut state = self.state();
                    state
                        .colors
                        .set_online(payload.online_users.iter().map(|u| u.user_id.clone()));
                    state.online_count = payload.online_users.len() as u32;
                }
                self.publish(SessionEvent::OnlineUsers(payload.online_users));
            }
            ServerEvent::CursorMoved(moved) => {
                // Never render our own cursor as a remote one
                if moved.user_id == me {
                    return;
                }
                let color = {
                    let mut state = self.state();
                    if !state.presence.contains(&moved.user_id) {
                        let role = state.role_of(&moved.user_id);
                        let identity = Identity::new(&moved.user_id, &moved.username, role);
                        state.presence.join(identity, now);
                    }
                    state.presence.update_cursor(&moved.user_id, moved.position);
                    state.colors.color_for(&moved.user_id)
                };
                self.publish(SessionEvent::CursorMoved {
                    user_id: moved.user_id,
                    position: moved.position,
                    color,
                });
            }
            ServerEvent::SelectionChange(change) => {
                if change.user_id == me {
                    return;
                }
                self.state()
                    .presence
                    .update_selection(&change.user_id, Some(change.selection));
                self.publish(SessionEvent::SelectionChanged {
                    user_id: change.user_id,
                    selection: Some(change.selection),
                });
            }
            ServerEvent::SelectionClear(user) => {
                if user.user_id == me {
                    return;
                }
                self.state().presence.update_selection(&user.user_id, None);
                self.publish(SessionEvent::SelectionChanged {
                    user_id: user.user_id,
                    selection: None,
                });
            }
            ServerEvent::UserTyping(user) => {
                if user.user_id == me {
                    return;
                }
                let started = self.state().presence.set_typing(&user.user_id, now);
                if started {
                    self.publish(SessionEvent::TypingChanged {
                        user_id: user.user_id,
                        typing: true,
                    });
                }
            }
            ServerEvent::UserStoppedTyping(user) => {
                if user.user_id == me {
                    return;
                }
                let stopped = self.state().presence.clear_typing(&user.user_id, now);
                if stopped {
                    self.publish(SessionEvent::TypingChanged {
                        user_id: user.user_id,
                        typing: false,
                    });
                }
            }
            ServerEvent::LanguageChanged(payload) => {
                self.state().language = payload.language.clone();
                self.publish(SessionEvent::LanguageChanged(payload.language));
            }
            ServerEvent::RequestCreatorSave(request) => {
                if self.role != MemberRole::Admin {
                    return;
                }
                let shared = self.clone();
                tokio::spawn(async move { shared.answer_save_request(request.requested_by_username).await });
            }
            ServerEvent::ContentSavedConfirmation(_) => self.arbitrator.confirm(),
            ServerEvent::RoomEnded(payload) => self.close(CloseReason::Ended {
                room_name: payload.room_name,
            }),
            ServerEvent::RoomForceDeleted(payload) => self.close(CloseReason::ForceDeleted {
                room_name: payload.room_name,
            }),
            ServerEvent::Error(payload) => {
                warn!("Room server error: {}", payload.message);
                self.publish(SessionEvent::Notice(Notice::Toast(payload.message)));
            }
        }
    }

    async fn answer_save_request(&self, requested_by: String) {
        let language = self.state().language.clone();
        let result = self
            .arbitrator
            .respond(&self.target(), self.prompt.as_ref(), &requested_by, &language)
            .await;
        match result {
            Ok(Some(checksum)) => self.state().last_sent_checksum = checksum,
            Ok(None) => {}
            Err(e) => self.surface_sync_error(&e),
        }
    }

    fn on_init(&self, notice: InitNotice) {
        if !notice.seed {
            return;
        }
        let content = self.state().durable_content.clone();
        if content.is_empty() || !self.document.get_snapshot().is_empty() {
            return;
        }
        match self.document.replace_all(&content, OriginTag::initial_load()) {
            Ok(_) => info!("Seeded room {} from stored content", self.ctx.room_id),
            Err(e) => error!("Failed to seed room {}: {}", self.ctx.room_id, e),
        }
    }

    fn surface_sync_error(&self, error: &SyncError) {
        match error {
            SyncError::RoomGone(_) => self.close(CloseReason::RoomGone),
            SyncError::Store(StoreError::Rejected { message, .. }) => {
                self.publish(SessionEvent::Notice(Notice::BlockingDialog(format!(
                    "The room service refused the content: {}",
                    message
                ))))
            }
            SyncError::InFlight | SyncError::CoolingDown(_) | SyncError::IsCreator => {}
            other => {
                warn!("Sync for room {} failed: {}", self.ctx.room_id, other);
                self.publish(SessionEvent::Notice(Notice::Toast(format!(
                    "Could not sync with the room creator: {}",
                    other
                ))));
            }
        }
    }
}

async fn event_loop(
    shared: Arc<SessionShared>,
    mut server_events: broadcast::Receiver<ServerEvent>,
    mut inits: broadcast::Receiver<InitNotice>,
    mut changes: broadcast::Receiver<DocumentChange>,
) {
    loop {
        tokio::select! {
            event = server_events.recv() => match event {
                Ok(event) => shared.handle_server_event(event),
                Err(RecvError::Lagged(n)) => warn!("Session lagged behind {} server events", n),
                Err(RecvError::Closed) => break,
            },
            notice = inits.recv() => match notice {
                Ok(notice) => shared.on_init(notice),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            change = changes.recv() => match change {
                Ok(change) if !change.local => shared.publish(SessionEvent::DocumentChanged(change)),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => debug!("Skipped {} document notifications", n),
                Err(RecvError::Closed) => break,
            },
        }
        if shared.is_ended() {
            break;
        }
    }
}

/// One active room membership on the client.
///
/// Owns the event channel, the replicated document and its replication
/// channel, and the background tasks supervising them. Dropping the session
/// stops everything; `leave` additionally tells the server and room service.
pub struct RoomSession {
    shared: Arc<SessionShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoomSession {
    pub async fn enter(ctx: SessionContext, deps: SessionDeps) -> Result<Self, SessionError> {
        let SessionDeps {
            events: event_connector,
            docs: doc_connector,
            store,
            prompt,
            config,
        } = deps;

        store.join_room(&ctx.room_id).await.map_err(room_gone)?;
        let room = store.get_room(&ctx.room_id, true).await.map_err(room_gone)?;
        let role = room.role_of(&ctx.user_id);
        info!("Entering room {} as {:?}", ctx.room_id, role);

        let events = EventChannel::new(
            event_connector,
            config.connect_timeout(),
            config.doc_backoff_base(),
            config.event_backoff_cap(),
        );
        let (document, outbound) = ReplicatedDocument::attach(&ctx.room_id);
        let docs = DocumentChannel::new(
            doc_connector,
            document.clone(),
            &ctx.user_id,
            &ctx.token,
            DocChannelTimings {
                connect_timeout: config.connect_timeout(),
                backoff_base: config.doc_backoff_base(),
                backoff_cap: config.doc_backoff_cap(),
                resync: config.doc_resync(),
            },
        );
        let arbitrator = SaveArbitrator::new(ArbitrationTimings {
            confirm_timeout: config.save_confirm_timeout(),
            settle_delay: config.save_settle_delay(),
            cooldown: config.sync_cooldown(),
        });

        let mut colors = ColorAssigner::new();
        colors.set_online([ctx.user_id.clone()]);
        let mut state = SessionState {
            presence: PresenceRegistry::new(config.typing_timeout(), config.leave_dedupe()),
            colors,
            language: room.language.clone(),
            online_count: room.online_count,
            last_sent_checksum: content_checksum(&room.content),
            durable_content: room.content.clone(),
            last_typing_emit: None,
            local_typing_until: None,
            banner: None,
            presence_stale: true,
            room_roles: HashMap::new(),
        };
        state.set_room_roles(&room);

        let (notifications, _) = broadcast::channel(512);
        let shared = Arc::new(SessionShared {
            role,
            config,
            store,
            prompt,
            events,
            docs,
            document,
            arbitrator,
            state: Mutex::new(state),
            notifications,
            network_online: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            ctx,
        });

        // Subscribe before anything can arrive
        let server_events = shared.events.subscribe();
        let inits = shared.docs.subscribe_init();
        let changes = shared.document.subscribe();
        let tasks = vec![
            tokio::spawn(event_loop(shared.clone(), server_events, inits, changes)),
            tokio::spawn(supervisor::supervise(shared.clone())),
        ];

        if let Err(e) = shared.events.connect(&shared.ctx.token).await {
            // Keeps retrying in the background; the banner shows the state
            warn!("Event channel unavailable for room {}: {}", shared.ctx.room_id, e);
        }
        let identity = Identity::new(&shared.ctx.user_id, &shared.ctx.username, role);
        if let Err(e) = shared.events.join_room(&shared.ctx.room_id, identity) {
            debug!("Join deferred until the event channel connects: {}", e);
        }
        shared.docs.start(outbound);

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn room_id(&self) -> &str {
        &self.shared.ctx.room_id
    }

    pub fn user_id(&self) -> &str {
        &self.shared.ctx.user_id
    }

    pub fn role(&self) -> MemberRole {
        self.shared.role
    }

    pub fn document(&self) -> Arc<ReplicatedDocument> {
        self.shared.document.clone()
    }

    pub fn content(&self) -> String {
        self.shared.document.get_snapshot()
    }

    pub fn language(&self) -> String {
        self.shared.state().language.clone()
    }

    pub fn online_count(&self) -> u32 {
        self.shared.state().online_count
    }

    pub fn is_ended(&self) -> bool {
        self.shared.is_ended()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.notifications.subscribe()
    }

    /// Remote members as last reported, without the local user
    pub fn presence(&self) -> Vec<MemberState> {
        self.shared.state().presence.snapshot(Instant::now())
    }

    /// `true` from an event-channel disconnect until the next membership snapshot
    pub fn presence_is_stale(&self) -> bool {
        self.shared.state().presence_stale
    }

    pub fn color_for(&self, user_id: &str) -> Color {
        self.shared.state().colors.color_for(user_id)
    }

    pub fn banner(&self) -> Option<DegradedCause> {
        self.shared.state().banner
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.shared.is_ended() {
            Err(SessionError::Ended)
        } else {
            Ok(())
        }
    }

    /// Apply an edit typed into the editor and announce typing activity
    pub fn edit(&self, range: TextRange, text: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.shared.document.apply_local_edit(range, text)?;

        let now = Instant::now();
        let emit = {
            let mut state = self.shared.state();
            state.local_typing_until = Some(now + self.shared.config.typing_timeout());
            let due = state
                .last_typing_emit
                .map(|at| now.saturating_duration_since(at) >= self.shared.config.typing_emit_interval())
                .unwrap_or(true);
            if due {
                state.last_typing_emit = Some(now);
            }
            due
        };
        if emit {
            self.shared.emit_best_effort(ClientEvent::UserTyping(RoomRef {
                room_id: self.shared.ctx.room_id.clone(),
            }));
        }
        Ok(())
    }

    /// Broadcast the local cursor. Moves caused by changes that did not come
    /// from this replica's editor are not broadcast; returns whether it was sent.
    pub fn move_cursor(&self, position: Position, cause: CursorCause) -> Result<bool, SessionError> {
        self.ensure_active()?;
        if let CursorCause::DocumentChange(origin) = &cause {
            if !self.shared.document.is_local_origin(origin) {
                return Ok(false);
            }
        }
        self.shared
            .events
            .emit(ClientEvent::CursorPosition(CursorPositionPayload { position }))?;
        Ok(true)
    }

    pub fn select(&self, selection: Option<SelectionRange>) -> Result<(), SessionError> {
        self.ensure_active()?;
        let event = match selection {
            Some(selection) => ClientEvent::SelectionChange(SelectionPayload { selection }),
            None => ClientEvent::SelectionClear(EmptyPayload::default()),
        };
        self.shared.events.emit(event)
    }

    pub async fn set_language(&self, language: &str) -> Result<(), SessionError> {
        self.ensure_active()?;
        self.shared.state().language = language.to_string();
        self.shared.emit_best_effort(ClientEvent::LanguageChange(LanguagePayload {
            language: language.to_string(),
        }));

        let update = RoomUpdate {
            content: None,
            language: Some(language.to_string()),
        };
        match self.shared.store.update_room(&self.shared.ctx.room_id, update).await {
            Ok(()) => Ok(()),
            Err(StoreError::NotFound(room_id)) => {
                self.shared.close(CloseReason::RoomGone);
                Err(SessionError::RoomGone(room_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pull the creator's latest content through the save handshake
    pub async fn request_sync(&self) -> Result<SyncReport, SyncError> {
        self.ensure_active()?;
        let shared = &self.shared;
        let language = shared.state().language.clone();
        let result = shared
            .arbitrator
            .request(
                &shared.target(),
                &shared.ctx.username,
                shared.role == MemberRole::Admin,
                &language,
            )
            .await;

        match &result {
            Ok(report) => {
                let language_changed = {
                    let mut state = shared.state();
                    state.last_sent_checksum = report.checksum.clone();
                    match &report.language {
                        Some(language) => {
                            state.language = language.clone();
                            true
                        }
                        None => false,
                    }
                };
                if let (true, Some(language)) = (language_changed, &report.language) {
                    shared.publish(SessionEvent::LanguageChanged(language.clone()));
                }
            }
            Err(e) => shared.surface_sync_error(e),
        }
        result
    }

    /// Disconnect and redial both channels without waiting for backoff
    pub fn reconnect_now(&self) {
        if self.shared.is_ended() {
            return;
        }
        info!("Manual reconnect for room {}", self.shared.ctx.room_id);
        self.shared.docs.reconnect();
        self.shared.events.reconnect();
    }

    /// Report OS-level connectivity; offline suspends autosave
    pub fn set_network_online(&self, online: bool) {
        self.shared.network_online.store(online, Ordering::SeqCst);
        supervisor::refresh_banner(&self.shared);
    }

    /// Push the live content to the room service now if it changed
    pub async fn save_now(&self) {
        supervisor::autosave_once(&self.shared).await;
    }

    pub async fn leave(self) {
        if !self.shared.ended.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.shared.events.leave_room() {
                debug!("Leave not sent: {}", e);
            }
            self.shared.shutdown_channels();
        }
        self.abort_tasks();
        if let Err(e) = self.shared.store.leave_room(&self.shared.ctx.room_id).await {
            warn!("Leaving room {} at the room service failed: {}", self.shared.ctx.room_id, e);
        }
        info!("Left room {}", self.shared.ctx.room_id);
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.abort_tasks();
        if !self.shared.ended.swap(true, Ordering::SeqCst) {
            self.shared.shutdown_channels();
        }
    }
}

fn room_gone(error: StoreError) -> SessionError {
    match error {
        StoreError::NotFound(room_id) => SessionError::RoomGone(room_id),
        other => SessionError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MemoryRoomStore;
    use crate::ws::{DocRelay, LocalDocConnector, LocalEventConnector, RoomHub};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Accept;

    #[async_trait]
    impl SavePrompt for Accept {
        async fn confirm_save(&self, _requested_by: &str) -> bool {
            true
        }
    }

    async fn solo_session(store: Arc<MemoryRoomStore>) -> RoomSession {
        let config = SessionConfig::default();
        store.insert_room(MemoryRoomStore::room_with_members("R1", "Solo", ("u-alice", "alice"), &[]));
        let hub = Arc::new(RoomHub::new(config.typing_timeout(), config.leave_dedupe()));
        let session = RoomSession::enter(
            SessionContext {
                room_id: "R1".to_string(),
                user_id: "u-alice".to_string(),
                username: "alice".to_string(),
                token: "t".to_string(),
            },
            SessionDeps {
                events: Arc::new(LocalEventConnector::new(hub)),
                docs: Arc::new(LocalDocConnector::new(Arc::new(DocRelay::new()))),
                store,
                prompt: Arc::new(Accept),
                config,
            },
        )
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(30), async {
            while !session.document().is_synced() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();
        session
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_skips_while_remote_update_is_applied() {
        let store = Arc::new(MemoryRoomStore::new());
        let session = solo_session(store.clone()).await;
        session.edit(TextRange::caret(0), "draft").unwrap();

        session.shared.document.hold_remote_phase().unwrap();
        session.save_now().await;
        assert_eq!(store.update_count(), 0);

        session.shared.document.release_remote_phase();
        session.save_now().await;
        let updates = store.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.content.as_deref(), Some("draft"));
    }
}
