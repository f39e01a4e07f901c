use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::auth;
use crate::models::{
    ClientEvent, CursorMovedPayload, ErrorPayload, Identity, JoinRoomPayload, LanguagePayload,
    MemberRole, OnlineUsersPayload, RemoteSelectionPayload, RoomClosedPayload, RoomJoinedPayload, RoomRef,
    ServerEvent, UserPayload, UserRef,
};
use crate::presence::{LeaveOutcome, PresenceRegistry};

pub type ConnId = u64;

struct RoomMember {
    identity: Identity,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

struct RoomState {
    presence: PresenceRegistry,
    members: HashMap<ConnId, RoomMember>,
    pending_saves: HashSet<ConnId>,
    /// User holding the creator seat; one per room for the room's lifetime
    admin: Option<String>,
    /// Set once the room has been dropped from the hub
    closed: bool,
}

impl RoomState {
    fn new(typing_timeout: Duration, leave_dedupe: Duration) -> Self {
        Self {
            presence: PresenceRegistry::new(typing_timeout, leave_dedupe),
            members: HashMap::new(),
            pending_saves: HashSet::new(),
            admin: None,
            closed: false,
        }
    }

    fn send_to(&self, conn: ConnId, event: ServerEvent) {
        if let Some(member) = self.members.get(&conn) {
            let _ = member.tx.send(event);
        }
    }

    fn broadcast(&self, event: &ServerEvent, except: Option<ConnId>) {
        for (conn, member) in &self.members {
            if Some(*conn) != except {
                let _ = member.tx.send(event.clone());
            }
        }
    }

    fn user_connected(&self, user_id: &str) -> bool {
        self.members.values().any(|m| m.identity.user_id == user_id)
    }

    fn online_users(&self, room_id: &str) -> ServerEvent {
        ServerEvent::OnlineUsersUpdated(OnlineUsersPayload {
            room_id: room_id.to_string(),
            online_users: self.presence.online_users(),
        })
    }
}

struct Connection {
    tx: mpsc::UnboundedSender<ServerEvent>,
    principals: Vec<String>,
    room: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
    pub members: usize,
}

/// Server side of the event channel.
///
/// Each room's membership and presence live behind their own lock, so all
/// mutation of one room is serialized while rooms proceed independently.
pub struct RoomHub {
    next_conn: AtomicU64,
    connections: RwLock<HashMap<ConnId, Connection>>,
    rooms: RwLock<HashMap<String, Arc<Mutex<RoomState>>>>,
    typing_timeout: Duration,
    leave_dedupe: Duration,
}

impl RoomHub {
    pub fn new(typing_timeout: Duration, leave_dedupe: Duration) -> Self {
        Self {
            next_conn: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            typing_timeout,
            leave_dedupe,
        }
    }

    /// Register a socket authenticated as `principals`; events for it arrive
    /// on the returned receiver
    pub async fn open_connection(
        &self,
        principals: Vec<String>,
    ) -> (ConnId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(
            conn,
            Connection {
                tx,
                principals,
                room: None,
            },
        );
        debug!("Event connection {} opened", conn);
        (conn, rx)
    }

    pub async fn close(&self, conn: ConnId) {
        self.leave_current(conn).await;
        self.connections.write().await.remove(&conn);
        debug!("Event connection {} closed", conn);
    }

    pub async fn handle(&self, conn: ConnId, event: ClientEvent) {
        match event {
            ClientEvent::JoinRoom(payload) => self.join(conn, payload).await,
            ClientEvent::LeaveRoom(_) => self.leave_current(conn).await,
            other => self.relay(conn, other).await,
        }
    }

    async fn room_of(&self, conn: ConnId) -> Option<String> {
        self.connections
            .read()
            .await
            .get(&conn)
            .and_then(|c| c.room.clone())
    }

    /// Report a refused event back to its connection
    pub async fn reject(&self, conn: ConnId, message: String) {
        if let Some(connection) = self.connections.read().await.get(&conn) {
            let _ = connection.tx.send(ServerEvent::Error(ErrorPayload { message }));
        }
    }

    async fn join(&self, conn: ConnId, payload: JoinRoomPayload) {
        let JoinRoomPayload { room_id, mut user } = payload;
        let tx = match self.connections.read().await.get(&conn) {
            Some(connection) => {
                if let Some(token_user) = auth::user_of(&connection.principals) {
                    if token_user != user.user_id {
                        warn!(
                            "Connection {} authenticated as {} tried to join as {}",
                            conn, token_user, user.user_id
                        );
                        let _ = connection.tx.send(ServerEvent::Error(ErrorPayload {
                            message: "Joining user does not match the token".to_string(),
                        }));
                        return;
                    }
                }
                connection.tx.clone()
            }
            None => return,
        };

        if let Some(current) = self.room_of(conn).await {
            if current != room_id {
                self.leave_current(conn).await;
            }
        }

        loop {
            let room = {
                let mut rooms = self.rooms.write().await;
                rooms
                    .entry(room_id.clone())
                    .or_insert_with(|| {
                        Arc::new(Mutex::new(RoomState::new(self.typing_timeout, self.leave_dedupe)))
                    })
                    .clone()
            };
            let mut state = room.lock().await;
            if state.closed {
                // Raced with the room being dropped; retire it and start fresh
                drop(state);
                let mut rooms = self.rooms.write().await;
                if rooms.get(&room_id).map(|r| Arc::ptr_eq(r, &room)).unwrap_or(false) {
                    rooms.remove(&room_id);
                }
                continue;
            }

            if user.is_admin() {
                match state.admin.clone() {
                    Some(admin) if admin != user.user_id => {
                        warn!(
                            "User {} claimed admin in room {} held by {}; joined as member",
                            user.user_id, room_id, admin
                        );
                        user.role = MemberRole::Member;
                    }
                    _ => state.admin = Some(user.user_id.clone()),
                }
            }

            let first_connection = !state.user_connected(&user.user_id);
            let outcome = state.presence.join(user.clone(), Instant::now());
            state.members.insert(
                conn,
                RoomMember {
                    identity: user.clone(),
                    tx: tx.clone(),
                },
            );

            state.send_to(
                conn,
                ServerEvent::RoomJoined(RoomJoinedPayload {
                    room_id: room_id.clone(),
                    members: outcome.snapshot,
                }),
            );
            if first_connection {
                let joined = ServerEvent::UserJoined(UserPayload {
                    user_id: user.user_id.clone(),
                    username: user.username.clone(),
                });
                state.broadcast(&joined, Some(conn));
            }
            state.broadcast(&state.online_users(&room_id), None);
            break;
        }

        if let Some(connection) = self.connections.write().await.get_mut(&conn) {
            connection.room = Some(room_id.clone());
        }
        info!("User {} joined room {} on connection {}", user.user_id, room_id, conn);
    }

    async fn leave_current(&self, conn: ConnId) {
        let room_id = {
            let mut connections = self.connections.write().await;
            match connections.get_mut(&conn).and_then(|c| c.room.take()) {
                Some(room_id) => room_id,
                None => return,
            }
        };
        let room = match self.rooms.read().await.get(&room_id) {
            Some(room) => room.clone(),
            None => return,
        };

        let empty = {
            let mut state = room.lock().await;
            let member = match state.members.remove(&conn) {
                Some(member) => member,
                None => return,
            };
            state.pending_saves.remove(&conn);

            let user_id = member.identity.user_id;
            if !state.user_connected(&user_id) {
                let outcome = state.presence.leave(&user_id, Instant::now());
                if let LeaveOutcome::Left(entry) = outcome {
                    let left = ServerEvent::UserLeft(UserPayload {
                        user_id: entry.user_id,
                        username: entry.username,
                    });
                    state.broadcast(&left, None);
                }
                state.broadcast(&state.online_users(&room_id), None);
                info!("User {} left room {}", user_id, room_id);
            }

            if state.members.is_empty() {
                state.closed = true;
            }
            state.closed
        };

        if empty {
            let mut rooms = self.rooms.write().await;
            if rooms.get(&room_id).map(|r| Arc::ptr_eq(r, &room)).unwrap_or(false) {
                rooms.remove(&room_id);
                debug!("Room {} is empty and was dropped", room_id);
            }
        }
    }

    async fn relay(&self, conn: ConnId, event: ClientEvent) {
        let room_id = match self.room_of(conn).await {
            Some(room_id) => room_id,
            None => {
                self.reject(conn, "Join a room first".to_string()).await;
                return;
            }
        };
        let room = match self.rooms.read().await.get(&room_id) {
            Some(room) => room.clone(),
            None => return,
        };

        let mut state = room.lock().await;
        let sender = match state.members.get(&conn) {
            Some(member) => member.identity.clone(),
            None => return,
        };
        let now = Instant::now();

        match event {
            ClientEvent::CursorPosition(payload) => {
                state.presence.update_cursor(&sender.user_id, payload.position);
                let moved = ServerEvent::CursorMoved(CursorMovedPayload {
                    user_id: sender.user_id,
                    username: sender.username,
                    position: payload.position,
                });
                state.broadcast(&moved, Some(conn));
            }
            ClientEvent::SelectionChange(payload) => {
                state
                    .presence
                    .update_selection(&sender.user_id, Some(payload.selection));
                let change = ServerEvent::SelectionChange(RemoteSelectionPayload {
                    user_id: sender.user_id,
                    username: sender.username,
                    selection: payload.selection,
                });
                state.broadcast(&change, Some(conn));
            }
            ClientEvent::SelectionClear(_) => {
                state.presence.update_selection(&sender.user_id, None);
                let clear = ServerEvent::SelectionClear(UserRef {
                    user_id: sender.user_id,
                });
                state.broadcast(&clear, Some(conn));
            }
            ClientEvent::UserTyping(_) => {
                state.presence.set_typing(&sender.user_id, now);
                let typing = ServerEvent::UserTyping(UserPayload {
                    user_id: sender.user_id,
                    username: sender.username,
                });
                state.broadcast(&typing, Some(conn));
            }
            ClientEvent::UserStoppedTyping(_) => {
                state.presence.clear_typing(&sender.user_id, now);
                let stopped = ServerEvent::UserStoppedTyping(UserRef {
                    user_id: sender.user_id,
                });
                state.broadcast(&stopped, Some(conn));
            }
            ClientEvent::LanguageChange(payload) => {
                let changed = ServerEvent::LanguageChanged(LanguagePayload {
                    language: payload.language,
                });
                state.broadcast(&changed, Some(conn));
            }
            ClientEvent::RequestCreatorSave(payload) => {
                let admins: Vec<ConnId> = state
                    .members
                    .iter()
                    .filter(|(c, m)| **c != conn && m.identity.is_admin())
                    .map(|(c, _)| *c)
                    .collect();
                if admins.is_empty() {
                    debug!("No creator online in room {} to answer a save request", room_id);
                }
                state.pending_saves.insert(conn);
                let request = ServerEvent::RequestCreatorSave(payload);
                for admin in admins {
                    state.send_to(admin, request.clone());
                }
            }
            ClientEvent::ContentSavedConfirmation(_) => {
                if !sender.is_admin() {
                    warn!("Ignoring save confirmation from non-creator {}", sender.user_id);
                    return;
                }
                let pending: Vec<ConnId> = state.pending_saves.drain().collect();
                let confirmation = ServerEvent::ContentSavedConfirmation(RoomRef {
                    room_id: room_id.clone(),
                });
                for requester in pending {
                    state.send_to(requester, confirmation.clone());
                }
            }
            ClientEvent::JoinRoom(_) | ClientEvent::LeaveRoom(_) => {}
        }
    }

    /// Close a room for everyone in it. Returns the number of notified connections.
    pub async fn end_room(&self, room_id: &str, room_name: &str, forced: bool) -> usize {
        let room = match self.rooms.write().await.remove(room_id) {
            Some(room) => room,
            None => return 0,
        };

        let members: Vec<ConnId> = {
            let mut state = room.lock().await;
            state.closed = true;
            let payload = RoomClosedPayload {
                room_name: room_name.to_string(),
            };
            let event = if forced {
                ServerEvent::RoomForceDeleted(payload)
            } else {
                ServerEvent::RoomEnded(payload)
            };
            state.broadcast(&event, None);
            state.members.drain().map(|(conn, _)| conn).collect()
        };

        let mut connections = self.connections.write().await;
        for conn in &members {
            if let Some(connection) = connections.get_mut(conn) {
                connection.room = None;
            }
        }
        info!("Room {} ended (forced: {}), {} connections notified", room_id, forced, members.len());
        members.len()
    }

    pub async fn stats(&self) -> HubStats {
        let connections = self.connections.read().await.len();
        let rooms: Vec<Arc<Mutex<RoomState>>> = self.rooms.read().await.values().cloned().collect();
        let mut members = 0;
        for room in &rooms {
            members += room.lock().await.presence.len();
        }
        HubStats {
            connections,
            rooms: rooms.len(),
            members,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::auth::OPEN_ACCESS_PRPL;
    use crate::models::{CursorPositionPayload, Position, SaveRequestPayload};

    fn hub() -> RoomHub {
        RoomHub::new(Duration::from_secs(5), Duration::from_secs(5))
    }

    fn open() -> Vec<String> {
        vec![OPEN_ACCESS_PRPL.to_string()]
    }

    fn join(room_id: &str, user_id: &str, role: MemberRole) -> ClientEvent {
        ClientEvent::JoinRoom(JoinRoomPayload {
            room_id: room_id.to_string(),
            user: Identity::new(user_id, &format!("name-{user_id}"), role),
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn names(events: &[ServerEvent]) -> Vec<&'static str> {
        events.iter().map(ServerEvent::name).collect()
    }

    #[tokio::test]
    async fn join_replies_with_snapshot_and_notifies_others() {
        let hub = hub();
        let (a, mut a_rx) = hub.open_connection(open()).await;
        let (b, mut b_rx) = hub.open_connection(open()).await;

        hub.handle(a, join("R1", "alice", MemberRole::Admin)).await;
        hub.handle(
            a,
            ClientEvent::CursorPosition(CursorPositionPayload { position: Position::new(2, 5) }),
        )
        .await;
        drain(&mut a_rx);

        hub.handle(b, join("R1", "bob", MemberRole::Member)).await;
        let b_events = drain(&mut b_rx);
        match &b_events[0] {
            ServerEvent::RoomJoined(payload) => {
                assert_eq!(payload.members.len(), 2);
                let alice = payload.members.iter().find(|m| m.user_id == "alice").unwrap();
                assert_eq!(alice.cursor, Some(Position::new(2, 5)));
            }
            other => panic!("expected room-joined, got {:?}", other),
        }
        assert_eq!(names(&drain(&mut a_rx)), vec!["user-joined", "online-users-updated"]);
    }

    #[tokio::test]
    async fn ephemeral_events_skip_the_origin() {
        let hub = hub();
        let (a, mut a_rx) = hub.open_connection(open()).await;
        let (b, mut b_rx) = hub.open_connection(open()).await;
        hub.handle(a, join("R1", "alice", MemberRole::Admin)).await;
        hub.handle(b, join("R1", "bob", MemberRole::Member)).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        hub.handle(a, ClientEvent::UserTyping(RoomRef { room_id: "R1".to_string() })).await;
        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(names(&drain(&mut b_rx)), vec!["user-typing"]);
    }

    #[tokio::test]
    async fn second_connection_of_a_user_is_not_a_new_member() {
        let hub = hub();
        let (a1, _a1_rx) = hub.open_connection(open()).await;
        let (a2, _a2_rx) = hub.open_connection(open()).await;
        let (b, mut b_rx) = hub.open_connection(open()).await;
        hub.handle(b, join("R1", "bob", MemberRole::Member)).await;
        hub.handle(a1, join("R1", "alice", MemberRole::Admin)).await;
        drain(&mut b_rx);

        hub.handle(a2, join("R1", "alice", MemberRole::Admin)).await;
        assert_eq!(names(&drain(&mut b_rx)), vec!["online-users-updated"]);

        hub.close(a1).await;
        assert!(drain(&mut b_rx).is_empty());
        hub.close(a2).await;
        assert_eq!(names(&drain(&mut b_rx)), vec!["user-left", "online-users-updated"]);
    }

    #[tokio::test]
    async fn save_request_reaches_creator_and_confirmation_reaches_requester() {
        let hub = hub();
        let (admin, mut admin_rx) = hub.open_connection(open()).await;
        let (member, mut member_rx) = hub.open_connection(open()).await;
        let (other, mut other_rx) = hub.open_connection(open()).await;
        hub.handle(admin, join("R1", "alice", MemberRole::Admin)).await;
        hub.handle(member, join("R1", "bob", MemberRole::Member)).await;
        hub.handle(other, join("R1", "carol", MemberRole::Member)).await;
        drain(&mut admin_rx);
        drain(&mut member_rx);
        drain(&mut other_rx);

        hub.handle(
            member,
            ClientEvent::RequestCreatorSave(SaveRequestPayload {
                room_id: "R1".to_string(),
                requested_by_username: "bob".to_string(),
            }),
        )
        .await;
        assert_eq!(names(&drain(&mut admin_rx)), vec!["request-creator-save"]);
        assert!(drain(&mut other_rx).is_empty());

        // Only the creator may confirm
        let confirm = ClientEvent::ContentSavedConfirmation(RoomRef { room_id: "R1".to_string() });
        hub.handle(other, confirm.clone()).await;
        assert!(drain(&mut member_rx).is_empty());

        hub.handle(admin, confirm.clone()).await;
        assert_eq!(names(&drain(&mut member_rx)), vec!["content-saved-confirmation"]);
        assert!(drain(&mut other_rx).is_empty());

        hub.handle(admin, confirm).await;
        assert!(drain(&mut member_rx).is_empty());
    }

    #[tokio::test]
    async fn end_room_notifies_and_drops_the_room() {
        let hub = hub();
        let (a, mut a_rx) = hub.open_connection(open()).await;
        hub.handle(a, join("R1", "alice", MemberRole::Admin)).await;
        drain(&mut a_rx);

        assert_eq!(hub.end_room("R1", "Daily", true).await, 1);
        match drain(&mut a_rx).as_slice() {
            [ServerEvent::RoomForceDeleted(payload)] => assert_eq!(payload.room_name, "Daily"),
            other => panic!("unexpected events {:?}", other),
        }
        assert_eq!(hub.stats().await.rooms, 0);

        hub.handle(a, ClientEvent::UserTyping(RoomRef { room_id: "R1".to_string() })).await;
        assert_eq!(names(&drain(&mut a_rx)), vec!["error"]);
    }

    #[tokio::test]
    async fn empty_rooms_are_dropped() {
        let hub = hub();
        let (a, _a_rx) = hub.open_connection(open()).await;
        hub.handle(a, join("R1", "alice", MemberRole::Admin)).await;
        assert_eq!(hub.stats().await, HubStats { connections: 1, rooms: 1, members: 1 });

        hub.handle(a, ClientEvent::LeaveRoom(Default::default())).await;
        assert_eq!(hub.stats().await, HubStats { connections: 1, rooms: 0, members: 0 });
    }

    #[tokio::test]
    async fn second_admin_claim_joins_as_member() {
        let hub = hub();
        let (alice, mut alice_rx) = hub.open_connection(open()).await;
        let (bob, mut bob_rx) = hub.open_connection(open()).await;
        let (mallory, mut mallory_rx) = hub.open_connection(open()).await;
        hub.handle(alice, join("R1", "alice", MemberRole::Admin)).await;
        hub.handle(bob, join("R1", "bob", MemberRole::Member)).await;
        hub.handle(mallory, join("R1", "mallory", MemberRole::Admin)).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        match drain(&mut mallory_rx).first() {
            Some(ServerEvent::RoomJoined(payload)) => {
                let roles: Vec<(&str, MemberRole)> = payload
                    .members
                    .iter()
                    .map(|m| (m.user_id.as_str(), m.role))
                    .collect();
                assert!(roles.contains(&("alice", MemberRole::Admin)));
                assert!(roles.contains(&("mallory", MemberRole::Member)));
            }
            other => panic!("expected room-joined, got {:?}", other),
        }

        hub.handle(
            bob,
            ClientEvent::RequestCreatorSave(SaveRequestPayload {
                room_id: "R1".to_string(),
                requested_by_username: "bob".to_string(),
            }),
        )
        .await;
        assert!(drain(&mut mallory_rx).is_empty());
        assert_eq!(names(&drain(&mut alice_rx)), vec!["request-creator-save"]);

        hub.handle(mallory, ClientEvent::ContentSavedConfirmation(RoomRef { room_id: "R1".to_string() }))
            .await;
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn join_must_match_the_token_user() {
        let hub = hub();
        let (conn, mut rx) = hub.open_connection(vec!["u/bob".to_string()]).await;

        hub.handle(conn, join("R1", "alice", MemberRole::Admin)).await;
        assert_eq!(names(&drain(&mut rx)), vec!["error"]);
        assert_eq!(hub.stats().await.rooms, 0);

        hub.handle(conn, join("R1", "bob", MemberRole::Member)).await;
        assert_eq!(names(&drain(&mut rx)), vec!["room-joined", "online-users-updated"]);
    }
}
