use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::models::{Identity, MemberRole, MemberState, Position, SelectionRange};

/// Ephemeral state of one connected user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: String,
    pub username: String,
    pub role: MemberRole,
    pub cursor: Option<Position>,
    pub selection: Option<SelectionRange>,
    typing_until: Option<Instant>,
}

impl PresenceEntry {
    fn new(identity: Identity) -> Self {
        Self {
            user_id: identity.user_id,
            username: identity.username,
            role: identity.role,
            cursor: None,
            selection: None,
            typing_until: None,
        }
    }

    pub fn is_typing(&self, now: Instant) -> bool {
        self.typing_until.map(|until| now < until).unwrap_or(false)
    }

    pub fn identity(&self) -> Identity {
        Identity::new(&self.user_id, &self.username, self.role)
    }

    fn to_state(&self, now: Instant) -> MemberState {
        MemberState {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            role: self.role,
            cursor: self.cursor,
            selection: self.selection,
            typing: self.is_typing(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Every member present after the join, joiner included
    pub snapshot: Vec<MemberState>,
    /// `false` when the user was already present
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left(PresenceEntry),
    /// The user was not tracked; the leave still counts as observed
    Unknown,
    /// Second notification for the same user inside the dedupe window
    Duplicate,
}

impl LeaveOutcome {
    /// Whether the leave should produce side effects
    pub fn is_effective(&self) -> bool {
        !matches!(self, LeaveOutcome::Duplicate)
    }
}

/// Tracks who is connected to a room and their cursor, selection and typing state.
///
/// Time is passed in explicitly so the same registry serves the room server and
/// the client mirror, and so expiry is exact under test.
#[derive(Debug)]
pub struct PresenceRegistry {
    entries: BTreeMap<String, PresenceEntry>,
    recent_leaves: HashMap<String, Instant>,
    typing_timeout: Duration,
    leave_dedupe: Duration,
}

impl PresenceRegistry {
    pub fn new(typing_timeout: Duration, leave_dedupe: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            recent_leaves: HashMap::new(),
            typing_timeout,
            leave_dedupe,
        }
    }

    pub fn join(&mut self, identity: Identity, now: Instant) -> JoinOutcome {
        self.recent_leaves.remove(&identity.user_id);
        let is_new = match self.entries.get_mut(&identity.user_id) {
            Some(entry) => {
                entry.username = identity.username;
                entry.role = identity.role;
                false
            }
            None => {
                self.entries
                    .insert(identity.user_id.clone(), PresenceEntry::new(identity));
                true
            }
        };
        JoinOutcome {
            snapshot: self.snapshot(now),
            is_new,
        }
    }

    /// Remove a user. Repeated leaves inside the dedupe window are suppressed.
    pub fn leave(&mut self, user_id: &str, now: Instant) -> LeaveOutcome {
        let window = self.leave_dedupe;
        self.recent_leaves
            .retain(|_, at| now.saturating_duration_since(*at) < window);

        if self.recent_leaves.contains_key(user_id) {
            debug!("Suppressing duplicate leave for user {}", user_id);
            return LeaveOutcome::Duplicate;
        }
        self.recent_leaves.insert(user_id.to_string(), now);

        // Dropping the entry also drops its typing deadline
        match self.entries.remove(user_id) {
            Some(entry) => LeaveOutcome::Left(entry),
            None => LeaveOutcome::Unknown,
        }
    }

    pub fn update_cursor(&mut self, user_id: &str, position: Position) -> bool {
        match self.entries.get_mut(user_id) {
            Some(entry) => {
                entry.cursor = Some(position);
                true
            }
            None => false,
        }
    }

    pub fn update_selection(&mut self, user_id: &str, selection: Option<SelectionRange>) -> bool {
        match self.entries.get_mut(user_id) {
            Some(entry) => {
                entry.selection = selection;
                true
            }
            None => false,
        }
    }

    /// Mark a user as typing until `now + typing_timeout`. A repeat call
    /// re-arms the same deadline. Returns `true` when the user was not typing before.
    pub fn set_typing(&mut self, user_id: &str, now: Instant) -> bool {
        let timeout = self.typing_timeout;
        match self.entries.get_mut(user_id) {
            Some(entry) => {
                let was_typing = entry.is_typing(now);
                entry.typing_until = Some(now + timeout);
                !was_typing
            }
            None => false,
        }
    }

    /// Returns `true` when the user was typing
    pub fn clear_typing(&mut self, user_id: &str, now: Instant) -> bool {
        match self.entries.get_mut(user_id) {
            Some(entry) => {
                let was_typing = entry.is_typing(now);
                entry.typing_until = None;
                was_typing
            }
            None => false,
        }
    }

    /// Drop typing deadlines that have passed; returns the affected users
    pub fn expire_typing(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();
        for entry in self.entries.values_mut() {
            if let Some(until) = entry.typing_until {
                if now >= until {
                    entry.typing_until = None;
                    expired.push(entry.user_id.clone());
                }
            }
        }
        expired
    }

    pub fn is_typing(&self, user_id: &str, now: Instant) -> bool {
        self.entries
            .get(user_id)
            .map(|entry| entry.is_typing(now))
            .unwrap_or(false)
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    pub fn snapshot(&self, now: Instant) -> Vec<MemberState> {
        self.entries.values().map(|entry| entry.to_state(now)).collect()
    }

    pub fn online_users(&self) -> Vec<Identity> {
        self.entries.values().map(PresenceEntry::identity).collect()
    }

    /// Replace every entry with an authoritative snapshot. Typing members get a
    /// fresh deadline. Returns the users that were dropped.
    pub fn replace_all(&mut self, members: Vec<MemberState>, now: Instant) -> Vec<String> {
        let mut previous = std::mem::take(&mut self.entries);
        for member in members {
            previous.remove(&member.user_id);
            let mut entry = PresenceEntry::new(member.identity());
            entry.cursor = member.cursor;
            entry.selection = member.selection;
            if member.typing {
                entry.typing_until = Some(now + self.typing_timeout);
            }
            self.entries.insert(entry.user_id.clone(), entry);
        }
        previous.into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPING: Duration = Duration::from_secs(5);
    const DEDUPE: Duration = Duration::from_secs(5);

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(TYPING, DEDUPE)
    }

    fn user(id: &str) -> Identity {
        Identity::new(id, &format!("name-{id}"), MemberRole::Member)
    }

    #[test]
    fn join_returns_everyone_already_present() {
        let now = Instant::now();
        let mut presence = registry();
        presence.join(user("a"), now);
        presence.update_cursor("a", Position::new(3, 4));

        let outcome = presence.join(user("b"), now);
        assert!(outcome.is_new);
        let ids: Vec<_> = outcome.snapshot.iter().map(|m| m.user_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(outcome.snapshot[0].cursor, Some(Position::new(3, 4)));

        assert!(!presence.join(user("b"), now).is_new);
    }

    #[test]
    fn duplicate_leave_inside_window_is_suppressed() {
        let t0 = Instant::now();
        let mut presence = registry();
        presence.join(user("a"), t0);

        assert!(matches!(presence.leave("a", t0), LeaveOutcome::Left(_)));
        assert_eq!(
            presence.leave("a", t0 + Duration::from_secs(4)),
            LeaveOutcome::Duplicate
        );
        // Outside the window a leave is observed again
        assert_eq!(
            presence.leave("a", t0 + Duration::from_secs(6)),
            LeaveOutcome::Unknown
        );
    }

    #[test]
    fn rejoin_resets_leave_dedupe() {
        let t0 = Instant::now();
        let mut presence = registry();
        presence.join(user("a"), t0);
        presence.leave("a", t0);
        presence.join(user("a"), t0 + Duration::from_secs(1));
        assert!(matches!(
            presence.leave("a", t0 + Duration::from_secs(2)),
            LeaveOutcome::Left(_)
        ));
    }

    #[test]
    fn typing_clears_exactly_at_deadline() {
        let t0 = Instant::now();
        let mut presence = registry();
        presence.join(user("a"), t0);

        assert!(presence.set_typing("a", t0));
        assert!(presence.is_typing("a", t0 + Duration::from_millis(4_999)));
        assert!(presence.expire_typing(t0 + Duration::from_millis(4_999)).is_empty());
        assert!(!presence.is_typing("a", t0 + TYPING));
        assert_eq!(presence.expire_typing(t0 + TYPING), vec!["a".to_string()]);
    }

    #[test]
    fn repeat_keystrokes_rearm_the_window() {
        let t0 = Instant::now();
        let mut presence = registry();
        presence.join(user("a"), t0);

        presence.set_typing("a", t0);
        assert!(!presence.set_typing("a", t0 + Duration::from_secs(3)));
        assert!(presence.is_typing("a", t0 + Duration::from_secs(7)));
        assert!(!presence.is_typing("a", t0 + Duration::from_secs(8)));
    }

    #[test]
    fn cursor_updates_are_not_typing() {
        let t0 = Instant::now();
        let mut presence = registry();
        presence.join(user("a"), t0);
        presence.update_cursor("a", Position::new(1, 1));
        assert!(!presence.is_typing("a", t0));
    }

    #[test]
    fn leave_drops_typing_state() {
        let t0 = Instant::now();
        let mut presence = registry();
        presence.join(user("a"), t0);
        presence.set_typing("a", t0);
        presence.leave("a", t0);
        assert!(presence.expire_typing(t0 + TYPING).is_empty());
        assert!(!presence.is_typing("a", t0));
    }

    #[test]
    fn replace_all_reports_dropped_users() {
        let t0 = Instant::now();
        let mut presence = registry();
        presence.join(user("a"), t0);
        presence.join(user("stale"), t0);

        let dropped = presence.replace_all(
            vec![MemberState {
                user_id: "a".to_string(),
                username: "name-a".to_string(),
                role: MemberRole::Admin,
                cursor: Some(Position::new(2, 0)),
                selection: None,
                typing: true,
            }],
            t0,
        );
        assert_eq!(dropped, vec!["stale".to_string()]);
        assert_eq!(presence.len(), 1);
        assert!(presence.is_typing("a", t0));
        assert_eq!(presence.get("a").and_then(|e| e.cursor), Some(Position::new(2, 0)));
    }
}
