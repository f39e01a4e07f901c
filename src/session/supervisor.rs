use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::channel::ChannelStatus;
use super::room_session::{CloseReason, Notice, SessionEvent, SessionShared};
use crate::error::StoreError;
use crate::models::{ClientEvent, RoomUpdate, UserRef};

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Why the session is not fully connected, most specific cause first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradedCause {
    Offline,
    DocumentChannel(ChannelStatus),
    EventChannel(ChannelStatus),
}

impl DegradedCause {
    pub fn message(&self) -> &'static str {
        match self {
            DegradedCause::Offline => "You are offline. Changes will sync when the network is back.",
            DegradedCause::DocumentChannel(_) => "Document sync interrupted. Reconnecting...",
            DegradedCause::EventChannel(_) => "Live presence interrupted. Reconnecting...",
        }
    }
}

/// Single banner cause for the current channel states, or `None` when healthy
pub fn degraded_cause(
    network_online: bool,
    document: ChannelStatus,
    events: ChannelStatus,
) -> Option<DegradedCause> {
    if !network_online {
        Some(DegradedCause::Offline)
    } else if !document.is_connected() {
        Some(DegradedCause::DocumentChannel(document))
    } else if !events.is_connected() {
        Some(DegradedCause::EventChannel(events))
    } else {
        None
    }
}

/// Exponential backoff doubling from `base`, never above `cap`
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// Periodic work of a room session: banner, room poll, autosave and typing expiry.
///
/// The sweep and channel watchers never await the room service; polling and
/// autosave each run their own loop so a slow request delays only itself.
pub(crate) async fn supervise(shared: Arc<SessionShared>) {
    tokio::join!(watch_local(&shared), poll_loop(&shared), autosave_loop(&shared));
    debug!("Supervisor for room {} stopped", shared.ctx.room_id);
}

/// Typing expiry, banner refresh and reactions to channel status changes
async fn watch_local(shared: &SessionShared) {
    let mut sweep = interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut event_status = shared.events.watch_status();
    let mut doc_status = shared.docs.watch_status();

    while !shared.is_ended() {
        tokio::select! {
            _ = sweep.tick() => {
                sweep_typing(shared);
                refresh_banner(shared);
            }
            changed = event_status.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *event_status.borrow_and_update();
                if !status.is_connected() {
                    shared.mark_presence_stale();
                }
                refresh_banner(shared);
            }
            changed = doc_status.changed() => {
                if changed.is_err() {
                    break;
                }
                doc_status.borrow_and_update();
                refresh_banner(shared);
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn poll_loop(shared: &SessionShared) {
    let mut poll = ticker(shared.config.room_poll());
    loop {
        poll.tick().await;
        if shared.is_ended() {
            break;
        }
        poll_room(shared).await;
    }
}

async fn autosave_loop(shared: &SessionShared) {
    let mut autosave = ticker(shared.config.autosave());
    loop {
        autosave.tick().await;
        if shared.is_ended() {
            break;
        }
        autosave_once(shared).await;
    }
}

pub(crate) fn refresh_banner(shared: &SessionShared) {
    let cause = degraded_cause(
        shared.is_network_online(),
        shared.docs.status(),
        shared.events.status(),
    );
    let changed = {
        let mut state = shared.state();
        if state.banner != cause {
            state.banner = cause;
            true
        } else {
            false
        }
    };
    if changed {
        match cause {
            Some(cause) => info!("Session degraded: {:?}", cause),
            None => info!("Session fully connected"),
        }
        shared.publish(SessionEvent::BannerChanged(cause));
    }
}

fn sweep_typing(shared: &SessionShared) {
    let now = Instant::now();
    let (expired, stop_local) = {
        let mut state = shared.state();
        let expired = state.presence.expire_typing(now);
        let stop_local = match state.local_typing_until {
            Some(until) if now >= until => {
                state.local_typing_until = None;
                true
            }
            _ => false,
        };
        (expired, stop_local)
    };

    for user_id in expired {
        shared.publish(SessionEvent::TypingChanged { user_id, typing: false });
    }
    if stop_local {
        let event = ClientEvent::UserStoppedTyping(UserRef {
            user_id: shared.ctx.user_id.clone(),
        });
        if let Err(e) = shared.events.emit(event) {
            debug!("Could not send stopped-typing: {}", e);
        }
    }
}

/// Refresh non-content room metadata. Document content is left to replication.
async fn poll_room(shared: &SessionShared) {
    match shared.store.get_room(&shared.ctx.room_id, false).await {
        Ok(room) => {
            let language_changed = {
                let mut state = shared.state();
                state.online_count = room.online_count;
                state.set_room_roles(&room);
                if state.language != room.language {
                    state.language = room.language.clone();
                    true
                } else {
                    false
                }
            };
            if language_changed {
                shared.publish(SessionEvent::LanguageChanged(room.language));
            }
        }
        Err(StoreError::NotFound(_)) => shared.close(CloseReason::RoomGone),
        // Backstop only; the next tick tries again
        Err(e) => warn!("Room poll failed for {}: {}", shared.ctx.room_id, e),
    }
}

pub(crate) async fn autosave_once(shared: &SessionShared) {
    if shared.is_ended() || !shared.is_network_online() {
        return;
    }
    let document = &shared.document;
    if !document.is_synced() || document.is_applying_remote() {
        return;
    }

    let content = document.get_snapshot();
    let checksum = crate::document::content_checksum(&content);
    if shared.state().last_sent_checksum == checksum {
        return;
    }

    let update = RoomUpdate {
        content: Some(content),
        language: None,
    };
    match shared.store.update_room(&shared.ctx.room_id, update).await {
        Ok(()) => {
            debug!("Autosaved room {}", shared.ctx.room_id);
            shared.state().last_sent_checksum = checksum;
        }
        Err(StoreError::NotFound(_)) => shared.close(CloseReason::RoomGone),
        Err(StoreError::Rejected { message, .. }) => {
            // Not retried until the content changes again
            shared.state().last_sent_checksum = checksum;
            shared.publish(SessionEvent::Notice(Notice::BlockingDialog(format!(
                "The room service refused to save this document: {}. Your local edits are kept.",
                message
            ))));
        }
        Err(e) => {
            warn!("Autosave failed for {}: {}", shared.ctx.room_id, e);
            shared.publish(SessionEvent::Notice(Notice::Toast(
                "Could not save the document. Retrying shortly.".to_string(),
            )));
        }
    }
}
