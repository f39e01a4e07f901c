use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::channel::EventChannel;
use crate::clients::RoomStore;
use crate::document::{content_checksum, OriginTag, ReplicatedDocument};
use crate::error::SyncError;
use crate::models::{ClientEvent, RoomRef, RoomUpdate, SaveRequestPayload};
use crate::utils::scope_guard::ScopeGuard;

/// Asks the room creator whether to flush their live content for a requester
#[async_trait]
pub trait SavePrompt: Send + Sync {
    async fn confirm_save(&self, requested_by: &str) -> bool;
}

/// Everything one side of the handshake touches
pub struct SyncTarget<'a> {
    pub room_id: &'a str,
    pub events: &'a EventChannel,
    pub store: &'a dyn RoomStore,
    pub document: &'a ReplicatedDocument,
}

/// Outcome of a completed pull on the requester side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// The creator confirmed the save before the timeout
    pub confirmed: bool,
    /// New language when the durable copy differs from the local one
    pub language: Option<String>,
    /// Checksum of the pulled content
    pub checksum: String,
    /// The live replica was replaced
    pub content_changed: bool,
}

#[derive(Debug, Clone)]
pub struct ArbitrationTimings {
    pub confirm_timeout: Duration,
    pub settle_delay: Duration,
    pub cooldown: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creator-authoritative save handshake.
///
/// A requester holds at most one outstanding request and is limited by a
/// cooldown that starts when a pull completes. A creator shows at most one
/// save prompt at a time; requests arriving while one is open are ignored.
pub struct SaveArbitrator {
    timings: ArbitrationTimings,
    busy: AtomicBool,
    dialog_open: AtomicBool,
    last_sync: Mutex<Option<Instant>>,
    pending: Mutex<Option<oneshot::Sender<()>>>,
}

impl SaveArbitrator {
    pub fn new(timings: ArbitrationTimings) -> Self {
        Self {
            timings,
            busy: AtomicBool::new(false),
            dialog_open: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Time left before another request is allowed
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let last = (*lock(&self.last_sync))?;
        let elapsed = now.saturating_duration_since(last);
        if elapsed < self.timings.cooldown {
            Some(self.timings.cooldown - elapsed)
        } else {
            None
        }
    }

    /// Ask the creator to save, then pull the durable copy into the live replica.
    ///
    /// A refusal looks the same as a lost request: after the confirmation
    /// timeout the pull proceeds with whatever is durably stored.
    pub async fn request(
        &self,
        target: &SyncTarget<'_>,
        requested_by: &str,
        is_admin: bool,
        current_language: &str,
    ) -> Result<SyncReport, SyncError> {
        if is_admin {
            return Err(SyncError::IsCreator);
        }
        if let Some(remaining) = self.cooldown_remaining(Instant::now()) {
            return Err(SyncError::CoolingDown(remaining));
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::InFlight);
        }
        let _busy = ScopeGuard::new(|| self.busy.store(false, Ordering::SeqCst));

        let (tx, rx) = oneshot::channel();
        *lock(&self.pending) = Some(tx);
        let _pending = ScopeGuard::new(|| {
            lock(&self.pending).take();
        });

        target.events.emit(ClientEvent::RequestCreatorSave(SaveRequestPayload {
            room_id: target.room_id.to_string(),
            requested_by_username: requested_by.to_string(),
        }))?;
        info!("Requested creator save for room {}", target.room_id);

        let confirmed = matches!(
            tokio::time::timeout(self.timings.confirm_timeout, rx).await,
            Ok(Ok(()))
        );
        if !confirmed {
            info!("No save confirmation for room {}, pulling stored content", target.room_id);
        }

        tokio::time::sleep(self.timings.settle_delay).await;
        let room = target.store.get_room(target.room_id, true).await?;

        let language = (room.language != current_language).then(|| room.language.clone());
        let content_changed = target
            .document
            .replace_all(&room.content, OriginTag::sync_from_creator())?;

        *lock(&self.last_sync) = Some(Instant::now());
        Ok(SyncReport {
            confirmed,
            language,
            checksum: content_checksum(&room.content),
            content_changed,
        })
    }

    /// Resolve the outstanding request, if any
    pub fn confirm(&self) {
        match lock(&self.pending).take() {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => debug!("Save confirmation without an outstanding request"),
        }
    }

    /// Creator side: prompt, persist the live content and confirm.
    ///
    /// Returns the checksum of the saved content, or `None` when the request
    /// was refused or ignored because a prompt is already open.
    pub async fn respond(
        &self,
        target: &SyncTarget<'_>,
        prompt: &dyn SavePrompt,
        requested_by: &str,
        language: &str,
    ) -> Result<Option<String>, SyncError> {
        if self
            .dialog_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Save prompt already open, ignoring request from {}", requested_by);
            return Ok(None);
        }
        let _dialog = ScopeGuard::new(|| self.dialog_open.store(false, Ordering::SeqCst));

        if !prompt.confirm_save(requested_by).await {
            info!("Save request from {} refused", requested_by);
            return Ok(None);
        }

        let content = target.document.get_snapshot();
        let checksum = content_checksum(&content);
        let update = RoomUpdate {
            content: Some(content),
            language: Some(language.to_string()),
        };
        if let Err(e) = target.store.update_room(target.room_id, update).await {
            warn!("Save for {} failed: {}", requested_by, e);
            return Err(e.into());
        }

        target
            .events
            .emit(ClientEvent::ContentSavedConfirmation(RoomRef {
                room_id: target.room_id.to_string(),
            }))?;
        info!("Saved room {} for {}", target.room_id, requested_by);
        Ok(Some(checksum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arbitrator() -> SaveArbitrator {
        SaveArbitrator::new(ArbitrationTimings {
            confirm_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(500),
            cooldown: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_counts_from_completion() {
        let arbitration = arbitrator();
        let completed = Instant::now();
        *lock(&arbitration.last_sync) = Some(completed);

        assert_eq!(
            arbitration.cooldown_remaining(completed + Duration::from_secs(59)),
            Some(Duration::from_secs(1))
        );
        assert_eq!(arbitration.cooldown_remaining(completed + Duration::from_secs(60)), None);
    }

    #[test]
    fn confirm_without_request_is_harmless() {
        let arbitration = arbitrator();
        arbitration.confirm();
        assert!(!arbitration.is_busy());
    }
}
