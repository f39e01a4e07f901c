use loro::{ExportMode, LoroDoc};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sync_state::{EditorSyncState, PhaseConflict, SyncPhase};
use crate::error::DocumentError;

/// Name of the root text container holding the code
pub const TEXT_CONTAINER: &str = "content";

pub const ORIGIN_INITIAL_LOAD: &str = "initial-load";
pub const ORIGIN_SYNC_FROM_CREATOR: &str = "sync-from-creator";
pub const ORIGIN_REPLICATION_SYNC: &str = "replication-sync";

/// Marker attached to every mutation, identifying its source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginTag(String);

impl OriginTag {
    pub fn new(tag: impl Into<String>) -> Self {
        OriginTag(tag.into())
    }

    pub fn initial_load() -> Self {
        OriginTag::new(ORIGIN_INITIAL_LOAD)
    }

    pub fn sync_from_creator() -> Self {
        OriginTag::new(ORIGIN_SYNC_FROM_CREATOR)
    }

    pub fn replication_sync() -> Self {
        OriginTag::new(ORIGIN_REPLICATION_SYNC)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OriginTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open range of unicode scalar offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn caret(at: usize) -> Self {
        Self { start: at, end: at }
    }
}

/// Notification sent after the text changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub origin: OriginTag,
    /// `true` when the change came from this replica's own editor binding
    pub local: bool,
    /// Decorations were requested while the change was applied
    pub redraw_decorations: bool,
}

/// Encoded update waiting to be sent to the other replicas
#[derive(Debug, Clone)]
pub struct OutboundUpdate {
    pub delta: Vec<u8>,
    pub origin: OriginTag,
}

type RemoteChangeCallback = Arc<dyn Fn(&DocumentChange) + Send + Sync>;

/// Convergent text container for one room.
///
/// Local edits and bulk replacements produce encoded updates on the outbound
/// queue; remote updates are merged by the CRDT. All transactions are
/// serialized by the document lock, so two bulk replacements never interleave.
pub struct ReplicatedDocument {
    room_id: String,
    peer: String,
    binding: OriginTag,
    doc: Mutex<LoroDoc>,
    sync_state: Mutex<EditorSyncState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundUpdate>>>,
    changes: broadcast::Sender<DocumentChange>,
    remote_callbacks: Mutex<Vec<RemoteChangeCallback>>,
    synced: Mutex<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ReplicatedDocument {
    /// Create the replica for a room and the queue its updates are sent from
    pub fn attach(room_id: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<OutboundUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(256);
        let peer = Uuid::new_v4().to_string();
        let doc = LoroDoc::new();
        // Make sure the root container exists before the first export
        let _ = doc.get_text(TEXT_CONTAINER);

        info!("Attached replicated document for room {} (peer {})", room_id, peer);
        let document = Arc::new(Self {
            room_id: room_id.to_string(),
            binding: OriginTag::new(format!("editor:{}", peer)),
            peer,
            doc: Mutex::new(doc),
            sync_state: Mutex::new(EditorSyncState::default()),
            outbound: Mutex::new(Some(tx)),
            changes,
            remote_callbacks: Mutex::new(Vec::new()),
            synced: Mutex::new(false),
        });
        (document, rx)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Replica identifier used on the replication channel
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Origin tag of this replica's editor binding
    pub fn binding(&self) -> &OriginTag {
        &self.binding
    }

    pub fn is_local_origin(&self, origin: &OriginTag) -> bool {
        origin == &self.binding
    }

    pub fn is_detached(&self) -> bool {
        lock(&self.outbound).is_none()
    }

    /// Apply an edit typed into the bound editor
    pub fn apply_local_edit(&self, range: TextRange, text: &str) -> Result<(), DocumentError> {
        if range.start == range.end && text.is_empty() {
            return Ok(());
        }
        let origin = self.binding.clone();
        self.transact(origin, |doc| {
            let content = doc.get_text(TEXT_CONTAINER);
            let len = content.len_unicode();
            if range.start > range.end || range.end > len {
                return Err(DocumentError::OutOfRange {
                    start: range.start,
                    end: range.end,
                    len,
                });
            }
            if range.end > range.start {
                content.delete(range.start, range.end - range.start)?;
            }
            if !text.is_empty() {
                content.insert(range.start, text)?;
            }
            Ok(true)
        })
        .map(|_| ())
    }

    /// Replace the whole text in one delete-all + insert-all transaction.
    ///
    /// Replacing the content with itself is a no-op: nothing is sent and no
    /// change is announced. Returns whether the text changed.
    pub fn replace_all(&self, text: &str, origin: OriginTag) -> Result<bool, DocumentError> {
        self.transact(origin, |doc| {
            let content = doc.get_text(TEXT_CONTAINER);
            if content.to_string() == text {
                return Ok(false);
            }
            let len = content.len_unicode();
            if len > 0 {
                content.delete(0, len)?;
            }
            if !text.is_empty() {
                content.insert(0, text)?;
            }
            Ok(true)
        })
    }

    /// Merge an update received from another replica
    pub fn apply_remote_update(&self, delta: &[u8], origin: OriginTag) -> Result<bool, DocumentError> {
        if self.is_detached() {
            return Err(DocumentError::Detached);
        }
        if let Err(conflict) = lock(&self.sync_state).begin_remote() {
            // Re-entrant application from inside a change handler
            warn!("Remote update rejected: {}", conflict);
            return Ok(false);
        }

        let result = {
            let doc = lock(&self.doc);
            let before = doc.get_text(TEXT_CONTAINER).to_string();
            doc.import(delta)
                .map(|_| doc.get_text(TEXT_CONTAINER).to_string() != before)
                .map_err(DocumentError::from)
        };

        let redraw_decorations = lock(&self.sync_state).finish_remote();
        let changed = result?;
        if changed || redraw_decorations {
            let change = DocumentChange {
                local: self.is_local_origin(&origin),
                origin,
                redraw_decorations,
            };
            self.announce(change);
        }
        Ok(changed)
    }

    /// Current text of the document
    pub fn get_snapshot(&self) -> String {
        lock(&self.doc).get_text(TEXT_CONTAINER).to_string()
    }

    /// Full CRDT state, used for initial load and periodic resync
    pub fn export_state(&self) -> Result<Vec<u8>, DocumentError> {
        lock(&self.doc)
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Export(e.to_string()))
    }

    /// SHA-256 of the current text, hex encoded
    pub fn checksum(&self) -> String {
        content_checksum(&self.get_snapshot())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.changes.subscribe()
    }

    /// Register a callback for changes that did not originate from this
    /// replica's editor binding
    pub fn on_remote_change<F>(&self, callback: F)
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        lock(&self.remote_callbacks).push(Arc::new(callback));
    }

    pub fn sync_phase(&self) -> SyncPhase {
        lock(&self.sync_state).phase()
    }

    pub fn is_applying_remote(&self) -> bool {
        self.sync_phase() == SyncPhase::ApplyingRemote
    }

    /// Hold the remote-application phase as an in-flight import would
    #[cfg(test)]
    pub(crate) fn hold_remote_phase(&self) -> Result<(), PhaseConflict> {
        lock(&self.sync_state).begin_remote()
    }

    #[cfg(test)]
    pub(crate) fn release_remote_phase(&self) {
        lock(&self.sync_state).finish_remote();
    }

    pub fn begin_decorations(&self) -> Result<(), PhaseConflict> {
        lock(&self.sync_state).begin_decorations()
    }

    /// Returns `true` when the render went stale and must be repeated
    pub fn finish_decorations(&self) -> bool {
        lock(&self.sync_state).finish_decorations()
    }

    /// Whether the replica has received the relay's initial state
    pub fn is_synced(&self) -> bool {
        *lock(&self.synced)
    }

    pub fn mark_synced(&self) {
        *lock(&self.synced) = true;
    }

    /// Stop producing updates. Further local mutations fail with `Detached`.
    pub fn detach(&self) {
        if lock(&self.outbound).take().is_some() {
            info!("Detached replicated document for room {}", self.room_id);
        }
    }

    fn transact<F>(&self, origin: OriginTag, mutate: F) -> Result<bool, DocumentError>
    where
        F: FnOnce(&LoroDoc) -> Result<bool, DocumentError>,
    {
        let outbound = match lock(&self.outbound).clone() {
            Some(tx) => tx,
            None => return Err(DocumentError::Detached),
        };

        let delta = {
            let doc = lock(&self.doc);
            let before = doc.oplog_vv();
            if !mutate(&doc)? {
                return Ok(false);
            }
            doc.commit();
            doc.export(ExportMode::updates(&before))
                .map_err(|e| DocumentError::Export(e.to_string()))?
        };

        if outbound
            .send(OutboundUpdate {
                delta,
                origin: origin.clone(),
            })
            .is_err()
        {
            debug!("Replication channel gone for room {}, update kept locally", self.room_id);
        }

        let change = DocumentChange {
            local: self.is_local_origin(&origin),
            origin,
            redraw_decorations: false,
        };
        self.announce(change);
        Ok(true)
    }

    fn announce(&self, change: DocumentChange) {
        if !change.local {
            let callbacks = lock(&self.remote_callbacks).clone();
            for callback in callbacks {
                callback(&change);
            }
        }
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}

/// SHA-256 of a text, hex encoded
pub fn content_checksum(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("{:x}", digest)
}

impl fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("room_id", &self.room_id)
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundUpdate>) -> Vec<OutboundUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[test]
    fn concurrent_edits_converge_regardless_of_delivery_order() {
        let (a, mut a_out) = ReplicatedDocument::attach("R1");
        let (b, mut b_out) = ReplicatedDocument::attach("R1");

        a.apply_local_edit(TextRange::caret(0), "fn main() {}").unwrap();
        for update in drain(&mut a_out) {
            b.apply_remote_update(&update.delta, update.origin).unwrap();
        }

        // Concurrent edits on both sides
        a.apply_local_edit(TextRange::caret(11), " println!(\"a\"); ").unwrap();
        a.apply_local_edit(TextRange::new(0, 2), "pub fn").unwrap();
        b.apply_local_edit(TextRange::caret(12), "\n// b").unwrap();
        let from_a = drain(&mut a_out);
        let from_b = drain(&mut b_out);

        for update in from_b.iter() {
            a.apply_remote_update(&update.delta, update.origin.clone()).unwrap();
        }
        for update in from_a.iter().rev() {
            b.apply_remote_update(&update.delta, update.origin.clone()).unwrap();
        }
        // Re-delivery is idempotent
        for update in from_a.iter() {
            b.apply_remote_update(&update.delta, update.origin.clone()).unwrap();
        }

        assert_eq!(a.get_snapshot(), b.get_snapshot());
        assert!(a.get_snapshot().starts_with("pub fn main()"));
        assert!(a.get_snapshot().contains("// b"));
        a.detach();
        b.detach();
    }

    #[test]
    fn replace_all_with_same_content_is_silent() {
        let (doc, mut out) = ReplicatedDocument::attach("R1");
        let mut changes = doc.subscribe();

        assert!(doc.replace_all("let x = 1;", OriginTag::initial_load()).unwrap());
        assert_eq!(drain(&mut out).len(), 1);
        let change = changes.try_recv().unwrap();
        assert_eq!(change.origin, OriginTag::initial_load());
        assert!(!change.local);

        assert!(!doc.replace_all("let x = 1;", OriginTag::sync_from_creator()).unwrap());
        assert!(drain(&mut out).is_empty());
        assert!(changes.try_recv().is_err());
        doc.detach();
    }

    #[test]
    fn origin_tags_separate_local_from_remote() {
        let (a, mut a_out) = ReplicatedDocument::attach("R1");
        let (b, _b_out) = ReplicatedDocument::attach("R1");
        let mut b_changes = b.subscribe();

        a.apply_local_edit(TextRange::caret(0), "x").unwrap();
        let update = drain(&mut a_out).remove(0);
        assert!(a.is_local_origin(&update.origin));
        assert!(!b.is_local_origin(&update.origin));

        b.apply_remote_update(&update.delta, update.origin).unwrap();
        let change = b_changes.try_recv().unwrap();
        assert!(!change.local);

        a.replace_all("y", OriginTag::sync_from_creator()).unwrap();
        let update = drain(&mut a_out).remove(0);
        b.apply_remote_update(&update.delta, update.origin).unwrap();
        assert_eq!(
            b_changes.try_recv().unwrap().origin,
            OriginTag::sync_from_creator()
        );
        assert_eq!(b.get_snapshot(), "y");
        a.detach();
        b.detach();
    }

    #[test]
    fn remote_callbacks_skip_local_edits() {
        let (doc, _out) = ReplicatedDocument::attach("R1");
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = hits.clone();
        doc.on_remote_change(move |change| lock(&sink).push(change.origin.clone()));

        doc.apply_local_edit(TextRange::caret(0), "local").unwrap();
        doc.replace_all("resync", OriginTag::sync_from_creator()).unwrap();
        assert_eq!(*lock(&hits), vec![OriginTag::sync_from_creator()]);
        doc.detach();
    }

    #[test]
    fn out_of_range_edit_leaves_text_untouched() {
        let (doc, mut out) = ReplicatedDocument::attach("R1");
        doc.apply_local_edit(TextRange::caret(0), "abc").unwrap();
        drain(&mut out);

        let err = doc.apply_local_edit(TextRange::new(2, 9), "z").unwrap_err();
        assert!(matches!(err, DocumentError::OutOfRange { len: 3, .. }));
        assert_eq!(doc.get_snapshot(), "abc");
        assert!(drain(&mut out).is_empty());

        doc.detach();
        assert!(matches!(
            doc.apply_local_edit(TextRange::caret(0), "x"),
            Err(DocumentError::Detached)
        ));
    }

    #[test]
    fn checksum_tracks_text() {
        let (doc, _out) = ReplicatedDocument::attach("R1");
        let empty = doc.checksum();
        doc.apply_local_edit(TextRange::caret(0), "fn main() {}").unwrap();
        assert_ne!(doc.checksum(), empty);
        assert_eq!(doc.checksum(), content_checksum("fn main() {}"));
        doc.detach();
    }
}
