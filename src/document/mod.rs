pub mod replicated;
pub mod sync_state;

pub use replicated::{
    content_checksum, DocumentChange, OriginTag, OutboundUpdate, ReplicatedDocument, TextRange,
};
pub use sync_state::{EditorSyncState, PhaseConflict, SyncPhase};
