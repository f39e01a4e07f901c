use std::time::Duration;
use thiserror::Error;

/// Failures talking to the external room service
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("room '{0}' not found")]
    NotFound(String),
    #[error("room content rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("room service returned {status}: {message}")]
    Http { status: u16, message: String },
    #[error("room service unreachable: {0}")]
    Network(String),
}

impl StoreError {
    /// Classify a non-success HTTP status from the room service
    pub fn from_status(room_id: &str, status: u16, message: String) -> Self {
        match status {
            404 => StoreError::NotFound(room_id.to_string()),
            400 | 413 => StoreError::Rejected { status, message },
            _ => StoreError::Http { status, message },
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("range {start}..{end} is outside the document (length {len})")]
    OutOfRange { start: usize, end: usize, len: usize },
    #[error("document is detached")]
    Detached,
    #[error("crdt operation failed: {0}")]
    Crdt(#[from] loro::LoroError),
    #[error("failed to export document: {0}")]
    Export(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("event channel connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("event channel is not connected")]
    NotConnected,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("room '{0}' no longer exists")]
    RoomGone(String),
    #[error("session has ended")]
    Ended,
}

/// Reasons a save-arbitration request does not complete
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync request is already in flight")]
    InFlight,
    #[error("sync is cooling down for another {0:?}")]
    CoolingDown(Duration),
    #[error("the room creator cannot request a save from itself")]
    IsCreator,
    #[error("room '{0}' no longer exists")]
    RoomGone(String),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(room_id) => SyncError::RoomGone(room_id),
            other => SyncError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_status_classification() {
        assert_eq!(
            StoreError::from_status("R1", 404, String::new()),
            StoreError::NotFound("R1".to_string())
        );
        assert!(matches!(
            StoreError::from_status("R1", 413, "too big".to_string()),
            StoreError::Rejected { status: 413, .. }
        ));
        assert!(matches!(
            StoreError::from_status("R1", 503, String::new()),
            StoreError::Http { status: 503, .. }
        ));
        assert!(matches!(
            SyncError::from(StoreError::NotFound("R1".to_string())),
            SyncError::RoomGone(_)
        ));
    }
}
