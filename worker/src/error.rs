//! Error types for the sync worker.

use waypoint_engine::RecordKey;

/// Failure reported by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network failure or timeout; retried with backoff
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The remote refused the payload, e.g. validation; never retried
    #[error("remote rejected the request: {0}")]
    Rejected(String),

    /// The remote has no record with this id
    #[error("remote record not found: {0}")]
    NotFound(RecordKey),
}

impl RemoteError {
    /// Whether the operation should be retried after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Failure reported by the local record store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error surfaced by the coordinator and processor setup.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Engine error: {0}")]
    Engine(#[from] waypoint_engine::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, SyncError>;
