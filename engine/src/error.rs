//! Error types for the Waypoint engine.

use crate::{ConflictType, QueueItemId, RecordId, RecordKey};
use thiserror::Error;

/// All possible errors from the Waypoint engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Queue errors
    #[error("queue item not found: {0}")]
    QueueItemNotFound(QueueItemId),

    #[error("missing payload for {operation} of record {record_id}")]
    MissingPayload {
        operation: String,
        record_id: RecordId,
    },

    // Record errors
    #[error("record not found: {0}")]
    RecordNotFound(RecordKey),

    // Resolution errors
    #[error("resolution '{resolution}' is not valid for a {conflict_type} conflict")]
    InvalidResolution {
        resolution: String,
        conflict_type: ConflictType,
    },

    #[error("no conflict to resolve")]
    NoConflictToResolve,

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("snapshot format mismatch: expected {expected}, got {actual}")]
    SnapshotVersionMismatch { expected: u32, actual: u32 },
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
