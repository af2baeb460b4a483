//! Event payloads.
//!
//! All events are JSON-encodable and use snake_case for tags and field names.

use serde::{Deserialize, Serialize};
use waypoint_engine::{
    ConflictId, ConflictResolution, ConflictType, Operation, QueueCounts, QueueItemId, RecordId,
    ResolvedBy, TableName, Timestamp,
};

/// Process-wide upload counters, derived from the queue on every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadState {
    /// Items still to be uploaded, in-flight and held ones included
    pub pending_count: usize,
    /// Items that failed permanently
    pub failed_count: usize,
    /// A drain loop is active
    pub is_running: bool,
    /// The drain loop is not claiming new items
    pub is_paused: bool,
}

impl UploadState {
    pub fn new(counts: QueueCounts, is_running: bool, is_paused: bool) -> Self {
        Self {
            pending_count: counts.pending,
            failed_count: counts.failed,
            is_running,
            is_paused,
        }
    }
}

/// Something observable happened in the processor or the conflict session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Processor state or counters changed.
    StateChanged { state: UploadState },

    /// The remote accepted an item.
    ItemSucceeded {
        item_id: QueueItemId,
        table: TableName,
        record_id: RecordId,
        operation: Operation,
        state: UploadState,
    },

    /// An attempt failed.
    ItemFailed {
        item_id: QueueItemId,
        table: TableName,
        record_id: RecordId,
        operation: Operation,
        error: String,
        /// No further automatic retries
        permanent: bool,
        /// When the next attempt may run
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_at: Option<Timestamp>,
        state: UploadState,
    },

    /// An item was removed without being applied.
    ItemDropped {
        item_id: QueueItemId,
        table: TableName,
        record_id: RecordId,
        reason: String,
        state: UploadState,
    },

    /// A conflict needs the user.
    ConflictDetected {
        conflict_id: ConflictId,
        conflict_type: ConflictType,
        table: TableName,
        record_id: RecordId,
    },

    /// A conflict was settled.
    ConflictResolved {
        conflict_id: ConflictId,
        resolution: ConflictResolution,
        resolved_by: ResolvedBy,
        table: TableName,
        record_id: RecordId,
    },
}

impl SyncEvent {
    /// The upload state carried by processor events.
    pub fn state(&self) -> Option<&UploadState> {
        match self {
            SyncEvent::StateChanged { state }
            | SyncEvent::ItemSucceeded { state, .. }
            | SyncEvent::ItemFailed { state, .. }
            | SyncEvent::ItemDropped { state, .. } => Some(state),
            SyncEvent::ConflictDetected { .. } | SyncEvent::ConflictResolved { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_changed_wire_format() {
        let event = SyncEvent::StateChanged {
            state: UploadState {
                pending_count: 2,
                failed_count: 1,
                is_running: true,
                is_paused: false,
            },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["state"]["pending_count"], 2);
        assert_eq!(json["state"]["is_running"], true);
    }

    #[test]
    fn conflict_events_carry_no_state() {
        let event = SyncEvent::ConflictResolved {
            conflict_id: "entries:E1:3000".into(),
            resolution: ConflictResolution::KeepRemote,
            resolved_by: ResolvedBy::User,
            table: "entries".into(),
            record_id: "E1".into(),
        };

        assert!(event.state().is_none());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["resolution"], "keep_remote");
        assert_eq!(json["resolved_by"], "user");
    }
}
