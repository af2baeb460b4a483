//! Snapshot types for persisting and restoring the mutation queue.
//!
//! Snapshots are the bridge between the in-memory queue and the local record
//! store. The worker writes one after every queue mutation so an app killed
//! mid-cycle resumes with the same outstanding work.

use crate::{error::Result, Error, QueueItem, RecordKey, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the queue.
///
/// Items are kept in enqueue order and holds are sorted, so serialization is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Retry policy at time of snapshot
    pub policy: RetryPolicy,
    /// Next item id to hand out
    pub next_id: u64,
    /// Outstanding items in enqueue order
    pub items: Vec<QueueItem>,
    /// Records held for conflict resolution
    #[serde(default)]
    pub holds: Vec<RecordKey>,
}

impl QueueSnapshot {
    /// Create a new empty snapshot.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            policy,
            next_id: 1,
            items: Vec::new(),
            holds: Vec::new(),
        }
    }

    /// Count items that are not permanently failed.
    pub fn pending_count(&self) -> usize {
        self.items.iter().filter(|i| !i.permanently_failed).count()
    }

    /// Check the snapshot is internally consistent.
    pub fn validate(&self) -> Result<()> {
        if self.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(Error::SnapshotVersionMismatch {
                expected: SNAPSHOT_FORMAT_VERSION,
                actual: self.format_version,
            });
        }

        let mut ids = HashSet::new();
        for item in &self.items {
            if !ids.insert(item.id) {
                return Err(Error::InvalidSnapshot(format!(
                    "duplicate queue item id: {}",
                    item.id
                )));
            }
            if item.operation.requires_payload() && item.payload.is_none() {
                return Err(Error::MissingPayload {
                    operation: item.operation.to_string(),
                    record_id: item.record_id.clone(),
                });
            }
        }

        Ok(())
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }

    /// Deserialize from a JSON value, as stored in a record payload.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_value(value).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Serialize to a JSON value.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }
}
