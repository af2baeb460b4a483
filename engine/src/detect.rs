//! Conflict detection between local records and a remote snapshot.
//!
//! # Algorithm
//!
//! For each local record `L`, with `S` its last known synced timestamp:
//!
//! 1. If the remote deleted `L` and `L` changed after `S`: `delete_edit`
//! 2. Else if a remote `R` exists, `R.updated_at != S` and
//!    `L.updated_at != S`: `concurrent_edit`
//! 3. Otherwise only one side (or neither) changed; the changed side wins
//!    without involving the resolver
//!
//! Output is sorted by (record id, table) so repeated passes over the same
//! input yield the same list.

use crate::{ConflictId, Record, RecordId, RecordKey, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Kind of divergence between local and remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed the record since the last sync
    ConcurrentEdit,
    /// The remote deleted a record the local side has since modified
    DeleteEdit,
}

impl ConflictType {
    /// Stable snake_case name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ConcurrentEdit => "concurrent_edit",
            ConflictType::DeleteEdit => "delete_edit",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected divergence between one local and one remote version of a
/// record.
///
/// `remote_entry` is `None` exactly when the conflict comes from a remote
/// delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// `table:record_id:detected_at`
    pub id: ConflictId,
    /// Kind of conflict
    pub conflict_type: ConflictType,
    /// Table of the conflicting record
    pub table_name: TableName,
    /// Id of the conflicting record
    pub record_id: RecordId,
    /// Local version
    pub local_entry: Record,
    /// Remote version, absent for remote deletes
    pub remote_entry: Option<Record>,
    /// Local modification time
    pub local_updated_at: Timestamp,
    /// Remote modification time, absent for remote deletes
    pub remote_updated_at: Option<Timestamp>,
    /// When the detector produced this conflict
    pub detected_at: Timestamp,
}

impl SyncConflict {
    /// A conflict where both sides edited the record.
    pub fn concurrent_edit(local: Record, remote: Record, detected_at: Timestamp) -> Self {
        Self {
            id: conflict_id(&local.table, &local.id, detected_at),
            conflict_type: ConflictType::ConcurrentEdit,
            table_name: local.table.clone(),
            record_id: local.id.clone(),
            local_updated_at: local.updated_at(),
            remote_updated_at: Some(remote.updated_at()),
            local_entry: local,
            remote_entry: Some(remote),
            detected_at,
        }
    }

    /// A conflict where the remote deleted a locally edited record.
    pub fn delete_edit(local: Record, detected_at: Timestamp) -> Self {
        Self {
            id: conflict_id(&local.table, &local.id, detected_at),
            conflict_type: ConflictType::DeleteEdit,
            table_name: local.table.clone(),
            record_id: local.id.clone(),
            local_updated_at: local.updated_at(),
            remote_updated_at: None,
            local_entry: local,
            remote_entry: None,
            detected_at,
        }
    }

    /// The conflicting record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table_name.clone(), self.record_id.clone())
    }
}

fn conflict_id(table: &str, record_id: &str, detected_at: Timestamp) -> ConflictId {
    format!("{}:{}:{}", table, record_id, detected_at)
}

/// Classifies local records against a remote snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Create a detector.
    pub fn new() -> Self {
        Self
    }

    /// Detect conflicts for a batch of local records.
    ///
    /// `remote` maps record ids to the remote version; `remote_deleted` holds
    /// ids the remote has deleted. Local tombstones never conflict: their
    /// delete is already queued.
    pub fn detect(
        &self,
        local: &[Record],
        remote: &HashMap<RecordId, Record>,
        remote_deleted: &HashSet<RecordId>,
        now: Timestamp,
    ) -> Vec<SyncConflict> {
        let mut conflicts: Vec<SyncConflict> = local
            .iter()
            .filter(|record| record.is_active())
            .filter_map(|record| self.classify(record, remote, remote_deleted, now))
            .collect();

        conflicts.sort_by(|a, b| {
            a.record_id
                .cmp(&b.record_id)
                .then_with(|| a.table_name.cmp(&b.table_name))
        });
        conflicts
    }

    fn classify(
        &self,
        local: &Record,
        remote: &HashMap<RecordId, Record>,
        remote_deleted: &HashSet<RecordId>,
        now: Timestamp,
    ) -> Option<SyncConflict> {
        if remote_deleted.contains(&local.id) {
            return local
                .has_unsynced_changes()
                .then(|| SyncConflict::delete_edit(local.clone(), now));
        }

        let remote_record = remote.get(&local.id)?;
        let synced_at = local.synced_at();
        let remote_changed = synced_at.map_or(true, |s| remote_record.updated_at() != s);
        let local_changed = synced_at.map_or(true, |s| local.updated_at() != s);

        (remote_changed && local_changed)
            .then(|| SyncConflict::concurrent_edit(local.clone(), remote_record.clone(), now))
    }
}

/// Index remote records by id.
pub fn index_by_id(records: impl IntoIterator<Item = Record>) -> HashMap<RecordId, Record> {
    records
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect()
}
