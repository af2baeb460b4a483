//! Record types for local and remote data.

use crate::{ContentPolicy, RecordId, TableName, Timestamp};
use serde::{Deserialize, Serialize};

/// Origin of a record's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Created or modified locally
    Local,
    /// Received from remote/server
    Remote,
}

/// Metadata associated with a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// When the record was first created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the record was last updated (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// `updated_at` as of the last successful sync; `None` if never synced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<Timestamp>,
    /// Content fingerprint as of the last successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_fingerprint: Option<String>,
    /// Whether this state originated locally or from remote
    pub origin: Origin,
}

impl Metadata {
    /// Create new metadata for a locally created record.
    pub fn new_local(timestamp: Timestamp) -> Self {
        Self {
            created_at: timestamp,
            updated_at: timestamp,
            synced_at: None,
            synced_fingerprint: None,
            origin: Origin::Local,
        }
    }

    /// Create new metadata for a remotely received record.
    ///
    /// Remote state is by definition in sync at the time it is received.
    pub fn new_remote(timestamp: Timestamp) -> Self {
        Self {
            created_at: timestamp,
            updated_at: timestamp,
            synced_at: Some(timestamp),
            synced_fingerprint: None,
            origin: Origin::Remote,
        }
    }

    /// Update metadata for a modification.
    pub fn touch(&mut self, timestamp: Timestamp, origin: Origin) {
        self.updated_at = timestamp;
        self.origin = origin;
    }
}

/// A data record as seen by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier for this record
    pub id: RecordId,
    /// Table this record belongs to
    pub table: TableName,
    /// The actual data payload (JSON value)
    pub payload: serde_json::Value,
    /// Record metadata
    pub metadata: Metadata,
    /// Soft delete flag (tombstone)
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Create a new, never-synced local record.
    pub fn new(
        id: impl Into<RecordId>,
        table: impl Into<TableName>,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            payload,
            metadata: Metadata::new_local(timestamp),
            deleted: false,
        }
    }

    /// Create a record as received from the remote store.
    pub fn remote(
        id: impl Into<RecordId>,
        table: impl Into<TableName>,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            payload,
            metadata: Metadata::new_remote(timestamp),
            deleted: false,
        }
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Last modification time.
    pub fn updated_at(&self) -> Timestamp {
        self.metadata.updated_at
    }

    /// Last known synced timestamp.
    pub fn synced_at(&self) -> Option<Timestamp> {
        self.metadata.synced_at
    }

    /// Whether the record changed since it was last synced.
    ///
    /// A record that never synced always counts as changed.
    pub fn has_unsynced_changes(&self) -> bool {
        match self.metadata.synced_at {
            Some(synced_at) => self.metadata.updated_at > synced_at,
            None => true,
        }
    }

    /// Whether the local edits since the last sync touched content fields.
    ///
    /// Without a stored fingerprint there is nothing to compare against, so
    /// the change is assumed to be real content.
    pub fn has_content_changes(&self, policy: &ContentPolicy) -> bool {
        match &self.metadata.synced_fingerprint {
            Some(fingerprint) => *fingerprint != policy.fingerprint(&self.payload),
            None => true,
        }
    }

    /// Mark the current state as synced.
    pub fn mark_synced(&mut self, policy: &ContentPolicy) {
        self.metadata.synced_at = Some(self.metadata.updated_at);
        self.metadata.synced_fingerprint = Some(policy.fingerprint(&self.payload));
    }

    /// Mark record as deleted (tombstone).
    pub fn mark_deleted(&mut self, timestamp: Timestamp, origin: Origin) {
        self.deleted = true;
        self.metadata.touch(timestamp, origin);
    }

    /// Update record payload.
    pub fn update_payload(
        &mut self,
        payload: serde_json::Value,
        timestamp: Timestamp,
        origin: Origin,
    ) {
        self.payload = payload;
        self.metadata.touch(timestamp, origin);
    }

    /// A copy of this record under a new id, with no sync history.
    pub fn duplicate_as(&self, id: impl Into<RecordId>, timestamp: Timestamp) -> Self {
        let mut payload = self.payload.clone();
        let id = id.into();
        if let Some(map) = payload.as_object_mut() {
            if map.contains_key("id") {
                map.insert("id".to_string(), serde_json::Value::String(id.clone()));
            }
        }
        Self {
            id,
            table: self.table.clone(),
            payload,
            metadata: Metadata {
                created_at: self.metadata.created_at,
                ..Metadata::new_local(timestamp)
            },
            deleted: false,
        }
    }
}
