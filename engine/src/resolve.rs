//! Conflict resolution.
//!
//! The resolver turns a [`SyncConflict`] plus a [`ConflictResolution`] into
//! one authoritative record and the list of [`SyncAction`]s the caller must
//! carry out against the local store and the mutation queue. It never touches
//! storage itself.
//!
//! # Automatic rules
//!
//! - `delete_edit` where the local edit only touched metadata fields:
//!   accept the remote delete (`keep_remote`)
//! - `concurrent_edit` where both payloads carry the same content:
//!   `keep_local`, which is a no-op write
//!
//! Everything else needs a decision from the user.

use crate::{
    error::Result, ConflictId, ConflictType, ContentPolicy, Error, Origin, Record, RecordId,
    RecordKey, SyncConflict, TableName, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Decision applied to a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Local version wins and overwrites the remote
    KeepLocal,
    /// Remote version wins and overwrites local state
    KeepRemote,
    /// Keep the remote under its id and re-insert local as a new record
    KeepBoth,
}

impl ConflictResolution {
    /// Stable snake_case name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictResolution::KeepLocal => "keep_local",
            ConflictResolution::KeepRemote => "keep_remote",
            ConflictResolution::KeepBoth => "keep_both",
        }
    }
}

impl fmt::Display for ConflictResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who picked the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    /// An automatic rule
    Auto,
    /// The user
    User,
}

/// Side effect the caller must apply after a resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncAction {
    /// Write this record to the local store
    PutLocal { record: Record },
    /// Tombstone a local record
    DeleteLocal {
        table: TableName,
        record_id: RecordId,
    },
    /// Queue a remote create
    PushCreate { record: Record },
    /// Queue a remote update
    PushUpdate { record: Record },
    /// Discard queued mutations for a record that lost the conflict
    DropQueued { key: RecordKey },
}

/// Immutable audit record written after every resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictLogEntry {
    /// `conflict_id:resolution`
    pub id: String,
    /// The resolved conflict
    pub conflict_id: ConflictId,
    /// Table of the record
    pub table_name: TableName,
    /// Id of the record
    pub record_id: RecordId,
    /// Kind of conflict
    pub conflict_type: ConflictType,
    /// Local modification time
    pub local_updated_at: Timestamp,
    /// Remote modification time, absent for remote deletes
    pub remote_updated_at: Option<Timestamp>,
    /// Local payload at resolution time
    pub local_payload: Value,
    /// Remote payload at resolution time
    pub remote_payload: Option<Value>,
    /// Decision applied
    pub resolution: ConflictResolution,
    /// Who decided
    pub resolved_by: ResolvedBy,
    /// When it was applied
    pub resolved_at: Timestamp,
}

impl ConflictLogEntry {
    fn new(
        conflict: &SyncConflict,
        resolution: ConflictResolution,
        resolved_by: ResolvedBy,
        resolved_at: Timestamp,
    ) -> Self {
        Self {
            id: format!("{}:{}", conflict.id, resolution),
            conflict_id: conflict.id.clone(),
            table_name: conflict.table_name.clone(),
            record_id: conflict.record_id.clone(),
            conflict_type: conflict.conflict_type,
            local_updated_at: conflict.local_updated_at,
            remote_updated_at: conflict.remote_updated_at,
            local_payload: conflict.local_entry.payload.clone(),
            remote_payload: conflict.remote_entry.as_ref().map(|r| r.payload.clone()),
            resolution,
            resolved_by,
            resolved_at,
        }
    }
}

/// Append-only log of resolutions, for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictLog {
    entries: Vec<ConflictLogEntry>,
}

impl ConflictLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.
    pub fn record(&mut self, entry: ConflictLogEntry) {
        self.entries.push(entry);
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[ConflictLogEntry] {
        &self.entries
    }

    /// Entries for one record.
    pub fn for_record<'a>(
        &'a self,
        table: &'a str,
        record_id: &'a str,
    ) -> impl Iterator<Item = &'a ConflictLogEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.table_name == table && e.record_id == record_id)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The finalized result of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionOutcome {
    /// The resolved conflict
    pub conflict_id: ConflictId,
    /// Decision applied
    pub resolution: ConflictResolution,
    /// Who decided
    pub resolved_by: ResolvedBy,
    /// Authoritative record under the original id; `None` if it was deleted
    pub record: Option<Record>,
    /// The local copy re-inserted under a new id (`keep_both` only)
    pub duplicate: Option<Record>,
    /// Side effects for the caller
    pub actions: Vec<SyncAction>,
    /// The audit entry appended to the log
    pub log_entry: ConflictLogEntry,
}

/// Result of [`ConflictResolver::auto_resolve`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoResolved {
    /// Conflicts settled by an automatic rule
    pub resolved: Vec<ResolutionOutcome>,
    /// Conflicts that need a user decision, in input order
    pub needs_user_input: Vec<SyncConflict>,
}

/// Applies automatic rules and user decisions to conflicts.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    policy: ContentPolicy,
    log: ConflictLog,
}

impl ConflictResolver {
    /// Create a resolver comparing content with `policy`.
    pub fn new(policy: ContentPolicy) -> Self {
        Self {
            policy,
            log: ConflictLog::new(),
        }
    }

    /// The content policy.
    pub fn policy(&self) -> &ContentPolicy {
        &self.policy
    }

    /// The audit log.
    pub fn log(&self) -> &ConflictLog {
        &self.log
    }

    /// The automatic decision for a conflict, if one applies.
    pub fn auto_decision(&self, conflict: &SyncConflict) -> Option<ConflictResolution> {
        match (conflict.conflict_type, &conflict.remote_entry) {
            (ConflictType::DeleteEdit, _) => (!conflict
                .local_entry
                .has_content_changes(&self.policy))
            .then_some(ConflictResolution::KeepRemote),
            (ConflictType::ConcurrentEdit, Some(remote)) => self
                .policy
                .content_eq(&conflict.local_entry.payload, &remote.payload)
                .then_some(ConflictResolution::KeepLocal),
            (ConflictType::ConcurrentEdit, None) => None,
        }
    }

    /// Split conflicts into auto-resolved ones and ones needing the user.
    pub fn auto_resolve(&mut self, conflicts: Vec<SyncConflict>, now: Timestamp) -> AutoResolved {
        let mut result = AutoResolved::default();

        for conflict in conflicts {
            let outcome = self
                .auto_decision(&conflict)
                .and_then(|resolution| {
                    self.finalize(&conflict, resolution, ResolvedBy::Auto, now)
                        .ok()
                });
            match outcome {
                Some(outcome) => result.resolved.push(outcome),
                None => result.needs_user_input.push(conflict),
            }
        }

        result
    }

    /// Apply a user decision.
    ///
    /// Fails with [`Error::InvalidResolution`] for `keep_both` on a
    /// `delete_edit` conflict; nothing is logged in that case.
    pub fn apply_resolution(
        &mut self,
        conflict: &SyncConflict,
        resolution: ConflictResolution,
        now: Timestamp,
    ) -> Result<ResolutionOutcome> {
        self.finalize(conflict, resolution, ResolvedBy::User, now)
    }

    fn finalize(
        &mut self,
        conflict: &SyncConflict,
        resolution: ConflictResolution,
        resolved_by: ResolvedBy,
        now: Timestamp,
    ) -> Result<ResolutionOutcome> {
        let key = conflict.key();
        let local = &conflict.local_entry;

        let (record, duplicate, actions) = match (resolution, &conflict.remote_entry) {
            (ConflictResolution::KeepLocal, Some(remote))
                if self.policy.content_eq(&local.payload, &remote.payload) =>
            {
                // Same content on both sides: nothing to push.
                let mut record = local.clone();
                record.mark_synced(&self.policy);
                let actions = vec![
                    SyncAction::DropQueued { key },
                    SyncAction::PutLocal {
                        record: record.clone(),
                    },
                ];
                (Some(record), None, actions)
            }
            (ConflictResolution::KeepLocal, Some(remote)) => {
                // The remote version has been seen; local overwrites it.
                // Queued items are dropped first so a pending create for a
                // never-synced record cannot absorb the update.
                let mut record = local.clone();
                record.metadata.synced_at = Some(remote.updated_at());
                record.metadata.synced_fingerprint = Some(self.policy.fingerprint(&remote.payload));
                record.metadata.touch(now, Origin::Local);
                let actions = vec![
                    SyncAction::DropQueued { key },
                    SyncAction::PutLocal {
                        record: record.clone(),
                    },
                    SyncAction::PushUpdate {
                        record: record.clone(),
                    },
                ];
                (Some(record), None, actions)
            }
            (ConflictResolution::KeepLocal, None) => {
                // The remote copy is gone; recreate it from local.
                let mut record = local.clone();
                record.metadata.synced_at = None;
                record.metadata.synced_fingerprint = None;
                record.metadata.touch(now, Origin::Local);
                let actions = vec![
                    SyncAction::DropQueued { key },
                    SyncAction::PutLocal {
                        record: record.clone(),
                    },
                    SyncAction::PushCreate {
                        record: record.clone(),
                    },
                ];
                (Some(record), None, actions)
            }
            (ConflictResolution::KeepRemote, Some(remote)) => {
                let record = self.adopt_remote(remote);
                let actions = vec![
                    SyncAction::DropQueued { key },
                    SyncAction::PutLocal {
                        record: record.clone(),
                    },
                ];
                (Some(record), None, actions)
            }
            (ConflictResolution::KeepRemote, None) => {
                let actions = vec![
                    SyncAction::DropQueued { key },
                    SyncAction::DeleteLocal {
                        table: conflict.table_name.clone(),
                        record_id: conflict.record_id.clone(),
                    },
                ];
                (None, None, actions)
            }
            (ConflictResolution::KeepBoth, Some(remote)) => {
                let record = self.adopt_remote(remote);
                let copy = local.duplicate_as(uuid::Uuid::new_v4().to_string(), now);
                let actions = vec![
                    SyncAction::DropQueued { key },
                    SyncAction::PutLocal {
                        record: record.clone(),
                    },
                    SyncAction::PutLocal {
                        record: copy.clone(),
                    },
                    SyncAction::PushCreate {
                        record: copy.clone(),
                    },
                ];
                (Some(record), Some(copy), actions)
            }
            (ConflictResolution::KeepBoth, None) => {
                return Err(Error::InvalidResolution {
                    resolution: resolution.to_string(),
                    conflict_type: conflict.conflict_type,
                });
            }
        };

        let log_entry = ConflictLogEntry::new(conflict, resolution, resolved_by, now);
        self.log.record(log_entry.clone());

        Ok(ResolutionOutcome {
            conflict_id: conflict.id.clone(),
            resolution,
            resolved_by,
            record,
            duplicate,
            actions,
            log_entry,
        })
    }

    fn adopt_remote(&self, remote: &Record) -> Record {
        let mut record = remote.clone();
        record.metadata.origin = Origin::Remote;
        record.mark_synced(&self.policy);
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConflictDetector, detect::index_by_id};
    use serde_json::json;
    use std::collections::HashSet;

    fn synced_local(id: &str, text: &str) -> Record {
        let mut record = Record::new(id, "entries", json!({ "contentText": text }), 500);
        record.mark_synced(&ContentPolicy::default());
        record
    }

    fn concurrent(local_text: &str, remote_text: &str) -> SyncConflict {
        let mut local = synced_local("E1", "base");
        local.update_payload(json!({ "contentText": local_text }), 1000, Origin::Local);
        let remote = Record::remote("E1", "entries", json!({ "contentText": remote_text }), 2000);
        SyncConflict::concurrent_edit(local, remote, 3000)
    }

    fn delete_edit(local_payload: Value) -> SyncConflict {
        let mut local = synced_local("E1", "base");
        local.update_payload(local_payload, 1000, Origin::Local);
        SyncConflict::delete_edit(local, 3000)
    }

    #[test]
    fn identical_content_auto_resolves_to_keep_local() {
        let mut resolver = ConflictResolver::default();
        let result = resolver.auto_resolve(vec![concurrent("same", "same")], 4000);

        assert!(result.needs_user_input.is_empty());
        assert_eq!(result.resolved.len(), 1);

        let outcome = &result.resolved[0];
        assert_eq!(outcome.resolution, ConflictResolution::KeepLocal);
        assert_eq!(outcome.resolved_by, ResolvedBy::Auto);
        // No duplicate write is queued
        assert!(!outcome
            .actions
            .iter()
            .any(|a| matches!(a, SyncAction::PushUpdate { .. } | SyncAction::PushCreate { .. })));
        assert_eq!(resolver.log().len(), 1);
        assert_eq!(outcome.log_entry.local_payload, outcome.log_entry.remote_payload.clone().unwrap());
    }

    #[test]
    fn metadata_only_difference_is_identical() {
        let mut local = synced_local("E1", "base");
        local.update_payload(json!({"contentText": "x", "updatedAt": 1000}), 1000, Origin::Local);
        let remote = Record::remote("E1", "entries", json!({"contentText": "x", "updatedAt": 2000}), 2000);
        let conflict = SyncConflict::concurrent_edit(local, remote, 3000);

        let resolver = ConflictResolver::default();
        assert_eq!(
            resolver.auto_decision(&conflict),
            Some(ConflictResolution::KeepLocal)
        );
    }

    #[test]
    fn differing_content_needs_user() {
        let mut resolver = ConflictResolver::default();
        let result = resolver.auto_resolve(vec![concurrent("mine", "theirs")], 4000);

        assert!(result.resolved.is_empty());
        assert_eq!(result.needs_user_input.len(), 1);
        assert!(resolver.log().is_empty());
    }

    #[test]
    fn metadata_touch_accepts_remote_delete() {
        let mut resolver = ConflictResolver::default();
        let conflict = delete_edit(json!({"contentText": "base", "updatedAt": 1000}));
        let result = resolver.auto_resolve(vec![conflict], 4000);

        assert_eq!(result.resolved.len(), 1);
        let outcome = &result.resolved[0];
        assert_eq!(outcome.resolution, ConflictResolution::KeepRemote);
        assert!(outcome.record.is_none());
        assert!(outcome.actions.contains(&SyncAction::DeleteLocal {
            table: "entries".into(),
            record_id: "E1".into(),
        }));
    }

    #[test]
    fn content_edit_against_remote_delete_needs_user() {
        let mut resolver = ConflictResolver::default();
        let result = resolver.auto_resolve(vec![delete_edit(json!({"contentText": "new"}))], 4000);

        assert!(result.resolved.is_empty());
        assert_eq!(result.needs_user_input.len(), 1);
    }

    #[test]
    fn keep_remote_takes_remote_payload() {
        let mut resolver = ConflictResolver::default();
        let conflict = concurrent("local text", "remote text");

        let outcome = resolver
            .apply_resolution(&conflict, ConflictResolution::KeepRemote, 4000)
            .unwrap();

        let record = outcome.record.unwrap();
        assert_eq!(record.payload["contentText"], "remote text");
        assert_eq!(record.metadata.origin, Origin::Remote);
        assert!(!record.has_unsynced_changes());
        assert_eq!(outcome.actions[0], SyncAction::DropQueued { key: conflict.key() });

        assert_eq!(resolver.log().len(), 1);
        assert_eq!(resolver.log().entries()[0].resolution, ConflictResolution::KeepRemote);
        assert_eq!(resolver.log().entries()[0].resolved_by, ResolvedBy::User);
    }

    #[test]
    fn keep_local_pushes_update() {
        let mut resolver = ConflictResolver::default();
        let conflict = concurrent("local text", "remote text");

        let outcome = resolver
            .apply_resolution(&conflict, ConflictResolution::KeepLocal, 4000)
            .unwrap();

        let record = outcome.record.unwrap();
        assert_eq!(record.payload["contentText"], "local text");
        assert_eq!(record.updated_at(), 4000);
        assert_eq!(
            outcome.actions,
            vec![
                SyncAction::DropQueued { key: conflict.key() },
                SyncAction::PutLocal { record: record.clone() },
                SyncAction::PushUpdate { record: record.clone() },
            ]
        );
    }

    #[test]
    fn keep_local_after_remote_delete_recreates() {
        let mut resolver = ConflictResolver::default();
        let conflict = delete_edit(json!({"contentText": "new"}));

        let outcome = resolver
            .apply_resolution(&conflict, ConflictResolution::KeepLocal, 4000)
            .unwrap();

        let record = outcome.record.unwrap();
        assert_eq!(record.synced_at(), None);
        assert!(outcome
            .actions
            .contains(&SyncAction::PushCreate { record: record.clone() }));
    }

    #[test]
    fn keep_both_duplicates_local() {
        let mut resolver = ConflictResolver::default();
        let conflict = concurrent("local text", "remote text");

        let outcome = resolver
            .apply_resolution(&conflict, ConflictResolution::KeepBoth, 4000)
            .unwrap();

        let record = outcome.record.unwrap();
        let copy = outcome.duplicate.unwrap();
        assert_eq!(record.id, "E1");
        assert_eq!(record.payload["contentText"], "remote text");
        assert_ne!(copy.id, "E1");
        assert_eq!(copy.payload["contentText"], "local text");
        assert!(outcome
            .actions
            .contains(&SyncAction::PushCreate { record: copy.clone() }));
    }

    #[test]
    fn keep_both_on_delete_edit_is_invalid() {
        let mut resolver = ConflictResolver::default();
        let conflict = delete_edit(json!({"contentText": "new"}));

        let result = resolver.apply_resolution(&conflict, ConflictResolution::KeepBoth, 4000);
        assert_eq!(
            result,
            Err(Error::InvalidResolution {
                resolution: "keep_both".into(),
                conflict_type: ConflictType::DeleteEdit,
            })
        );
        assert!(resolver.log().is_empty());
    }

    #[test]
    fn detector_to_resolver_scenario() {
        // E1 edited locally at T1 and remotely at T2 > T1
        let mut local = synced_local("E1", "base");
        local.update_payload(json!({"contentText": "local"}), 1000, Origin::Local);
        let remote = index_by_id([Record::remote(
            "E1",
            "entries",
            json!({"contentText": "remote"}),
            2000,
        )]);

        let conflicts = ConflictDetector::new().detect(&[local], &remote, &HashSet::new(), 3000);
        assert_eq!(conflicts.len(), 1);

        let mut resolver = ConflictResolver::default();
        let auto = resolver.auto_resolve(conflicts, 3000);
        assert_eq!(auto.needs_user_input.len(), 1);

        let outcome = resolver
            .apply_resolution(&auto.needs_user_input[0], ConflictResolution::KeepRemote, 4000)
            .unwrap();
        assert_eq!(outcome.record.unwrap().payload["contentText"], "remote");

        let entries: Vec<_> = resolver.log().for_record("entries", "E1").collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].resolution.to_string(), "keep_remote");
    }

    #[test]
    fn resolution_serialization() {
        let json = serde_json::to_string(&ConflictResolution::KeepBoth).unwrap();
        assert_eq!(json, "\"keep_both\"");

        let parsed: ConflictResolution = serde_json::from_str("\"keep_local\"").unwrap();
        assert_eq!(parsed, ConflictResolution::KeepLocal);
    }
}
