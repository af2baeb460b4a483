//! Conflict resolution session.
//!
//! A session takes one detection pass worth of conflicts, settles the ones an
//! automatic rule can decide, and hands the rest to the user one at a time.
//! The conflict at the front of the pending list is "current" while the
//! session is active.

use crate::{
    error::Result, AutoResolved, ConflictDetector, ConflictId, ConflictResolution,
    ConflictResolver, ContentPolicy, Error, Record, RecordId, RecordKey, ResolutionOutcome,
    SyncConflict, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Summary of where a session stands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Conflict awaiting a decision, if any
    pub current: Option<ConflictId>,
    /// Conflicts still to be decided, current included
    pub pending: usize,
    /// Resolutions applied so far, automatic ones included
    pub resolved: usize,
    /// Pending conflicts the user has deferred at least once
    pub skipped: usize,
}

/// Sequences conflicts needing user input.
#[derive(Debug, Clone, Default)]
pub struct ConflictSession {
    detector: ConflictDetector,
    resolver: ConflictResolver,
    pending: VecDeque<SyncConflict>,
    resolved: Vec<ResolutionOutcome>,
    skipped: BTreeSet<ConflictId>,
    active: bool,
}

impl ConflictSession {
    /// Create a session comparing content with `policy`.
    pub fn new(policy: ContentPolicy) -> Self {
        Self {
            resolver: ConflictResolver::new(policy),
            ..Self::default()
        }
    }

    /// The underlying resolver, for its audit log.
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Run detection and automatic resolution over a batch.
    ///
    /// Conflicts left for the user replace the pending list and the first of
    /// them becomes current. Returns what this pass produced.
    pub fn check_for_conflicts(
        &mut self,
        local: &[Record],
        remote: &HashMap<RecordId, Record>,
        remote_deleted: &HashSet<RecordId>,
        now: Timestamp,
    ) -> AutoResolved {
        let conflicts = self.detector.detect(local, remote, remote_deleted, now);
        self.pending.clear();
        self.skipped.clear();
        self.settle(conflicts, now)
    }

    /// Like [`check_for_conflicts`](Self::check_for_conflicts), scoped to
    /// one table.
    ///
    /// Only pending conflicts of `table` are replaced; undecided conflicts
    /// of other tables stay pending in their current order. Local records
    /// of other tables are ignored.
    pub fn check_table_conflicts(
        &mut self,
        table: &str,
        local: &[Record],
        remote: &HashMap<RecordId, Record>,
        remote_deleted: &HashSet<RecordId>,
        now: Timestamp,
    ) -> AutoResolved {
        let conflicts = self
            .detector
            .detect(local, remote, remote_deleted, now)
            .into_iter()
            .filter(|conflict| conflict.table_name == table)
            .collect();

        let skipped = &mut self.skipped;
        self.pending.retain(|conflict| {
            let keep = conflict.table_name != table;
            if !keep {
                skipped.remove(&conflict.id);
            }
            keep
        });
        self.settle(conflicts, now)
    }

    fn settle(&mut self, conflicts: Vec<SyncConflict>, now: Timestamp) -> AutoResolved {
        let result = self.resolver.auto_resolve(conflicts, now);

        self.resolved.extend(result.resolved.iter().cloned());
        self.pending.extend(result.needs_user_input.iter().cloned());
        self.active = !self.pending.is_empty();

        result
    }

    /// Put a conflict back at the front of the pending list and make it
    /// current, e.g. when its resolution could not be applied to storage.
    ///
    /// Any recorded outcome for it is forgotten. The resolver's audit log
    /// keeps its entry.
    pub fn reopen(&mut self, conflict: SyncConflict) {
        self.resolved.retain(|outcome| outcome.conflict_id != conflict.id);
        self.pending.retain(|pending| pending.id != conflict.id);
        self.pending.push_front(conflict);
        self.active = true;
    }

    /// The conflict awaiting a decision.
    pub fn current(&self) -> Option<&SyncConflict> {
        if self.active {
            self.pending.front()
        } else {
            None
        }
    }

    /// Apply a decision to the current conflict and advance to the next.
    ///
    /// On error the session is left exactly as it was.
    pub fn resolve_conflict(
        &mut self,
        resolution: ConflictResolution,
        now: Timestamp,
    ) -> Result<ResolutionOutcome> {
        let conflict = self
            .pending
            .front()
            .filter(|_| self.active)
            .ok_or(Error::NoConflictToResolve)?;
        let outcome = self.resolver.apply_resolution(conflict, resolution, now)?;

        if let Some(done) = self.pending.pop_front() {
            self.skipped.remove(&done.id);
        }
        self.active = !self.pending.is_empty();
        self.resolved.push(outcome.clone());
        Ok(outcome)
    }

    /// Move the current conflict to the back of the pending list.
    ///
    /// Returns the new current conflict.
    pub fn skip_current_conflict(&mut self) -> Option<&SyncConflict> {
        if self.active {
            if let Some(conflict) = self.pending.pop_front() {
                self.skipped.insert(conflict.id.clone());
                self.pending.push_back(conflict);
            }
        }
        self.current()
    }

    /// Stop presenting conflicts. Pending ones stay for a later [`resume`].
    ///
    /// [`resume`]: Self::resume
    pub fn cancel_resolution(&mut self) {
        self.active = false;
    }

    /// Make the front of the pending list current again.
    pub fn resume(&mut self) -> Option<&SyncConflict> {
        self.active = !self.pending.is_empty();
        self.current()
    }

    /// Whether a conflict is being presented.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Conflicts still awaiting a decision, current first.
    pub fn pending(&self) -> impl Iterator<Item = &SyncConflict> {
        self.pending.iter()
    }

    /// Records with an undecided conflict.
    pub fn pending_keys(&self) -> Vec<RecordKey> {
        self.pending.iter().map(SyncConflict::key).collect()
    }

    /// Every resolution applied in this session, oldest first.
    pub fn resolved(&self) -> &[ResolutionOutcome] {
        &self.resolved
    }

    /// Ids of pending conflicts the user has skipped.
    pub fn skipped(&self) -> impl Iterator<Item = &ConflictId> {
        self.skipped.iter()
    }

    /// Current status.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            current: self.current().map(|c| c.id.clone()),
            pending: self.pending.len(),
            resolved: self.resolved.len(),
            skipped: self.skipped.len(),
        }
    }
}
