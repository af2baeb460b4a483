//! Conflict coordination.
//!
//! Wires the engine's [`ConflictSession`] to the stores and the processor:
//! gathers both sides of a table, applies every resolution's actions, keeps
//! records with an undecided conflict out of the upload loop, and writes
//! the conflict log.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use waypoint_engine::detect::index_by_id;
use waypoint_engine::{
    ConflictResolution, ConflictSession, ContentPolicy, Error as EngineError, Operation, Origin,
    Record, RecordId, RecordKey, ResolutionOutcome, SessionStatus, SyncAction, SyncConflict,
    Timestamp,
};

use crate::config::Config;
use crate::error::Result;
use crate::events::{EventBus, SyncEvent};
use crate::local::RecordStore;
use crate::persist;
use crate::processor::{Collaborators, SyncProcessor};
use crate::remote::{CallOptions, RemoteStore};

/// What one [`ConflictCoordinator::check_table`] pass found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckSummary {
    /// Local records changed since the watermark
    pub checked: usize,
    /// Conflicts settled by an automatic rule
    pub auto_resolved: usize,
    /// Conflicts waiting for the user
    pub needs_input: usize,
    /// Automatic resolutions that could not be applied; the next check
    /// detects them again
    pub failed: usize,
}

/// Drives a [`ConflictSession`] against real storage.
pub struct ConflictCoordinator {
    session: Mutex<ConflictSession>,
    policy: ContentPolicy,
    store: Arc<dyn RecordStore>,
    remote: Arc<dyn RemoteStore>,
    processor: SyncProcessor,
    events: Arc<EventBus>,
    options: CallOptions,
}

impl ConflictCoordinator {
    /// Create a coordinator feeding follow-up mutations into `processor`.
    ///
    /// Events are published on the processor's bus.
    pub fn new(config: &Config, collaborators: &Collaborators, processor: SyncProcessor) -> Self {
        let policy = ContentPolicy::default();
        Self {
            session: Mutex::new(ConflictSession::new(policy.clone())),
            policy,
            store: collaborators.store.clone(),
            remote: collaborators.remote.clone(),
            events: processor.events(),
            processor,
            options: CallOptions {
                timeout: config.remote_timeout(),
            },
        }
    }

    /// Compare a table's local changes since `since` with the remote.
    ///
    /// Automatic resolutions are applied immediately. Conflicts that need
    /// the user replace the session's pending conflicts for `table`, and
    /// their records are held out of the upload loop until decided. Pending
    /// conflicts of other tables are left alone.
    pub async fn check_table(
        &self,
        table: &str,
        since: Timestamp,
        now: Timestamp,
    ) -> Result<CheckSummary> {
        let local = self.store.list_changed_since(table, since).await?;
        let ids: Vec<RecordId> = local.iter().map(|record| record.id.clone()).collect();

        let remote = if ids.is_empty() {
            Vec::new()
        } else {
            self.remote
                .fetch_remote_snapshot(table, &ids, &self.options)
                .await?
        };
        let remote = index_by_id(remote);
        let deleted: HashSet<RecordId> = self
            .remote
            .list_remote_deleted_since(table, since, &self.options)
            .await?
            .into_iter()
            .collect();

        let mut session = self.session.lock().await;
        let previous = table_keys(&session, table);
        let result = session.check_table_conflicts(table, &local, &remote, &deleted, now);
        let current = table_keys(&session, table);

        for key in &current {
            self.processor.hold(key.clone()).await;
        }

        let mut failed = 0;
        for outcome in &result.resolved {
            if let Err(err) = self.apply(outcome, now).await {
                warn!(
                    conflict_id = %outcome.conflict_id,
                    error = %err,
                    "Could not apply automatic resolution"
                );
                failed += 1;
                continue;
            }
            info!(
                conflict_id = %outcome.conflict_id,
                resolution = %outcome.resolution,
                "Conflict auto-resolved"
            );
            self.publish_resolved(outcome);
        }

        for key in previous.iter().filter(|key| !current.contains(key)) {
            self.processor.unhold(key).await;
        }

        for conflict in &result.needs_user_input {
            info!(
                conflict_id = %conflict.id,
                conflict_type = %conflict.conflict_type,
                "Conflict needs user input"
            );
            self.events.publish(SyncEvent::ConflictDetected {
                conflict_id: conflict.id.clone(),
                conflict_type: conflict.conflict_type,
                table: conflict.table_name.clone(),
                record_id: conflict.record_id.clone(),
            });
        }
        drop(session);

        let summary = CheckSummary {
            checked: local.len(),
            auto_resolved: result.resolved.len() - failed,
            needs_input: result.needs_user_input.len(),
            failed,
        };
        debug!(table = %table, since, ?summary, "Conflict check finished");

        if summary.auto_resolved > 0 {
            self.processor.start();
        }
        Ok(summary)
    }

    /// The conflict awaiting a decision.
    pub async fn current(&self) -> Option<SyncConflict> {
        self.session.lock().await.current().cloned()
    }

    /// Conflicts still awaiting a decision, current first.
    pub async fn pending(&self) -> Vec<SyncConflict> {
        self.session.lock().await.pending().cloned().collect()
    }

    /// Apply the user's decision to the current conflict.
    ///
    /// The record is released to the upload loop and the processor started
    /// so any follow-up push goes out. If the outcome cannot be applied the
    /// conflict becomes current again and its record stays held.
    pub async fn resolve_current(
        &self,
        resolution: ConflictResolution,
        now: Timestamp,
    ) -> Result<ResolutionOutcome> {
        let mut session = self.session.lock().await;
        let conflict = session
            .current()
            .cloned()
            .ok_or(EngineError::NoConflictToResolve)?;
        let outcome = session.resolve_conflict(resolution, now)?;
        if let Err(err) = self.apply(&outcome, now).await {
            warn!(
                conflict_id = %outcome.conflict_id,
                error = %err,
                "Could not apply resolution, conflict reopened"
            );
            session.reopen(conflict);
            return Err(err);
        }
        drop(session);

        let key = RecordKey::new(
            outcome.log_entry.table_name.clone(),
            outcome.log_entry.record_id.clone(),
        );
        self.processor.unhold(&key).await;

        info!(
            conflict_id = %outcome.conflict_id,
            resolution = %outcome.resolution,
            "Conflict resolved by user"
        );
        self.publish_resolved(&outcome);
        self.processor.start();
        Ok(outcome)
    }

    /// Move the current conflict to the back of the queue of decisions.
    ///
    /// Its record is released, so pending local edits upload as they are.
    /// Returns the new current conflict.
    pub async fn skip_current(&self) -> Option<SyncConflict> {
        let mut session = self.session.lock().await;
        let skipped = session.current().map(SyncConflict::key);
        let next = session.skip_current_conflict().cloned();
        drop(session);

        if let Some(key) = skipped {
            debug!(record = %key, "Conflict skipped");
            if self.processor.unhold(&key).await {
                self.processor.start();
            }
        }
        next
    }

    /// Stop presenting conflicts. Records stay held.
    pub async fn cancel(&self) {
        self.session.lock().await.cancel_resolution();
        debug!("Conflict resolution cancelled");
    }

    /// Present pending conflicts again after [`cancel`](Self::cancel).
    pub async fn resume(&self) -> Option<SyncConflict> {
        self.session.lock().await.resume().cloned()
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.lock().await.status()
    }

    async fn apply(&self, outcome: &ResolutionOutcome, now: Timestamp) -> Result<()> {
        for action in &outcome.actions {
            match action {
                SyncAction::PutLocal { record } => {
                    self.store.put_local(record.clone()).await?;
                }
                SyncAction::DeleteLocal { table, record_id } => {
                    match self.store.get_local(table, record_id).await? {
                        Some(mut record) => {
                            record.mark_deleted(now, Origin::Remote);
                            record.mark_synced(&self.policy);
                            self.store.put_local(record).await?;
                        }
                        None => {
                            let err = EngineError::RecordNotFound(RecordKey::new(
                                table.clone(),
                                record_id.clone(),
                            ));
                            warn!(error = %err, "No local record to delete");
                        }
                    }
                }
                SyncAction::PushCreate { record } => {
                    self.processor
                        .enqueue(
                            &record.table,
                            &record.id,
                            Operation::Create,
                            Some(record.payload.clone()),
                        )
                        .await?;
                }
                SyncAction::PushUpdate { record } => {
                    self.processor
                        .enqueue(
                            &record.table,
                            &record.id,
                            Operation::Update,
                            Some(record.payload.clone()),
                        )
                        .await?;
                }
                SyncAction::DropQueued { key } => {
                    let discarded = self.processor.discard(key).await;
                    if discarded.dropped > 0 {
                        debug!(record = %key, dropped = discarded.dropped, "Discarded losing local mutations");
                    }
                    if discarded.in_flight && outcome.resolution != ConflictResolution::KeepLocal {
                        self.supersede_in_flight(key, outcome.record.as_ref()).await?;
                    }
                }
            }
        }

        persist::append_conflict_log(self.store.as_ref(), &outcome.log_entry).await?;
        Ok(())
    }

    /// Queue the winning remote state behind a losing local mutation that
    /// was already on the wire, so the remote ends up with the winner.
    async fn supersede_in_flight(&self, key: &RecordKey, winner: Option<&Record>) -> Result<()> {
        warn!(record = %key, "Losing local mutation already in flight, re-pushing remote state");
        match winner {
            Some(record) if record.is_active() => {
                self.processor
                    .enqueue(
                        &key.table,
                        &key.record_id,
                        Operation::Update,
                        Some(record.payload.clone()),
                    )
                    .await?;
            }
            _ => {
                self.processor
                    .enqueue(&key.table, &key.record_id, Operation::Delete, None)
                    .await?;
            }
        }
        Ok(())
    }

    fn publish_resolved(&self, outcome: &ResolutionOutcome) {
        self.events.publish(SyncEvent::ConflictResolved {
            conflict_id: outcome.conflict_id.clone(),
            resolution: outcome.resolution,
            resolved_by: outcome.resolved_by,
            table: outcome.log_entry.table_name.clone(),
            record_id: outcome.log_entry.record_id.clone(),
        });
    }
}

fn table_keys(session: &ConflictSession, table: &str) -> Vec<RecordKey> {
    session
        .pending_keys()
        .into_iter()
        .filter(|key| key.table == table)
        .collect()
}
