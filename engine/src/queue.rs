//! Mutation queue - the durable list of outstanding local changes.
//!
//! The queue holds one item per record awaiting remote application. New
//! mutations on a record coalesce into its pending item instead of piling up,
//! so the remote only ever sees the net effect of local edits.
//!
//! # Ordering
//!
//! Items for the same record are handed out strictly in enqueue order. Items
//! for different records have no ordering guarantee beyond "oldest ready item
//! first".
//!
//! # Coalescing
//!
//! | pending item          | new op          | result                          |
//! |-----------------------|-----------------|---------------------------------|
//! | create                | create / update | create with the new payload     |
//! | update                | create / update | update with the new payload     |
//! | create, never tried   | delete          | no-op delete marker             |
//! | create (tried), update| delete          | delete                          |
//! | delete                | create / update | update with the new payload     |
//! | no-op marker          | create / update | create with the new payload     |
//! | delete / no-op marker | delete          | unchanged                       |
//!
//! An item already claimed by the processor is never rewritten: its payload
//! is on the wire, so the new mutation is appended behind it.

use crate::{
    error::Result, Error, Operation, QueueItemId, RecordId, RecordKey, RetryPolicy, TableName,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};

/// One pending outbound mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Unique, monotonically increasing id
    pub id: QueueItemId,
    /// Logical record type
    pub table_name: TableName,
    /// Affected record
    pub record_id: RecordId,
    /// Mutation kind
    pub operation: Operation,
    /// Record snapshot at enqueue time; `None` for deletes
    pub payload: Option<Value>,
    /// Enqueue timestamp
    pub created_at: Timestamp,
    /// Processing attempts so far
    pub attempts: u32,
    /// Most recent attempt
    pub last_attempt_at: Option<Timestamp>,
    /// Last failure reason
    pub error_message: Option<String>,
    /// Jitter added to the current backoff window
    #[serde(default)]
    pub jitter_ms: u64,
    /// A create that was deleted before it ever reached the remote
    #[serde(default)]
    pub noop: bool,
    /// Excluded from processing until retried or superseded
    #[serde(default)]
    pub permanently_failed: bool,
    /// Claimed by the processor
    #[serde(default)]
    pub in_flight: bool,
}

impl QueueItem {
    fn new(
        id: QueueItemId,
        table_name: TableName,
        record_id: RecordId,
        operation: Operation,
        payload: Option<Value>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            table_name,
            record_id,
            operation,
            payload,
            created_at,
            attempts: 0,
            last_attempt_at: None,
            error_message: None,
            jitter_ms: 0,
            noop: false,
            permanently_failed: false,
            in_flight: false,
        }
    }

    /// The record this item targets.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table_name.clone(), self.record_id.clone())
    }

    fn targets(&self, table: &str, record_id: &str) -> bool {
        self.table_name == table && self.record_id == record_id
    }

    /// When the current backoff window ends; `None` if never attempted.
    pub fn retry_at(&self, policy: &RetryPolicy) -> Option<Timestamp> {
        self.last_attempt_at.map(|last| {
            last.saturating_add(policy.delay_ms(self.attempts))
                .saturating_add(self.jitter_ms)
        })
    }

    /// Whether the backoff window has elapsed at `now`.
    pub fn backoff_elapsed(&self, now: Timestamp, policy: &RetryPolicy) -> bool {
        self.retry_at(policy).map_or(true, |at| now >= at)
    }

    fn reset_attempts(&mut self) {
        self.attempts = 0;
        self.last_attempt_at = None;
        self.error_message = None;
        self.jitter_ms = 0;
        self.permanently_failed = false;
    }

    fn replace_operation(&mut self, operation: Operation, payload: Option<Value>) {
        self.operation = operation;
        self.payload = payload;
        self.noop = false;
        self.reset_attempts();
    }

    /// Fold a new mutation into this (not in-flight) item.
    fn coalesce(&mut self, operation: Operation, payload: Option<Value>) {
        if self.permanently_failed {
            // The user changed the record again; give it a fresh start.
            self.reset_attempts();
        }

        match (self.operation, self.noop, operation) {
            (Operation::Delete, true, Operation::Create | Operation::Update) => {
                self.replace_operation(Operation::Create, payload);
            }
            (Operation::Create | Operation::Update, _, Operation::Create | Operation::Update) => {
                self.payload = payload;
            }
            (Operation::Delete, false, Operation::Create | Operation::Update) => {
                self.replace_operation(Operation::Update, payload);
            }
            (Operation::Create, _, Operation::Delete) if self.attempts == 0 => {
                self.replace_operation(Operation::Delete, None);
                self.noop = true;
            }
            (Operation::Create | Operation::Update, _, Operation::Delete) => {
                self.replace_operation(Operation::Delete, None);
            }
            (Operation::Delete, _, Operation::Delete) => {}
        }
    }
}

/// What happened to an item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// The item stays queued and becomes ready again at `retry_at`
    RetryScheduled { retry_at: Timestamp },
    /// The retry ceiling was exceeded or the remote rejected the item
    PermanentlyFailed,
}

/// Aggregate counts derived from the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    /// Items still to be applied (including in-flight and held items)
    pub pending: usize,
    /// Items that failed permanently
    pub failed: usize,
    /// Items currently claimed by the processor
    pub in_flight: usize,
    /// Pending items whose record is held for conflict resolution
    pub held: usize,
}

/// The mutation queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationQueue {
    /// Backoff and retry ceiling
    policy: RetryPolicy,
    /// Items in enqueue order
    items: Vec<QueueItem>,
    /// Records excluded from processing
    holds: BTreeSet<RecordKey>,
    /// Next item id
    next_id: QueueItemId,
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl MutationQueue {
    /// Create an empty queue.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            items: Vec::new(),
            holds: BTreeSet::new(),
            next_id: 1,
        }
    }

    /// Get the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Replace the retry policy. Existing backoff windows are recomputed.
    pub fn set_policy(&mut self, policy: RetryPolicy) {
        self.policy = policy;
    }

    /// Append or coalesce a mutation. Returns the id of the item that now
    /// carries it.
    pub fn enqueue(
        &mut self,
        table: impl Into<TableName>,
        record_id: impl Into<RecordId>,
        operation: Operation,
        payload: Option<Value>,
        now: Timestamp,
    ) -> Result<QueueItemId> {
        let table = table.into();
        let record_id = record_id.into();

        if operation.requires_payload() && payload.is_none() {
            return Err(Error::MissingPayload {
                operation: operation.to_string(),
                record_id,
            });
        }
        let payload = if operation.requires_payload() {
            payload
        } else {
            None
        };

        // Coalesce into the newest item for this record unless it is on the wire
        if let Some(existing) = self
            .items
            .iter_mut()
            .rev()
            .find(|item| item.targets(&table, &record_id))
        {
            if !existing.in_flight {
                existing.coalesce(operation, payload);
                return Ok(existing.id);
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.items.push(QueueItem::new(
            id, table, record_id, operation, payload, now,
        ));
        Ok(id)
    }

    /// The oldest item that may be processed at `now`.
    ///
    /// An item is ready when it is the oldest item for its record, is not
    /// claimed, failed or held, and its backoff window has elapsed.
    pub fn next_ready(&self, now: Timestamp) -> Option<&QueueItem> {
        self.heads()
            .filter(|item| self.is_claimable(item) && item.backoff_elapsed(now, &self.policy))
            .min_by_key(|item| (item.created_at, item.id))
    }

    /// Like [`next_ready`](Self::next_ready), but marks the item in flight.
    pub fn claim_next_ready(&mut self, now: Timestamp) -> Option<QueueItem> {
        let id = self.next_ready(now)?.id;
        let item = self.get_mut(id)?;
        item.in_flight = true;
        Some(item.clone())
    }

    /// Return a claimed item to the queue without counting an attempt.
    pub fn release(&mut self, id: QueueItemId) -> Result<()> {
        let item = self.get_mut(id).ok_or(Error::QueueItemNotFound(id))?;
        item.in_flight = false;
        Ok(())
    }

    /// Remove an item. Returns `false` if it was already gone.
    pub fn mark_complete(&mut self, id: QueueItemId) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        self.items.len() != before
    }

    /// Record a failed attempt.
    ///
    /// `jitter_fraction` in `[0, 1]` picks the jitter for the next backoff
    /// window. The item is permanently failed once the retry ceiling is
    /// exceeded.
    pub fn mark_failed(
        &mut self,
        id: QueueItemId,
        error_message: impl Into<String>,
        now: Timestamp,
        jitter_fraction: f64,
    ) -> Result<FailureDisposition> {
        let policy = self.policy;
        let item = self.get_mut(id).ok_or(Error::QueueItemNotFound(id))?;

        item.in_flight = false;
        item.attempts = item.attempts.saturating_add(1);
        item.last_attempt_at = Some(now);
        item.error_message = Some(error_message.into());

        if policy.is_exhausted(item.attempts) {
            item.permanently_failed = true;
            item.jitter_ms = 0;
            return Ok(FailureDisposition::PermanentlyFailed);
        }

        item.jitter_ms = policy.jitter_ms(policy.delay_ms(item.attempts), jitter_fraction);
        let retry_at = item.retry_at(&policy).unwrap_or(now);
        Ok(FailureDisposition::RetryScheduled { retry_at })
    }

    /// Record a non-retryable failure: the item is permanently failed at once.
    pub fn mark_rejected(
        &mut self,
        id: QueueItemId,
        error_message: impl Into<String>,
        now: Timestamp,
    ) -> Result<()> {
        let item = self.get_mut(id).ok_or(Error::QueueItemNotFound(id))?;
        item.in_flight = false;
        item.attempts = item.attempts.saturating_add(1);
        item.last_attempt_at = Some(now);
        item.error_message = Some(error_message.into());
        item.jitter_ms = 0;
        item.permanently_failed = true;
        Ok(())
    }

    /// Re-arm a permanently failed item with a clean attempt count.
    pub fn retry_failed(&mut self, id: QueueItemId) -> Result<()> {
        let item = self.get_mut(id).ok_or(Error::QueueItemNotFound(id))?;
        item.reset_attempts();
        Ok(())
    }

    /// Re-arm every permanently failed item. Returns how many were re-armed.
    pub fn retry_all_failed(&mut self) -> usize {
        let mut count = 0;
        for item in self.items.iter_mut().filter(|i| i.permanently_failed) {
            item.reset_attempts();
            count += 1;
        }
        count
    }

    /// Drop every queued item for a record that is not on the wire.
    /// Returns how many were removed.
    pub fn discard(&mut self, key: &RecordKey) -> usize {
        let before = self.items.len();
        self.items
            .retain(|item| item.in_flight || !item.targets(&key.table, &key.record_id));
        before - self.items.len()
    }

    /// Keep a record's items out of processing (e.g. while a conflict on it
    /// awaits the user). Returns `false` if already held.
    pub fn hold(&mut self, key: RecordKey) -> bool {
        self.holds.insert(key)
    }

    /// Release a held record. Returns `false` if it was not held.
    pub fn unhold(&mut self, key: &RecordKey) -> bool {
        self.holds.remove(key)
    }

    /// Check whether a record is held.
    pub fn is_held(&self, key: &RecordKey) -> bool {
        self.holds.contains(key)
    }

    /// Earliest time a waiting item becomes ready.
    ///
    /// Ignores claimed, failed and held items; `None` when nothing is waiting
    /// on a backoff window.
    pub fn next_retry_at(&self) -> Option<Timestamp> {
        self.heads()
            .filter(|item| self.is_claimable(item))
            .filter_map(|item| item.retry_at(&self.policy))
            .min()
    }

    /// Whether any item could still be processed now or after a backoff.
    pub fn has_runnable(&self) -> bool {
        self.heads().any(|item| self.is_claimable(item))
    }

    /// Get an item by id.
    pub fn get(&self, id: QueueItemId) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.id == id)
    }

    fn get_mut(&mut self, id: QueueItemId) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| item.id == id)
    }

    /// All items in enqueue order.
    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    /// Items for one record, oldest first.
    pub fn items_for<'a>(
        &'a self,
        table: &'a str,
        record_id: &'a str,
    ) -> impl Iterator<Item = &'a QueueItem> + 'a {
        self.items
            .iter()
            .filter(move |item| item.targets(table, record_id))
    }

    /// Permanently failed items.
    pub fn failed_items(&self) -> impl Iterator<Item = &QueueItem> {
        self.items.iter().filter(|item| item.permanently_failed)
    }

    /// Number of items, failed ones included.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Aggregate counts.
    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for item in &self.items {
            if item.permanently_failed {
                counts.failed += 1;
                continue;
            }
            counts.pending += 1;
            if item.in_flight {
                counts.in_flight += 1;
            }
            if self.holds.contains(&item.key()) {
                counts.held += 1;
            }
        }
        counts
    }

    /// Export the queue as a snapshot.
    pub fn export_state(&self) -> crate::snapshot::QueueSnapshot {
        let mut snapshot = crate::snapshot::QueueSnapshot::new(self.policy);
        snapshot.next_id = self.next_id;
        snapshot.items = self.items.clone();
        snapshot.holds = self.holds.iter().cloned().collect();
        snapshot
    }

    /// Replace the queue contents with a snapshot.
    ///
    /// Claims do not survive a restart: items that were in flight become
    /// ready again. The queue keeps its own retry policy.
    pub fn import_state(&mut self, snapshot: crate::snapshot::QueueSnapshot) -> Result<()> {
        snapshot.validate()?;

        self.items = snapshot.items;
        for item in &mut self.items {
            item.in_flight = false;
        }
        self.holds = snapshot.holds.into_iter().collect();
        let max_id = self.items.iter().map(|item| item.id).max().unwrap_or(0);
        self.next_id = snapshot.next_id.max(max_id + 1);
        Ok(())
    }

    /// The oldest item of every record.
    fn heads<'a>(&'a self) -> impl Iterator<Item = &'a QueueItem> + 'a {
        let mut seen: HashSet<(&'a str, &'a str)> = HashSet::new();
        self.items.iter().filter(move |item| {
            let item: &'a QueueItem = item;
            seen.insert((item.table_name.as_str(), item.record_id.as_str()))
        })
    }

    fn is_claimable(&self, item: &QueueItem) -> bool {
        !item.in_flight && !item.permanently_failed && !self.holds.contains(&item.key())
    }
}
