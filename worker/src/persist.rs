//! Worker bookkeeping stored through the record store.
//!
//! The queue snapshot and the conflict log are opaque records in reserved
//! tables; nothing in sync logic reads the log back.

use waypoint_engine::{ConflictLogEntry, QueueSnapshot, Record, Timestamp};

use crate::error::{Result, StoreError};
use crate::local::RecordStore;

/// Table holding worker state.
pub const SYNC_STATE_TABLE: &str = "_sync_state";
/// Record id of the queue snapshot in [`SYNC_STATE_TABLE`].
pub const QUEUE_RECORD_ID: &str = "queue";
/// Table holding conflict log entries.
pub const CONFLICT_LOG_TABLE: &str = "_conflict_log";

/// Load the persisted queue snapshot, if any.
pub async fn load_queue(store: &dyn RecordStore) -> Result<Option<QueueSnapshot>> {
    match store.get_local(SYNC_STATE_TABLE, QUEUE_RECORD_ID).await? {
        Some(record) if record.is_active() => Ok(Some(QueueSnapshot::from_value(record.payload)?)),
        _ => Ok(None),
    }
}

/// Write the queue snapshot.
pub async fn save_queue(
    store: &dyn RecordStore,
    snapshot: &QueueSnapshot,
    now: Timestamp,
) -> Result<()> {
    let payload = snapshot.to_value()?;
    store
        .put_local(Record::new(QUEUE_RECORD_ID, SYNC_STATE_TABLE, payload, now))
        .await?;
    Ok(())
}

/// Append a conflict log entry.
pub async fn append_conflict_log(store: &dyn RecordStore, entry: &ConflictLogEntry) -> Result<()> {
    let payload = serde_json::to_value(entry).map_err(StoreError::from)?;
    store
        .put_local(Record::new(
            entry.id.clone(),
            CONFLICT_LOG_TABLE,
            payload,
            entry.resolved_at,
        ))
        .await?;
    Ok(())
}
