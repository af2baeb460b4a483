//! Local record store contract.

use async_trait::async_trait;
use waypoint_engine::{Record, Timestamp};

use crate::error::StoreError;

/// Device-local persistence for records.
///
/// The worker also keeps its own bookkeeping here (queue snapshot, conflict
/// log) as opaque records in reserved tables.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch one record, tombstones included.
    async fn get_local(&self, table: &str, id: &str) -> Result<Option<Record>, StoreError>;

    /// Insert or replace a record.
    async fn put_local(&self, record: Record) -> Result<(), StoreError>;

    /// Records in `table` modified after `since`, ordered by id.
    async fn list_changed_since(
        &self,
        table: &str,
        since: Timestamp,
    ) -> Result<Vec<Record>, StoreError>;
}
