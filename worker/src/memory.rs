//! In-memory collaborators.
//!
//! Used by the replay binary and by tests. The remote store can be scripted
//! to fail and records every mutating call it receives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use waypoint_engine::{Operation, Record, RecordId, RecordKey, TableName, Timestamp};

use crate::error::{RemoteError, StoreError};
use crate::local::RecordStore;
use crate::now_ms;
use crate::remote::{BlobStore, CallOptions, RemoteStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Record Store
// ============================================================================

/// Record store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: DashMap<RecordKey, Record>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly.
    pub fn insert(&self, record: Record) {
        self.records
            .insert(RecordKey::new(record.table.clone(), record.id.clone()), record);
    }

    /// Fetch a record directly.
    pub fn get(&self, table: &str, id: &str) -> Option<Record> {
        self.records
            .get(&RecordKey::new(table, id))
            .map(|entry| entry.value().clone())
    }

    /// Remove a record outright, leaving no tombstone.
    pub fn remove(&self, table: &str, id: &str) -> Option<Record> {
        self.records
            .remove(&RecordKey::new(table, id))
            .map(|(_, record)| record)
    }

    /// All records of a table, ordered by id.
    pub fn records(&self, table: &str) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .records
            .iter()
            .filter(|entry| entry.key().table == table)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_local(&self, table: &str, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.get(table, id))
    }

    async fn put_local(&self, record: Record) -> Result<(), StoreError> {
        self.insert(record);
        Ok(())
    }

    async fn list_changed_since(
        &self,
        table: &str,
        since: Timestamp,
    ) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .records(table)
            .into_iter()
            .filter(|record| record.updated_at() > since)
            .collect())
    }
}

// ============================================================================
// Remote Store
// ============================================================================

/// One mutating call received by [`MemoryRemoteStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    pub operation: Operation,
    pub table: TableName,
    pub record_id: RecordId,
    pub payload: Option<Value>,
    pub timeout: Duration,
}

/// Remote store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    records: DashMap<RecordKey, Record>,
    deleted: DashMap<RecordKey, Timestamp>,
    failures: Mutex<VecDeque<RemoteError>>,
    calls: Mutex<Vec<RemoteCall>>,
    latency_ms: AtomicU64,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next mutating call fail with `error`. Calls queue up.
    pub fn fail_next(&self, error: RemoteError) {
        lock(&self.failures).push_back(error);
    }

    /// Make the next `count` mutating calls fail with `error`.
    pub fn fail_next_n(&self, count: usize, error: RemoteError) {
        let mut failures = lock(&self.failures);
        failures.extend(std::iter::repeat(error).take(count));
    }

    /// Delay every mutating call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Mutating calls received so far, failed ones included.
    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Current remote version of a record.
    pub fn get(&self, table: &str, id: &str) -> Option<Record> {
        self.records
            .get(&RecordKey::new(table, id))
            .map(|entry| entry.value().clone())
    }

    /// Put a record on the remote as if another device had written it.
    pub fn seed(&self, record: Record) {
        let key = RecordKey::new(record.table.clone(), record.id.clone());
        self.deleted.remove(&key);
        self.records.insert(key, record);
    }

    /// Delete a record as if another device had done it.
    pub fn delete_remotely(&self, table: &str, id: &str, at: Timestamp) {
        let key = RecordKey::new(table, id);
        self.records.remove(&key);
        self.deleted.insert(key, at);
    }

    async fn begin(
        &self,
        operation: Operation,
        table: &str,
        id: &str,
        payload: Option<&Value>,
        options: &CallOptions,
    ) -> Result<(), RemoteError> {
        lock(&self.calls).push(RemoteCall {
            operation,
            table: table.to_string(),
            record_id: id.to_string(),
            payload: payload.cloned(),
            timeout: options.timeout,
        });

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        match lock(&self.failures).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn create_remote(
        &self,
        table: &str,
        id: &str,
        payload: &Value,
        options: &CallOptions,
    ) -> Result<(), RemoteError> {
        self.begin(Operation::Create, table, id, Some(payload), options)
            .await?;

        let key = RecordKey::new(table, id);
        if self.records.contains_key(&key) {
            return Err(RemoteError::Rejected(format!("{} already exists", key)));
        }
        self.deleted.remove(&key);
        self.records
            .insert(key, Record::remote(id, table, payload.clone(), now_ms()));
        Ok(())
    }

    async fn update_remote(
        &self,
        table: &str,
        id: &str,
        payload: &Value,
        options: &CallOptions,
    ) -> Result<(), RemoteError> {
        self.begin(Operation::Update, table, id, Some(payload), options)
            .await?;

        let key = RecordKey::new(table, id);
        match self.records.get_mut(&key) {
            Some(mut record) => {
                let timestamp = now_ms();
                record.payload = payload.clone();
                record.metadata.updated_at = timestamp;
                record.metadata.synced_at = Some(timestamp);
                Ok(())
            }
            None => Err(RemoteError::NotFound(key)),
        }
    }

    async fn delete_remote(
        &self,
        table: &str,
        id: &str,
        options: &CallOptions,
    ) -> Result<(), RemoteError> {
        self.begin(Operation::Delete, table, id, None, options)
            .await?;

        let key = RecordKey::new(table, id);
        match self.records.remove(&key) {
            Some(_) => {
                self.deleted.insert(key, now_ms());
                Ok(())
            }
            None => Err(RemoteError::NotFound(key)),
        }
    }

    async fn fetch_remote_snapshot(
        &self,
        table: &str,
        ids: &[RecordId],
        _options: &CallOptions,
    ) -> Result<Vec<Record>, RemoteError> {
        Ok(ids.iter().filter_map(|id| self.get(table, id)).collect())
    }

    async fn list_remote_deleted_since(
        &self,
        table: &str,
        since: Timestamp,
        _options: &CallOptions,
    ) -> Result<Vec<RecordId>, RemoteError> {
        let mut ids: Vec<RecordId> = self
            .deleted
            .iter()
            .filter(|entry| entry.key().table == table && *entry.value() > since)
            .map(|entry| entry.key().record_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

// ============================================================================
// Blob Store
// ============================================================================

/// Blob store that only remembers what was uploaded.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    uploads: DashMap<String, String>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote key assigned to a local path.
    pub fn key_for(&self, local_path: &str) -> Option<String> {
        self.uploads.get(local_path).map(|entry| entry.value().clone())
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn upload(
        &self,
        table: &str,
        record_id: &str,
        local_path: &str,
        _options: &CallOptions,
    ) -> Result<String, RemoteError> {
        let key = format!("{}/{}/{}", table, record_id, uuid::Uuid::new_v4());
        self.uploads.insert(local_path.to_string(), key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options() -> CallOptions {
        CallOptions {
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn record_store_lists_changes_by_id() {
        let store = MemoryRecordStore::new();
        store.insert(Record::new("b", "entries", json!({}), 2000));
        store.insert(Record::new("a", "entries", json!({}), 3000));
        store.insert(Record::new("c", "entries", json!({}), 500));
        store.insert(Record::new("p", "projects", json!({}), 3000));

        let changed = store.list_changed_since("entries", 1000).await.unwrap();
        let ids: Vec<_> = changed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn remote_crud() {
        let remote = MemoryRemoteStore::new();
        let opts = options();

        remote
            .create_remote("entries", "e1", &json!({"contentText": "a"}), &opts)
            .await
            .unwrap();
        assert!(matches!(
            remote
                .create_remote("entries", "e1", &json!({}), &opts)
                .await,
            Err(RemoteError::Rejected(_))
        ));

        remote
            .update_remote("entries", "e1", &json!({"contentText": "b"}), &opts)
            .await
            .unwrap();
        assert_eq!(remote.get("entries", "e1").unwrap().payload["contentText"], "b");

        remote.delete_remote("entries", "e1", &opts).await.unwrap();
        assert!(remote.get("entries", "e1").is_none());
        assert_eq!(
            remote
                .list_remote_deleted_since("entries", 0, &opts)
                .await
                .unwrap(),
            vec!["e1".to_string()]
        );

        assert_eq!(
            remote.delete_remote("entries", "e1", &opts).await,
            Err(RemoteError::NotFound(RecordKey::new("entries", "e1")))
        );
        assert_eq!(remote.call_count(), 5);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let remote = MemoryRemoteStore::new();
        let opts = options();
        remote.fail_next_n(2, RemoteError::Transient("offline".into()));

        for _ in 0..2 {
            assert!(remote
                .create_remote("entries", "e1", &json!({}), &opts)
                .await
                .unwrap_err()
                .is_retryable());
        }
        remote
            .create_remote("entries", "e1", &json!({}), &opts)
            .await
            .unwrap();

        let calls = remote.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn blob_uploads_get_unique_keys() {
        let blobs = MemoryBlobStore::new();
        let a = blobs
            .upload("entries", "e1", "/tmp/a.jpg", &options())
            .await
            .unwrap();
        let b = blobs
            .upload("entries", "e1", "/tmp/b.jpg", &options())
            .await
            .unwrap();

        assert_ne!(a, b);
        assert!(a.starts_with("entries/e1/"));
        assert_eq!(blobs.key_for("/tmp/a.jpg"), Some(a));
        assert_eq!(blobs.upload_count(), 2);
    }
}
