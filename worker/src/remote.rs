//! Remote store contracts.
//!
//! Every call may fail with [`RemoteError::Transient`] (retried with backoff)
//! or a permanent [`RemoteError::Rejected`] / [`RemoteError::NotFound`].

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use waypoint_engine::{Record, RecordId, Timestamp};

use crate::error::RemoteError;

/// Per-call options passed through to the remote collaborator.
///
/// The processor never cancels a call itself; honoring `timeout` is up to
/// the implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    pub timeout: Duration,
}

/// The server-side copy of the data.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn create_remote(
        &self,
        table: &str,
        id: &str,
        payload: &Value,
        options: &CallOptions,
    ) -> Result<(), RemoteError>;

    async fn update_remote(
        &self,
        table: &str,
        id: &str,
        payload: &Value,
        options: &CallOptions,
    ) -> Result<(), RemoteError>;

    async fn delete_remote(
        &self,
        table: &str,
        id: &str,
        options: &CallOptions,
    ) -> Result<(), RemoteError>;

    /// Current remote versions of the given ids. Missing ids are omitted.
    async fn fetch_remote_snapshot(
        &self,
        table: &str,
        ids: &[RecordId],
        options: &CallOptions,
    ) -> Result<Vec<Record>, RemoteError>;

    /// Ids deleted remotely after `since`.
    async fn list_remote_deleted_since(
        &self,
        table: &str,
        since: Timestamp,
        options: &CallOptions,
    ) -> Result<Vec<RecordId>, RemoteError>;
}

/// Storage for attachment files referenced from record payloads.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload the file at `local_path`, returning its remote key.
    async fn upload(
        &self,
        table: &str,
        record_id: &str,
        local_path: &str,
        options: &CallOptions,
    ) -> Result<String, RemoteError>;
}
