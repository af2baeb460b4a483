//! # Waypoint Sync
//!
//! The asynchronous half of Waypoint: drives the [`waypoint_engine`] queue
//! and conflict session against real storage.
//!
//! - [`SyncProcessor`] drains the mutation queue in the background, one
//!   item at a time, with backoff, network gating and pause/resume.
//! - [`ConflictCoordinator`] pulls remote state, runs conflict detection,
//!   applies decisions to the local store and feeds follow-up mutations
//!   back into the processor.
//!
//! Storage and transport are collaborator traits ([`RecordStore`],
//! [`RemoteStore`], [`BlobStore`], [`NetworkConditions`]); in-memory versions
//! live in [`memory`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod local;
pub mod memory;
pub mod network;
pub mod persist;
pub mod processor;
pub mod remote;

pub use config::{Config, ConfigError};
pub use coordinator::{CheckSummary, ConflictCoordinator};
pub use error::{RemoteError, Result, StoreError, SyncError};
pub use events::{EventBus, Subscription, SyncEvent, UploadState};
pub use local::RecordStore;
pub use network::{uploads_permitted, NetworkConditions, StaticNetwork};
pub use processor::{Collaborators, Discarded, SyncProcessor};
pub use remote::{BlobStore, CallOptions, RemoteStore};

use waypoint_engine::Timestamp;

/// Wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
