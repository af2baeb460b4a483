//! # Waypoint Engine
//!
//! A deterministic mutation queue and conflict engine for local-first
//! applications.
//!
//! This crate provides the core logic for pushing offline edits to a remote
//! store. It tracks outstanding local mutations, detects records that changed
//! on both sides, and turns a conflict plus a decision into one authoritative
//! record - with guaranteed determinism, the same inputs always produce the
//! same outputs.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or platform
//! - **Deterministic**: Time and jitter are inputs, never read from the system
//! - **Testable**: Pure logic, no mocks needed
//! - **Portable**: Runs anywhere Rust runs (native, mobile via FFI, WASM)
//!
//! ## Core Concepts
//!
//! ### Mutation Queue
//!
//! Every local change becomes a [`QueueItem`] in the [`MutationQueue`]:
//! - At most one pending item per record; later edits coalesce into it
//! - Strict FIFO per record, no ordering across records
//! - Failed items back off exponentially (see [`RetryPolicy`]) and become
//!   permanently failed after too many attempts
//!
//! ### Conflicts
//!
//! The [`ConflictDetector`] compares local records against a remote snapshot:
//! - [`ConflictType::ConcurrentEdit`] - both sides changed since last sync
//! - [`ConflictType::DeleteEdit`] - remote deleted what local edited
//!
//! The [`ConflictResolver`] auto-resolves the safe cases and applies
//! [`ConflictResolution`] decisions, writing a [`ConflictLogEntry`] each time.
//! The [`ConflictSession`] walks the user through the rest one at a time.
//!
//! ## Quick Start
//!
//! ```rust
//! use waypoint_engine::{MutationQueue, Operation, RetryPolicy};
//! use serde_json::json;
//!
//! let mut queue = MutationQueue::new(RetryPolicy::default());
//!
//! // An entry is created offline, then edited twice
//! queue.enqueue("entries", "e1", Operation::Create, Some(json!({"contentText": "a"})), 1000).unwrap();
//! queue.enqueue("entries", "e1", Operation::Update, Some(json!({"contentText": "b"})), 2000).unwrap();
//! queue.enqueue("entries", "e1", Operation::Update, Some(json!({"contentText": "c"})), 3000).unwrap();
//!
//! // Still a single create, carrying the latest payload
//! let item = queue.next_ready(4000).unwrap();
//! assert_eq!(item.operation, Operation::Create);
//! assert_eq!(item.payload, Some(json!({"contentText": "c"})));
//!
//! let id = item.id;
//! queue.mark_complete(id);
//! assert!(queue.is_empty());
//! ```
//!
//! ## FFI
//!
//! The [`ffi`] module provides C-compatible functions for use from the mobile
//! shell. All data is exchanged as JSON strings.
//!
//! ## Persistence
//!
//! Use [`MutationQueue::export_state`] and [`MutationQueue::import_state`]
//! with [`QueueSnapshot`] to persist the queue across app restarts.

pub mod backoff;
pub mod content;
pub mod detect;
pub mod error;
pub mod ffi;
pub mod operation;
pub mod queue;
pub mod record;
pub mod resolve;
pub mod session;
pub mod snapshot;

// Re-export main types at crate root
pub use backoff::RetryPolicy;
pub use content::ContentPolicy;
pub use detect::{ConflictDetector, ConflictType, SyncConflict};
pub use error::Error;
pub use operation::{Operation, RecordKey};
pub use queue::{FailureDisposition, MutationQueue, QueueCounts, QueueItem};
pub use record::{Metadata, Origin, Record};
pub use resolve::{
    AutoResolved, ConflictLog, ConflictLogEntry, ConflictResolution, ConflictResolver,
    ResolutionOutcome, ResolvedBy, SyncAction,
};
pub use session::{ConflictSession, SessionStatus};
pub use snapshot::{QueueSnapshot, SNAPSHOT_FORMAT_VERSION};

/// Type aliases for clarity
pub type RecordId = String;
pub type TableName = String;
pub type QueueItemId = u64;
pub type ConflictId = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
