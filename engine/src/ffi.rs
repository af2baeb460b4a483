//! FFI layer for the mobile shell.
//!
//! This module provides C-compatible functions over the mutation queue and
//! the conflict detector. All structured data crosses the boundary as JSON
//! strings.
//!
//! # Memory Management
//!
//! - Strings returned by `waypoint_*` functions are allocated by Rust
//! - Caller must free them with `waypoint_string_free`
//! - Queue pointers must be freed with `waypoint_queue_free`
//!
//! # Error Handling
//!
//! Functions return JSON with either:
//! - `{"ok": <result>}` on success
//! - `{"error": "<message>"}` on failure

use crate::{
    detect::index_by_id, ConflictDetector, FailureDisposition, MutationQueue, Operation,
    QueueSnapshot, Record, RecordId, RetryPolicy,
};
use serde_json::json;
use std::collections::HashSet;
use std::ffi::{c_char, CStr, CString};
use std::ptr;

/// Result wrapper for FFI responses.
#[derive(serde::Serialize)]
#[serde(untagged)]
enum FfiResult<T: serde::Serialize> {
    Ok { ok: T },
    Err { error: String },
}

impl<T: serde::Serialize> FfiResult<T> {
    fn ok(value: T) -> Self {
        FfiResult::Ok { ok: value }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization failed: {}"}}"#, e))
    }
}

fn ok_string<T: serde::Serialize>(value: T) -> *mut c_char {
    to_c_string(FfiResult::ok(value).to_json())
}

fn err_string(message: impl Into<String>) -> *mut c_char {
    to_c_string(
        FfiResult::<()>::Err {
            error: message.into(),
        }
        .to_json(),
    )
}

/// Convert a Rust string to a C string pointer.
/// Caller must free with `waypoint_string_free`.
fn to_c_string(s: String) -> *mut c_char {
    match CString::new(s) {
        Ok(cs) => cs.into_raw(),
        Err(_) => CString::new(r#"{"error":"string contained null bytes"}"#)
            .unwrap_or_default()
            .into_raw(),
    }
}

/// Convert a C string pointer to a Rust string.
/// Returns None if pointer is null or invalid UTF-8.
unsafe fn from_c_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Parse a JSON argument, mapping failures to an error message.
unsafe fn parse_arg<T: serde::de::DeserializeOwned>(
    ptr: *const c_char,
    name: &str,
) -> Result<T, String> {
    let raw = from_c_string(ptr).ok_or_else(|| format!("invalid {}", name))?;
    serde_json::from_str(&raw).map_err(|e| format!("parse error in {}: {}", name, e))
}

// ============================================================================
// Queue Lifecycle
// ============================================================================

/// Create a new queue.
///
/// # Arguments
/// - `policy_json`: JSON string of RetryPolicy, or null for the defaults
///
/// # Returns
/// Pointer to MutationQueue, or null if the policy does not parse.
///
/// # Safety
/// - `policy_json` must be a valid null-terminated C string or null
/// - Caller must free the returned pointer with `waypoint_queue_free`
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_new(policy_json: *const c_char) -> *mut MutationQueue {
    let policy = if policy_json.is_null() {
        RetryPolicy::default()
    } else {
        match parse_arg::<RetryPolicy>(policy_json, "policy") {
            Ok(p) => p,
            Err(_) => return ptr::null_mut(),
        }
    };

    Box::into_raw(Box::new(MutationQueue::new(policy)))
}

/// Free a queue.
///
/// # Safety
/// - `queue` must be a valid pointer from `waypoint_queue_new`
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_free(queue: *mut MutationQueue) {
    if !queue.is_null() {
        drop(Box::from_raw(queue));
    }
}

/// Free a string allocated by the engine.
///
/// # Safety
/// - `s` must be a valid pointer from a `waypoint_*` function
/// - Must not be called twice on the same pointer
#[no_mangle]
pub unsafe extern "C" fn waypoint_string_free(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

// ============================================================================
// Queue Operations
// ============================================================================

/// Enqueue a mutation.
///
/// # Arguments
/// - `operation`: `"create"`, `"update"` or `"delete"`
/// - `payload_json`: JSON record snapshot, or null for deletes
/// - `now`: Timestamp in milliseconds
///
/// # Returns
/// JSON string: `{"ok": <item id>}` or `{"error": "message"}`
///
/// # Safety
/// - `queue` must be a valid pointer from `waypoint_queue_new` or null
/// - `table`, `record_id` and `operation` must be valid null-terminated C strings
/// - `payload_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `waypoint_string_free`
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_enqueue(
    queue: *mut MutationQueue,
    table: *const c_char,
    record_id: *const c_char,
    operation: *const c_char,
    payload_json: *const c_char,
    now: u64,
) -> *mut c_char {
    let queue = match queue.as_mut() {
        Some(q) => q,
        None => return err_string("null queue pointer"),
    };

    let table = match from_c_string(table) {
        Some(s) => s,
        None => return err_string("invalid table"),
    };

    let record_id = match from_c_string(record_id) {
        Some(s) => s,
        None => return err_string("invalid record id"),
    };

    let operation = match from_c_string(operation).as_deref().and_then(Operation::parse) {
        Some(op) => op,
        None => return err_string("invalid operation"),
    };

    let payload = if payload_json.is_null() {
        None
    } else {
        match parse_arg::<serde_json::Value>(payload_json, "payload") {
            Ok(value) => Some(value),
            Err(e) => return err_string(e),
        }
    };

    match queue.enqueue(table, record_id, operation, payload, now) {
        Ok(id) => ok_string(id),
        Err(e) => err_string(e.to_string()),
    }
}

/// Peek at the next ready item.
///
/// # Returns
/// JSON string: `{"ok": QueueItem}` or `{"ok": null}` or `{"error": "message"}`
///
/// # Safety
/// - `queue` must be a valid pointer from `waypoint_queue_new` or null
/// - Caller must free the returned string with `waypoint_string_free`
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_next_ready(
    queue: *const MutationQueue,
    now: u64,
) -> *mut c_char {
    match queue.as_ref() {
        Some(q) => ok_string(q.next_ready(now)),
        None => err_string("null queue pointer"),
    }
}

/// Claim the next ready item so it is not handed out twice.
///
/// # Returns
/// JSON string: `{"ok": QueueItem}` or `{"ok": null}` or `{"error": "message"}`
///
/// # Safety
/// - `queue` must be a valid pointer from `waypoint_queue_new` or null
/// - Caller must free the returned string with `waypoint_string_free`
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_claim_next(
    queue: *mut MutationQueue,
    now: u64,
) -> *mut c_char {
    match queue.as_mut() {
        Some(q) => ok_string(q.claim_next_ready(now)),
        None => err_string("null queue pointer"),
    }
}

/// Return a claimed item to the queue without counting an attempt.
///
/// # Returns
/// JSON string: `{"ok": null}` or `{"error": "message"}`
///
/// # Safety
/// - `queue` must be a valid pointer from `waypoint_queue_new` or null
/// - Caller must free the returned string with `waypoint_string_free`
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_release(queue: *mut MutationQueue, id: u64) -> *mut c_char {
    match queue.as_mut() {
        Some(q) => match q.release(id) {
            Ok(()) => ok_string(()),
            Err(e) => err_string(e.to_string()),
        },
        None => err_string("null queue pointer"),
    }
}

/// Remove a completed item.
///
/// # Returns
/// 1 if removed, 0 if already absent, -1 on a null queue.
///
/// # Safety
/// - `queue` must be a valid pointer from `waypoint_queue_new` or null
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_mark_complete(queue: *mut MutationQueue, id: u64) -> i32 {
    match queue.as_mut() {
        Some(q) => i32::from(q.mark_complete(id)),
        None => -1,
    }
}

/// Record a failed attempt.
///
/// # Arguments
/// - `jitter_fraction`: random value in `[0, 1]` picking the backoff jitter
///
/// # Returns
/// JSON string: `{"ok": {"permanentlyFailed": bool, "retryAt": n|null}}` or
/// `{"error": "message"}`
///
/// # Safety
/// - `queue` must be a valid pointer from `waypoint_queue_new` or null
/// - `message` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `waypoint_string_free`
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_mark_failed(
    queue: *mut MutationQueue,
    id: u64,
    message: *const c_char,
    now: u64,
    jitter_fraction: f64,
) -> *mut c_char {
    let queue = match queue.as_mut() {
        Some(q) => q,
        None => return err_string("null queue pointer"),
    };

    let message = from_c_string(message).unwrap_or_else(|| "unknown error".to_string());

    match queue.mark_failed(id, message, now, jitter_fraction) {
        Ok(FailureDisposition::RetryScheduled { retry_at }) => {
            ok_string(json!({ "permanentlyFailed": false, "retryAt": retry_at }))
        }
        Ok(FailureDisposition::PermanentlyFailed) => {
            ok_string(json!({ "permanentlyFailed": true, "retryAt": null }))
        }
        Err(e) => err_string(e.to_string()),
    }
}

/// Get aggregate queue counts.
///
/// # Returns
/// JSON string: `{"ok": QueueCounts}` or `{"error": "message"}`
///
/// # Safety
/// - `queue` must be a valid pointer from `waypoint_queue_new` or null
/// - Caller must free the returned string with `waypoint_string_free`
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_counts(queue: *const MutationQueue) -> *mut c_char {
    match queue.as_ref() {
        Some(q) => ok_string(q.counts()),
        None => err_string("null queue pointer"),
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Export queue state as a snapshot.
///
/// # Returns
/// JSON string: `{"ok": QueueSnapshot}` or `{"error": "message"}`
///
/// # Safety
/// - `queue` must be a valid pointer from `waypoint_queue_new` or null
/// - Caller must free the returned string with `waypoint_string_free`
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_export(queue: *const MutationQueue) -> *mut c_char {
    match queue.as_ref() {
        Some(q) => ok_string(q.export_state()),
        None => err_string("null queue pointer"),
    }
}

/// Replace queue state with a snapshot.
///
/// # Returns
/// JSON string: `{"ok": null}` or `{"error": "message"}`
///
/// # Safety
/// - `queue` must be a valid pointer from `waypoint_queue_new` or null
/// - `snapshot_json` must be a valid null-terminated C string or null
/// - Caller must free the returned string with `waypoint_string_free`
#[no_mangle]
pub unsafe extern "C" fn waypoint_queue_import(
    queue: *mut MutationQueue,
    snapshot_json: *const c_char,
) -> *mut c_char {
    let queue = match queue.as_mut() {
        Some(q) => q,
        None => return err_string("null queue pointer"),
    };

    let snapshot = match from_c_string(snapshot_json) {
        Some(s) => match QueueSnapshot::from_json(&s) {
            Ok(snapshot) => snapshot,
            Err(e) => return err_string(e.to_string()),
        },
        None => return err_string("invalid snapshot JSON"),
    };

    match queue.import_state(snapshot) {
        Ok(()) => ok_string(()),
        Err(e) => err_string(e.to_string()),
    }
}

// ============================================================================
// Conflicts
// ============================================================================

/// Detect conflicts between local records and a remote snapshot.
///
/// # Arguments
/// - `local_json`: JSON array of local Records
/// - `remote_json`: JSON array of remote Records
/// - `deleted_json`: JSON array of remote-deleted record ids
///
/// # Returns
/// JSON string: `{"ok": [SyncConflict, ...]}` or `{"error": "message"}`
///
/// # Safety
/// - All string arguments must be valid null-terminated C strings or null
/// - Caller must free the returned string with `waypoint_string_free`
#[no_mangle]
pub unsafe extern "C" fn waypoint_detect_conflicts(
    local_json: *const c_char,
    remote_json: *const c_char,
    deleted_json: *const c_char,
    now: u64,
) -> *mut c_char {
    let local: Vec<Record> = match parse_arg(local_json, "local records") {
        Ok(v) => v,
        Err(e) => return err_string(e),
    };

    let remote: Vec<Record> = match parse_arg(remote_json, "remote records") {
        Ok(v) => v,
        Err(e) => return err_string(e),
    };

    let deleted: HashSet<RecordId> = match parse_arg(deleted_json, "deleted ids") {
        Ok(v) => v,
        Err(e) => return err_string(e),
    };

    let conflicts = ConflictDetector::new().detect(&local, &index_by_id(remote), &deleted, now);
    ok_string(conflicts)
}

// ============================================================================
// Utility
// ============================================================================

/// Get the engine version.
///
/// # Returns
/// Static string pointer (do not free)
#[no_mangle]
pub extern "C" fn waypoint_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

/// Get the snapshot format version.
#[no_mangle]
pub extern "C" fn waypoint_snapshot_format_version() -> u32 {
    crate::SNAPSHOT_FORMAT_VERSION
}
