//! Edge case tests for waypoint-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use std::collections::{HashMap, HashSet};

use serde_json::json;
use waypoint_engine::{
    detect::index_by_id, ConflictDetector, ConflictResolution, ConflictSession, ConflictType,
    ContentPolicy, Error, FailureDisposition, MutationQueue, Operation, Origin, QueueSnapshot,
    Record, RecordKey, RetryPolicy, SyncAction,
};

fn entry(text: &str) -> Option<serde_json::Value> {
    Some(json!({ "contentText": text }))
}

/// A record that synced at 500 and was then edited locally at 1000.
fn edited_local(id: &str, text: &str) -> Record {
    let mut record = Record::new(id, "entries", json!({"contentText": "base"}), 500);
    record.mark_synced(&ContentPolicy::default());
    record.update_payload(json!({ "contentText": text }), 1000, Origin::Local);
    record
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn unicode_record_ids() {
    let mut queue = MutationQueue::default();
    let ids = ["日本語", "Привет", "🎉🚀", "with space", "a/b\\c", ""];

    for (i, id) in ids.iter().enumerate() {
        queue
            .enqueue("entries", *id, Operation::Update, entry("x"), i as u64)
            .unwrap();
    }

    assert_eq!(queue.len(), ids.len());
    for id in ids {
        assert_eq!(queue.items_for("entries", id).count(), 1);
    }
}

#[test]
fn very_large_payload() {
    let mut queue = MutationQueue::default();
    let big = "x".repeat(1_000_000);
    queue
        .enqueue("entries", "e1", Operation::Create, entry(&big), 1000)
        .unwrap();

    let json = queue.export_state().to_json().unwrap();
    let restored = QueueSnapshot::from_json(&json).unwrap();
    assert_eq!(
        restored.items[0].payload.as_ref().unwrap()["contentText"]
            .as_str()
            .unwrap()
            .len(),
        1_000_000
    );
}

#[test]
fn same_record_id_in_different_tables() {
    let mut queue = MutationQueue::default();
    queue
        .enqueue("entries", "shared", Operation::Create, entry("a"), 1000)
        .unwrap();
    queue
        .enqueue("projects", "shared", Operation::Delete, None, 2000)
        .unwrap();

    // No coalescing across tables
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.items()[0].operation, Operation::Create);
    assert!(!queue.items()[0].noop);
}

// ============================================================================
// Backoff Edge Cases
// ============================================================================

#[test]
fn timestamps_near_u64_max() {
    let mut queue = MutationQueue::new(RetryPolicy::new(1000, 60_000, 10));
    let id = queue
        .enqueue("entries", "e1", Operation::Update, entry("a"), u64::MAX - 10)
        .unwrap();

    queue.claim_next_ready(u64::MAX - 10).unwrap();
    let disposition = queue.mark_failed(id, "timeout", u64::MAX - 5, 1.0).unwrap();

    // Saturates instead of wrapping around to a time in the past
    assert_eq!(
        disposition,
        FailureDisposition::RetryScheduled { retry_at: u64::MAX }
    );
    assert!(queue.next_ready(u64::MAX - 1).is_none());
    assert!(queue.next_ready(u64::MAX).is_some());
}

#[test]
fn zero_retry_ceiling() {
    let mut queue = MutationQueue::new(RetryPolicy::new(1000, 60_000, 0));
    let id = queue
        .enqueue("entries", "e1", Operation::Update, entry("a"), 0)
        .unwrap();

    let disposition = queue.mark_failed(id, "timeout", 0, 0.5).unwrap();
    assert_eq!(disposition, FailureDisposition::PermanentlyFailed);
    assert_eq!(queue.counts().failed, 1);
    assert_eq!(queue.counts().pending, 0);
}

#[test]
fn zero_base_delay_retries_immediately() {
    let mut queue = MutationQueue::new(RetryPolicy::new(0, 0, 3));
    let id = queue
        .enqueue("entries", "e1", Operation::Update, entry("a"), 0)
        .unwrap();

    queue.mark_failed(id, "timeout", 100, 1.0).unwrap();
    assert_eq!(queue.next_ready(100).map(|i| i.id), Some(id));
}

#[test]
fn many_failures_stay_capped() {
    let policy = RetryPolicy::new(1000, 60_000, 1000);
    let mut queue = MutationQueue::new(policy);
    let id = queue
        .enqueue("entries", "e1", Operation::Update, entry("a"), 0)
        .unwrap();

    let mut now = 0;
    for _ in 0..200 {
        match queue.mark_failed(id, "timeout", now, 1.0).unwrap() {
            FailureDisposition::RetryScheduled { retry_at } => {
                assert!(retry_at - now <= 60_000 + policy.max_jitter_ms(60_000));
                now = retry_at;
            }
            FailureDisposition::PermanentlyFailed => panic!("ceiling is 1000"),
        }
    }
}

// ============================================================================
// Coalescing Edge Cases
// ============================================================================

#[test]
fn delete_then_recreate_while_create_pending() {
    let mut queue = MutationQueue::default();
    queue
        .enqueue("entries", "e1", Operation::Create, entry("a"), 1000)
        .unwrap();
    queue
        .enqueue("entries", "e1", Operation::Delete, None, 1001)
        .unwrap();

    // Net zero: a single no-op delete marker
    assert_eq!(queue.len(), 1);
    let item = &queue.items()[0];
    assert_eq!(item.operation, Operation::Delete);
    assert!(item.noop);

    queue
        .enqueue("entries", "e1", Operation::Create, entry("b"), 1002)
        .unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.items()[0].operation, Operation::Create);
    assert_eq!(queue.items()[0].payload, entry("b"));
}

#[test]
fn rapid_updates_same_record() {
    let mut queue = MutationQueue::default();
    let first = queue
        .enqueue("entries", "e1", Operation::Update, entry("0"), 0)
        .unwrap();

    for i in 1..1000u64 {
        let id = queue
            .enqueue("entries", "e1", Operation::Update, entry(&i.to_string()), i)
            .unwrap();
        assert_eq!(id, first);
    }

    assert_eq!(queue.len(), 1);
    assert_eq!(queue.items()[0].payload, entry("999"));
    // Position is kept
    assert_eq!(queue.items()[0].created_at, 0);
}

#[test]
fn update_does_not_reset_attempts() {
    let mut queue = MutationQueue::default();
    let id = queue
        .enqueue("entries", "e1", Operation::Update, entry("a"), 0)
        .unwrap();
    queue.mark_failed(id, "timeout", 100, 0.0).unwrap();

    queue
        .enqueue("entries", "e1", Operation::Update, entry("b"), 200)
        .unwrap();
    assert_eq!(queue.get(id).unwrap().attempts, 1);
}

// ============================================================================
// Snapshot Edge Cases
// ============================================================================

#[test]
fn snapshot_empty_queue() {
    let queue = MutationQueue::default();
    let snapshot = queue.export_state();
    assert!(snapshot.items.is_empty());

    let mut restored = MutationQueue::default();
    restored.import_state(snapshot).unwrap();
    assert!(restored.is_empty());
}

#[test]
fn snapshot_preserves_holds_and_failures() {
    let mut queue = MutationQueue::new(RetryPolicy::new(1000, 60_000, 0));
    let id = queue
        .enqueue("entries", "e1", Operation::Update, entry("a"), 0)
        .unwrap();
    queue.mark_failed(id, "rejected", 10, 0.0).unwrap();
    queue.hold(RecordKey::new("entries", "e2"));

    let json = queue.export_state().to_json().unwrap();
    let mut restored = MutationQueue::default();
    restored
        .import_state(QueueSnapshot::from_json(&json).unwrap())
        .unwrap();

    assert_eq!(restored.counts().failed, 1);
    assert!(restored.is_held(&RecordKey::new("entries", "e2")));

    // Ids keep increasing after a restore
    let next = restored
        .enqueue("entries", "e3", Operation::Update, entry("c"), 20)
        .unwrap();
    assert!(next > id);
}

#[test]
fn snapshot_without_optional_fields() {
    let json = r#"{
        "formatVersion": 1,
        "policy": {"baseDelayMs": 1000, "maxDelayMs": 60000, "maxRetries": 5, "jitterRatio": 0.2},
        "nextId": 3,
        "items": [{
            "id": 2,
            "tableName": "entries",
            "recordId": "e1",
            "operation": "update",
            "payload": {"contentText": "x"},
            "createdAt": 1000,
            "attempts": 0,
            "lastAttemptAt": null,
            "errorMessage": null
        }]
    }"#;

    let snapshot = QueueSnapshot::from_json(json).unwrap();
    assert!(snapshot.holds.is_empty());
    assert!(!snapshot.items[0].in_flight);

    let mut queue = MutationQueue::default();
    queue.import_state(snapshot).unwrap();
    assert_eq!(queue.next_ready(1000).unwrap().id, 2);
}

// ============================================================================
// Conflict Edge Cases
// ============================================================================

#[test]
fn detector_ignores_unknown_remote_records() {
    let detector = ConflictDetector::new();
    let remote = index_by_id([Record::remote(
        "other",
        "entries",
        json!({"contentText": "r"}),
        2000,
    )]);

    let conflicts = detector.detect(&[edited_local("E1", "l")], &remote, &HashSet::new(), 3000);
    assert!(conflicts.is_empty());
}

#[test]
fn delete_wins_over_concurrent_edit_classification() {
    // Deleted set and remote map both mention E1: the delete is authoritative
    let detector = ConflictDetector::new();
    let remote = index_by_id([Record::remote(
        "E1",
        "entries",
        json!({"contentText": "r"}),
        2000,
    )]);
    let deleted: HashSet<_> = ["E1".to_string()].into();

    let conflicts = detector.detect(&[edited_local("E1", "l")], &remote, &deleted, 3000);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::DeleteEdit);
}

#[test]
fn nested_metadata_fields_count_as_content() {
    // Only top-level metadata keys are ignored
    let mut session = ConflictSession::default();
    let mut local = Record::new("E1", "entries", json!({"body": {"updatedAt": 1}}), 500);
    local.mark_synced(&ContentPolicy::default());
    local.update_payload(json!({"body": {"updatedAt": 2}}), 1000, Origin::Local);
    let remote = index_by_id([Record::remote(
        "E1",
        "entries",
        json!({"body": {"updatedAt": 3}}),
        2000,
    )]);

    let result = session.check_for_conflicts(&[local], &remote, &HashSet::new(), 3000);
    assert_eq!(result.needs_user_input.len(), 1);
}

#[test]
fn keep_both_rewrites_embedded_id() {
    let mut session = ConflictSession::default();
    let mut local = Record::new("E1", "entries", json!({"id": "E1", "contentText": "base"}), 500);
    local.mark_synced(&ContentPolicy::default());
    local.update_payload(json!({"id": "E1", "contentText": "mine"}), 1000, Origin::Local);
    let remote = index_by_id([Record::remote(
        "E1",
        "entries",
        json!({"id": "E1", "contentText": "theirs"}),
        2000,
    )]);

    session.check_for_conflicts(&[local], &remote, &HashSet::new(), 3000);
    let outcome = session
        .resolve_conflict(ConflictResolution::KeepBoth, 4000)
        .unwrap();

    let copy = outcome.duplicate.unwrap();
    assert_eq!(copy.payload["id"], copy.id.as_str());
    assert_eq!(copy.payload["contentText"], "mine");
    assert!(outcome
        .actions
        .iter()
        .any(|a| matches!(a, SyncAction::PushCreate { record } if record.id == copy.id)));
}

#[test]
fn resolving_empty_session() {
    let mut session = ConflictSession::default();
    let result = session.check_for_conflicts(&[], &HashMap::new(), &HashSet::new(), 0);

    assert!(result.resolved.is_empty());
    assert!(result.needs_user_input.is_empty());
    assert_eq!(
        session.resolve_conflict(ConflictResolution::KeepLocal, 0),
        Err(Error::NoConflictToResolve)
    );
    assert!(session.skip_current_conflict().is_none());
}

// ============================================================================
// ID Edge Cases
// ============================================================================

#[test]
fn ids_with_separator_characters() {
    // Conflict ids join table, record id and time with ':'
    let detector = ConflictDetector::new();
    let remote = index_by_id([Record::remote(
        "a:b",
        "entries",
        json!({"contentText": "r"}),
        2000,
    )]);

    let conflicts = detector.detect(&[edited_local("a:b", "l")], &remote, &HashSet::new(), 7);
    assert_eq!(conflicts[0].id, "entries:a:b:7");
    assert_eq!(conflicts[0].record_id, "a:b");
}
