//! Content comparison for record payloads.
//!
//! Two payloads can differ only in bookkeeping fields (timestamps, sync
//! markers, version counters) while carrying the same user content. The
//! [`ContentPolicy`] names those fields so conflict handling can compare the
//! content alone.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Top-level payload fields treated as metadata by default.
pub const DEFAULT_METADATA_FIELDS: &[&str] =
    &["updatedAt", "createdAt", "syncedAt", "lastSyncedAt", "version"];

/// Which payload fields count as content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPolicy {
    /// Top-level fields ignored when comparing or fingerprinting
    pub metadata_fields: BTreeSet<String>,
}

impl Default for ContentPolicy {
    fn default() -> Self {
        Self {
            metadata_fields: DEFAULT_METADATA_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
        }
    }
}

impl ContentPolicy {
    /// A policy that compares every field.
    pub fn strict() -> Self {
        Self {
            metadata_fields: BTreeSet::new(),
        }
    }

    /// Also ignore `field`.
    pub fn ignoring(mut self, field: impl Into<String>) -> Self {
        self.metadata_fields.insert(field.into());
        self
    }

    /// The payload with metadata fields stripped.
    ///
    /// Only top-level object keys are stripped; non-object payloads are
    /// returned as-is.
    pub fn content(&self, payload: &Value) -> Value {
        match payload {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(key, _)| !self.metadata_fields.contains(key.as_str()))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Field-for-field equality of the content of two payloads.
    pub fn content_eq(&self, a: &Value, b: &Value) -> bool {
        self.content(a) == self.content(b)
    }

    /// SHA-256 hex digest of the content fields.
    ///
    /// `serde_json` objects serialize with sorted keys, so equal content
    /// always hashes the same regardless of insertion order.
    pub fn fingerprint(&self, payload: &Value) -> String {
        let canonical = self.content(payload).to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        format!("{:x}", digest)
    }
}
