//! Operation types for expressing changes.
//!
//! Local changes are queued as operations against a record, not pushed as
//! direct mutations. This enables offline-first behavior: the queue keeps the
//! operation until the remote store has accepted it.

use crate::{RecordId, TableName};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of mutation a queue item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Whether this operation needs a payload snapshot.
    pub fn requires_payload(&self) -> bool {
        !matches!(self, Operation::Delete)
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Parse a lowercase operation name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a logical record: the table it lives in plus its id.
///
/// Ordered by (table, record_id) so collections keyed by it iterate
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    /// Logical record type, e.g. "entries" or "projects"
    pub table: TableName,
    /// Record ID within the table
    pub record_id: RecordId,
}

impl RecordKey {
    /// Create a new record key.
    pub fn new(table: impl Into<TableName>, record_id: impl Into<RecordId>) -> Self {
        Self {
            table: table.into(),
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_names() {
        assert_eq!(Operation::Create.to_string(), "create");
        assert_eq!(Operation::Update.to_string(), "update");
        assert_eq!(Operation::Delete.to_string(), "delete");
    }

    #[test]
    fn operation_serialization() {
        let json = serde_json::to_string(&Operation::Delete).unwrap();
        assert_eq!(json, "\"delete\"");

        let parsed: Operation = serde_json::from_str("\"update\"").unwrap();
        assert_eq!(parsed, Operation::Update);
    }

    #[test]
    fn parse_names() {
        assert_eq!(Operation::parse("create"), Some(Operation::Create));
        assert_eq!(Operation::parse("delete"), Some(Operation::Delete));
        assert_eq!(Operation::parse("Delete"), None);
        assert_eq!(Operation::parse("upsert"), None);
    }

    #[test]
    fn payload_requirement() {
        assert!(Operation::Create.requires_payload());
        assert!(Operation::Update.requires_payload());
        assert!(!Operation::Delete.requires_payload());
    }

    #[test]
    fn record_key_ordering() {
        let a = RecordKey::new("entries", "e2");
        let b = RecordKey::new("entries", "e10");
        let c = RecordKey::new("projects", "p1");

        // Lexicographic within a table, tables first
        assert!(b < a);
        assert!(a < c);
        assert_eq!(a.to_string(), "entries/e2");
    }
}
