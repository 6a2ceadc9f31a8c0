//! Oplog entry representation.
//!
//! This module defines the types a raw oplog record is parsed into before it
//! flows through the relay pipeline. One raw record can expand into zero, one,
//! or many [`OplogEntry`] values: index-metadata and no-op records expand to
//! zero, plain mutations to one, and transaction `applyOps` commands to one
//! entry per sub-operation.
//!
//! # Example
//!
//! ```rust
//! use oplog_relay_core::entry::{Namespace, OperationKind};
//!
//! let ns = Namespace::parse("tests.Foo");
//! assert_eq!(ns.database, "tests");
//! assert_eq!(ns.collection, "Foo");
//! assert_eq!(OperationKind::Remove.event_code(), "r");
//! ```

use crate::position::LogPosition;
use bson::{Bson, Document, Timestamp};
use serde::Deserialize;
use tracing::{debug, error};

/// The kind of mutation an oplog entry describes.
///
/// Command records (`op: "c"`) are not represented here: they are either
/// dropped or expanded into their constituent mutations during flattening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// A document was inserted.
    Insert,

    /// A document was updated in place.
    Update,

    /// A document was removed.
    Remove,
}

impl OperationKind {
    /// Parses the single-character oplog operation code.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "i" => Some(Self::Insert),
            "u" => Some(Self::Update),
            "d" => Some(Self::Remove),
            _ => None,
        }
    }

    /// The oplog wire code for this operation.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Insert => "i",
            Self::Update => "u",
            Self::Remove => "d",
        }
    }

    /// The event code used in outbound messages.
    ///
    /// Removes are reported as `"r"`; inserts and updates pass their oplog
    /// code through.
    #[must_use]
    pub fn event_code(self) -> &'static str {
        match self {
            Self::Remove => "r",
            other => other.code(),
        }
    }
}

/// MongoDB namespace (database + collection).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// Database name.
    pub database: String,

    /// Collection name (may be empty for database-level records).
    pub collection: String,
}

impl Namespace {
    /// Creates a namespace from database and collection names.
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Splits a `database.collection` string into a namespace.
    ///
    /// Only the first `.` separates the parts; collection names may contain
    /// further dots.
    #[must_use]
    pub fn parse(namespace: &str) -> Self {
        match namespace.split_once('.') {
            Some((db, coll)) => Self::new(db, coll),
            None => Self::new(namespace, ""),
        }
    }

    /// Returns the fully qualified `database.collection` form.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// One logical database mutation, parsed from a raw oplog record.
///
/// Immutable after creation; consumed exactly once by the entry processor.
#[derive(Debug, Clone)]
pub struct OplogEntry {
    /// The mutation kind.
    pub operation: OperationKind,

    /// Where the mutation happened.
    pub namespace: Namespace,

    /// The `_id` of the affected document. Only string and ObjectId values
    /// are publishable; the processor rejects anything else per entry.
    pub doc_id: Bson,

    /// Raw mutation payload (the oplog `o` field).
    pub data: Document,

    /// Position of the outer oplog record this entry came from.
    pub position: LogPosition,

    /// In-transaction sequence index. Entries flattened out of one
    /// `applyOps` record share a position and are ordered by this index.
    pub tx_idx: u32,
}

impl OplogEntry {
    /// Returns true if this entry is an insert.
    #[inline]
    #[must_use]
    pub fn is_insert(&self) -> bool {
        self.operation == OperationKind::Insert
    }

    /// Returns true if this entry is an update.
    #[inline]
    #[must_use]
    pub fn is_update(&self) -> bool {
        self.operation == OperationKind::Update
    }

    /// Returns true if this entry is a remove.
    #[inline]
    #[must_use]
    pub fn is_remove(&self) -> bool {
        self.operation == OperationKind::Remove
    }
}

/// Raw oplog record as stored in `local.oplog.rs`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawOplogEntry {
    /// Oplog timestamp. Absent on `applyOps` sub-operations, which inherit
    /// the outer record's timestamp.
    #[serde(rename = "ts")]
    pub timestamp: Option<Timestamp>,

    /// Single-character operation code (`i`/`u`/`d`/`c`/`n`).
    #[serde(rename = "op", default)]
    pub operation: String,

    /// `database.collection` the record targets.
    #[serde(rename = "ns", default)]
    pub namespace: String,

    /// Mutation payload. For updates this is the update description; for
    /// inserts the full document; for removes the id; for commands the
    /// command document.
    #[serde(rename = "o", default)]
    pub doc: Document,

    /// Update target (`o2`), carrying the `_id` of the updated document.
    #[serde(rename = "o2")]
    pub update_target: Option<Document>,
}

/// Shape of a transaction-apply command payload.
#[derive(Debug, Deserialize)]
struct ApplyOps {
    #[serde(rename = "applyOps", default)]
    apply_ops: Vec<RawOplogEntry>,
}

/// Expands a raw oplog record into its logical entries.
///
/// Plain mutations yield one entry. `applyOps` command records on
/// `admin.$cmd` are expanded recursively, each sub-operation inheriting the
/// outer record's position and receiving the next `tx_idx` in order. Any
/// other command, no-op, or unrecognized record yields nothing.
#[must_use]
pub fn flatten_raw_entry(raw: &RawOplogEntry) -> Vec<OplogEntry> {
    let mut tx_idx = 0;
    flatten(raw, None, &mut tx_idx)
}

/// Recursive worker for [`flatten_raw_entry`].
///
/// The transaction index is threaded through explicitly so recursive
/// expansion stays reentrant and sub-operations are numbered in the order
/// they appear, depth first.
fn flatten(
    raw: &RawOplogEntry,
    inherited: Option<LogPosition>,
    tx_idx: &mut u32,
) -> Vec<OplogEntry> {
    let position = match raw.timestamp.map(LogPosition::from).or(inherited) {
        Some(pos) => pos,
        None => {
            error!(op = %raw.operation, ns = %raw.namespace, "oplog record has no timestamp");
            return Vec::new();
        }
    };

    if let Some(operation) = OperationKind::from_code(&raw.operation) {
        let namespace = Namespace::parse(&raw.namespace);

        let doc_id = if operation == OperationKind::Update {
            raw.update_target.as_ref().and_then(|t| t.get("_id")).cloned()
        } else {
            raw.doc.get("_id").cloned()
        };

        let doc_id = match doc_id {
            Some(id) => id,
            None => {
                error!(
                    op = %raw.operation,
                    ns = %raw.namespace,
                    "oplog record has no document _id; dropping entry"
                );
                return Vec::new();
            }
        };

        let entry = OplogEntry {
            operation,
            namespace,
            doc_id,
            data: raw.doc.clone(),
            position,
            tx_idx: *tx_idx,
        };
        *tx_idx += 1;

        return vec![entry];
    }

    if raw.operation == "c" {
        // Only transaction applies on admin.$cmd are expanded; other
        // commands (collection creation, index builds) publish nothing.
        if raw.namespace != "admin.$cmd" {
            return Vec::new();
        }

        let tx: ApplyOps = match bson::from_document(raw.doc.clone()) {
            Ok(tx) => tx,
            Err(e) => {
                error!(error = %e, "failed to decode applyOps payload");
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        for sub in &tx.apply_ops {
            out.extend(flatten(sub, Some(position), tx_idx));
        }
        return out;
    }

    debug!(op = %raw.operation, ns = %raw.namespace, "ignoring oplog record");
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn raw(op: &str, ns: &str, o: Document) -> RawOplogEntry {
        RawOplogEntry {
            timestamp: Some(Timestamp {
                time: 100,
                increment: 1,
            }),
            operation: op.to_string(),
            namespace: ns.to_string(),
            doc: o,
            update_target: None,
        }
    }

    #[test]
    fn flatten_insert() {
        let entries = flatten_raw_entry(&raw("i", "tests.Foo", doc! { "_id": "x", "hello": 1 }));
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert!(entry.is_insert());
        assert_eq!(entry.namespace, Namespace::new("tests", "Foo"));
        assert_eq!(entry.doc_id, Bson::String("x".to_string()));
        assert_eq!(entry.position, LogPosition::new(100, 1));
        assert_eq!(entry.tx_idx, 0);
    }

    #[test]
    fn flatten_update_takes_id_from_target() {
        let mut record = raw("u", "tests.Foo", doc! { "$set": { "a": 1 } });
        record.update_target = Some(doc! { "_id": "y" });

        let entries = flatten_raw_entry(&record);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].doc_id, Bson::String("y".to_string()));
    }

    #[test]
    fn flatten_drops_records_without_id() {
        assert!(flatten_raw_entry(&raw("i", "tests.Foo", doc! { "hello": 1 })).is_empty());
    }

    #[test]
    fn flatten_ignores_noops_and_foreign_commands() {
        assert!(flatten_raw_entry(&raw("n", "", doc! { "msg": "periodic noop" })).is_empty());
        assert!(flatten_raw_entry(&raw("c", "tests.$cmd", doc! { "create": "Foo" })).is_empty());
    }

    #[test]
    fn flatten_expands_transactions_in_order() {
        let record = raw(
            "c",
            "admin.$cmd",
            doc! {
                "applyOps": [
                    { "op": "i", "ns": "tests.Foo", "o": { "_id": "a" } },
                    { "op": "u", "ns": "tests.Bar", "o": { "$set": { "x": 1 } }, "o2": { "_id": "b" } },
                    { "op": "d", "ns": "tests.Foo", "o": { "_id": "c" } },
                ]
            },
        );

        let entries = flatten_raw_entry(&record);
        assert_eq!(entries.len(), 3);

        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.tx_idx, i as u32);
            assert_eq!(entry.position, LogPosition::new(100, 1));
        }
        assert!(entries[0].is_insert());
        assert!(entries[1].is_update());
        assert!(entries[2].is_remove());
    }

    #[test]
    fn flatten_expands_nested_transactions() {
        let record = raw(
            "c",
            "admin.$cmd",
            doc! {
                "applyOps": [
                    { "op": "i", "ns": "tests.Foo", "o": { "_id": "a" } },
                    { "op": "c", "ns": "admin.$cmd", "o": {
                        "applyOps": [
                            { "op": "i", "ns": "tests.Foo", "o": { "_id": "b" } },
                        ]
                    } },
                    { "op": "i", "ns": "tests.Foo", "o": { "_id": "c" } },
                ]
            },
        );

        let entries = flatten_raw_entry(&record);
        let ids: Vec<_> = entries.iter().map(|e| e.doc_id.clone()).collect();
        assert_eq!(ids, vec!["a".into(), "b".into(), "c".into()]);
        let idxs: Vec<_> = entries.iter().map(|e| e.tx_idx).collect();
        assert_eq!(idxs, vec![0, 1, 2]);
    }

    #[test]
    fn namespace_parse_keeps_collection_dots() {
        let ns = Namespace::parse("tests.system.indexes");
        assert_eq!(ns.database, "tests");
        assert_eq!(ns.collection, "system.indexes");
    }
}
