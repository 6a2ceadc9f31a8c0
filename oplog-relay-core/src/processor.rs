// Copyright 2026 Oplog Relay Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Turns accepted oplog entries into publications.
//!
//! This is the policy layer between flattening and the sink: internal
//! namespaces are dropped, denylist rules are applied, the outbound message
//! is rendered, and the channel fan-out is decided. A rejected entry is a
//! non-event (`Ok(None)`); only an entry that *should* publish but can't
//! (an id type the wire format has no encoding for) is an error, and that
//! error is scoped to the single entry.

use crate::denylist::Denylist;
use crate::diff::{changed_fields, DiffMode};
use crate::entry::OplogEntry;
use crate::metrics;
use crate::publication::Publication;
use bson::{doc, Bson};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Per-entry processing failures. Never aborts the stream.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// The document `_id` is neither a string nor an ObjectId.
    #[error("unsupported _id type {id_type} in {namespace}")]
    UnsupportedIdType {
        /// BSON element type of the offending id.
        id_type: &'static str,
        /// Namespace of the entry.
        namespace: String,
    },

    /// The outbound message failed to serialize.
    #[error("failed to serialize outbound message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The JSON wire shape subscribers receive.
#[derive(Debug, Serialize)]
struct OutgoingMessage {
    /// Event code: `"i"`, `"u"`, or `"r"`.
    e: &'static str,

    /// Document descriptor; currently just the `_id`.
    d: DocumentRef,

    /// Changed field paths.
    f: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DocumentRef {
    #[serde(rename = "_id")]
    id: serde_json::Value,
}

/// Builds the publication for one oplog entry.
///
/// Returns `Ok(None)` when the entry is filtered: `system.*` collections,
/// the `config` database, and denylist matches publish nothing. The denylist
/// sees a flat view of the entry (`ns`, `op`, `o`) so rules can target the
/// namespace as well as payload fields.
///
/// # Errors
///
/// [`ProcessorError::UnsupportedIdType`] for ids that are neither strings
/// nor ObjectIds; [`ProcessorError::Serialize`] if message rendering fails.
pub fn process(
    entry: &OplogEntry,
    denylist: &Denylist,
    mode: DiffMode,
) -> Result<Option<Publication>, ProcessorError> {
    let ns = &entry.namespace;

    if ns.collection.starts_with("system.") {
        metrics::increment_entries_filtered(&ns.database, "system_collection");
        debug!(ns = %ns.full_name(), "skipping system collection entry");
        return Ok(None);
    }

    if ns.database == "config" {
        metrics::increment_entries_filtered(&ns.database, "config_database");
        debug!(ns = %ns.full_name(), "skipping config database entry");
        return Ok(None);
    }

    let view = doc! {
        "ns": ns.full_name(),
        "op": entry.operation.code(),
        "o": entry.data.clone(),
    };
    if let Some(rule_id) = denylist.filter(&view) {
        metrics::increment_entries_filtered(&ns.database, "denylist");
        debug!(ns = %ns.full_name(), rule_id = %rule_id, "entry suppressed by denylist rule");
        return Ok(None);
    }

    let (channel_id, wire_id) = encode_id(entry)?;

    let message = OutgoingMessage {
        e: entry.operation.event_code(),
        d: DocumentRef { id: wire_id },
        f: changed_fields(entry, mode),
    };
    let msg = serde_json::to_vec(&message)?;

    let namespace = ns.full_name();
    let channels = vec![namespace.clone(), format!("{namespace}::{channel_id}")];

    Ok(Some(Publication {
        channels,
        msg,
        position: entry.position,
        tx_idx: entry.tx_idx,
        parallelism_key: parallelism_key(&ns.database),
    }))
}

/// Renders the document id for the channel suffix and the wire message.
///
/// Strings pass through both. ObjectIds use the 24-character hex form in the
/// channel and an explicit tagged object on the wire, so subscribers can
/// reconstruct the original type.
fn encode_id(entry: &OplogEntry) -> Result<(String, serde_json::Value), ProcessorError> {
    match &entry.doc_id {
        Bson::String(s) => Ok((s.clone(), serde_json::Value::String(s.clone()))),
        Bson::ObjectId(oid) => {
            let hex = oid.to_hex();
            let wire = json!({ "$type": "oid", "$value": hex });
            Ok((hex, wire))
        }
        other => Err(ProcessorError::UnsupportedIdType {
            id_type: other.element_type_name(),
            namespace: entry.namespace.full_name(),
        }),
    }
}

trait ElementTypeName {
    fn element_type_name(&self) -> &'static str;
}

impl ElementTypeName for Bson {
    fn element_type_name(&self) -> &'static str {
        match self {
            Bson::Double(_) => "double",
            Bson::String(_) => "string",
            Bson::Array(_) => "array",
            Bson::Document(_) => "document",
            Bson::Boolean(_) => "boolean",
            Bson::Null => "null",
            Bson::RegularExpression(_) => "regex",
            Bson::Int32(_) => "int32",
            Bson::Int64(_) => "int64",
            Bson::Timestamp(_) => "timestamp",
            Bson::Binary(_) => "binary",
            Bson::ObjectId(_) => "objectid",
            Bson::DateTime(_) => "datetime",
            Bson::Decimal128(_) => "decimal128",
            _ => "other",
        }
    }
}

/// Derives the stable per-database routing key.
///
/// The low 8 bytes of `sha256(database)`, so the key is uniform across
/// databases but constant within one. Publications with equal keys must be
/// delivered in order; unequal keys may be handled concurrently.
fn parallelism_key(database: &str) -> [u8; 8] {
    let digest = Sha256::digest(database.as_bytes());
    let mut key = [0u8; 8];
    key.copy_from_slice(&digest[24..32]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::denylist::DenylistRule;
    use crate::entry::{Namespace, OperationKind};
    use crate::position::LogPosition;
    use bson::oid::ObjectId;
    use bson::Document;

    fn entry(op: OperationKind, ns: &str, id: Bson, data: Document) -> OplogEntry {
        OplogEntry {
            operation: op,
            namespace: Namespace::parse(ns),
            doc_id: id,
            data,
            position: LogPosition::new(100, 2),
            tx_idx: 0,
        }
    }

    #[test]
    fn insert_publishes_to_both_channels() {
        let e = entry(
            OperationKind::Insert,
            "tests.Foo",
            Bson::String("someid".to_string()),
            doc! { "_id": "someid", "hello": "world" },
        );

        let publication = process(&e, &Denylist::new(), DiffMode::Shallow)
            .unwrap()
            .unwrap();

        assert_eq!(
            publication.channels,
            vec!["tests.Foo".to_string(), "tests.Foo::someid".to_string()]
        );

        let msg: serde_json::Value = serde_json::from_slice(&publication.msg).unwrap();
        assert_eq!(msg["e"], "i");
        assert_eq!(msg["d"]["_id"], "someid");
        let mut fields: Vec<_> = msg["f"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        fields.sort();
        assert_eq!(fields, vec!["_id", "hello"]);
    }

    #[test]
    fn remove_uses_event_code_r() {
        let e = entry(
            OperationKind::Remove,
            "tests.Foo",
            Bson::String("x".to_string()),
            doc! { "_id": "x" },
        );

        let publication = process(&e, &Denylist::new(), DiffMode::Shallow)
            .unwrap()
            .unwrap();
        let msg: serde_json::Value = serde_json::from_slice(&publication.msg).unwrap();
        assert_eq!(msg["e"], "r");
        assert!(msg["f"].as_array().unwrap().is_empty());
    }

    #[test]
    fn object_id_is_hex_in_channel_and_tagged_on_wire() {
        let oid = ObjectId::parse_str("deadbeefdeadbeefdeadbeef").unwrap();
        let e = entry(
            OperationKind::Insert,
            "tests.Foo",
            Bson::ObjectId(oid),
            doc! { "_id": oid },
        );

        let publication = process(&e, &Denylist::new(), DiffMode::Shallow)
            .unwrap()
            .unwrap();
        assert_eq!(
            publication.channels[1],
            "tests.Foo::deadbeefdeadbeefdeadbeef"
        );

        let msg: serde_json::Value = serde_json::from_slice(&publication.msg).unwrap();
        assert_eq!(msg["d"]["_id"]["$type"], "oid");
        assert_eq!(msg["d"]["_id"]["$value"], "deadbeefdeadbeefdeadbeef");
    }

    #[test]
    fn unsupported_id_is_a_per_entry_error() {
        let e = entry(
            OperationKind::Insert,
            "tests.Foo",
            Bson::Int32(42),
            doc! { "_id": 42 },
        );

        let err = process(&e, &Denylist::new(), DiffMode::Shallow).unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::UnsupportedIdType { id_type: "int32", .. }
        ));
    }

    #[test]
    fn system_collections_and_config_db_are_skipped() {
        let sys = entry(
            OperationKind::Insert,
            "tests.system.indexes",
            Bson::String("x".to_string()),
            doc! { "_id": "x" },
        );
        assert!(process(&sys, &Denylist::new(), DiffMode::Shallow)
            .unwrap()
            .is_none());

        let cfg = entry(
            OperationKind::Insert,
            "config.transactions",
            Bson::String("x".to_string()),
            doc! { "_id": "x" },
        );
        assert!(process(&cfg, &Denylist::new(), DiffMode::Shallow)
            .unwrap()
            .is_none());
    }

    #[test]
    fn denylist_rule_suppresses_by_namespace() {
        let mut denylist = Denylist::new();
        denylist.insert_rule(DenylistRule::new("ns", r"^tests\.Audit$").unwrap());

        let suppressed = entry(
            OperationKind::Insert,
            "tests.Audit",
            Bson::String("x".to_string()),
            doc! { "_id": "x" },
        );
        assert!(process(&suppressed, &denylist, DiffMode::Shallow)
            .unwrap()
            .is_none());

        let passed = entry(
            OperationKind::Insert,
            "tests.Foo",
            Bson::String("x".to_string()),
            doc! { "_id": "x" },
        );
        assert!(process(&passed, &denylist, DiffMode::Shallow)
            .unwrap()
            .is_some());
    }

    #[test]
    fn denylist_rule_suppresses_by_payload_field() {
        let mut denylist = Denylist::new();
        denylist.insert_rule(DenylistRule::new("o.source", "^migration$").unwrap());

        let suppressed = entry(
            OperationKind::Insert,
            "tests.Foo",
            Bson::String("x".to_string()),
            doc! { "_id": "x", "source": "migration" },
        );
        assert!(process(&suppressed, &denylist, DiffMode::Shallow)
            .unwrap()
            .is_none());
    }

    #[test]
    fn parallelism_key_is_stable_per_database() {
        let a = parallelism_key("tests");
        let b = parallelism_key("tests");
        let c = parallelism_key("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn entries_from_same_database_share_routing_key() {
        let make = |coll: &str| {
            entry(
                OperationKind::Insert,
                &format!("tests.{coll}"),
                Bson::String("x".to_string()),
                doc! { "_id": "x" },
            )
        };

        let p1 = process(&make("Foo"), &Denylist::new(), DiffMode::Shallow)
            .unwrap()
            .unwrap();
        let p2 = process(&make("Bar"), &Denylist::new(), DiffMode::Shallow)
            .unwrap()
            .unwrap();
        assert_eq!(p1.parallelism_key, p2.parallelism_key);
    }
}
