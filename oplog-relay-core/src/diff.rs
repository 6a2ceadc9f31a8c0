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

//! Changed-field extraction for oplog mutations.
//!
//! MongoDB has shipped two incompatible encodings for update operations:
//!
//! - **Legacy** (`$v: 1` and earlier): a map of update operators (`$set`,
//!   `$unset`, …) whose nested maps carry full dotted field paths as keys.
//! - **Modern diff** (`$v: 2`): a recursive structure where `i`/`u`/`d` keys
//!   insert/update/delete whole subtrees, `s`-prefixed keys scope a sub-diff
//!   to one field, and a special array-operator shape (`{"a": true}` plus
//!   indexed `u0`/`i1`/`d2`-style keys) mutates individual array elements.
//!
//! The encoding is decoded into an explicit [`UpdateEncoding`] variant at the
//! boundary; extraction is a structural recursive walk with no backtracking,
//! linear in the payload size. Unrecognized shapes never fail the entry:
//! they increment a diagnostics counter and contribute no fields, preserving
//! pipeline liveness.
//!
//! [`DiffMode`] selects whether modern-diff sub-field changes are reported as
//! dotted paths (`Deep`) or collapsed to the top-level field (`Shallow`).

use crate::entry::OplogEntry;
use crate::metrics;
use bson::{Bson, Document};
use tracing::warn;

/// How far modern-diff extraction descends into scoped sub-diffs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiffMode {
    /// Report only the top-level field a scoped sub-diff touches.
    #[default]
    Shallow,

    /// Recurse into scoped sub-diffs and report full dotted paths.
    Deep,
}

/// The decoded shape of one mutation payload.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEncoding<'a> {
    /// Legacy operator map (`$set`/`$unset`/…).
    Legacy(&'a Document),

    /// Modern `$v: 2` diff body (the `diff` sub-document).
    ModernDiff(&'a Document),

    /// Full-document replacement; every top-level key changed.
    Replacement(&'a Document),

    /// A `$v: 2` payload without a usable `diff` body. Counted and skipped,
    /// never fatal.
    Unrecognized,
}

impl<'a> UpdateEncoding<'a> {
    /// Classifies an update payload.
    ///
    /// A payload announcing `$v: 2` must carry a `diff` document; one with
    /// `$set`/`$unset` operators is legacy; anything else is a replacement.
    #[must_use]
    pub fn classify(data: &'a Document) -> Self {
        if matches!(data.get("$v"), Some(Bson::Int32(2) | Bson::Int64(2))) {
            return match data.get("diff") {
                Some(Bson::Document(diff)) => Self::ModernDiff(diff),
                _ => {
                    metrics::increment_unprocessable_fields();
                    warn!("v2 update payload without a diff document");
                    Self::Unrecognized
                }
            };
        }

        if data.contains_key("$set") || data.contains_key("$unset") {
            Self::Legacy(data)
        } else {
            Self::Replacement(data)
        }
    }
}

/// Computes the set of field paths an oplog entry touched.
///
/// Inserts and replacements contribute every top-level document key; removes
/// contribute nothing. Order is unspecified.
#[must_use]
pub fn changed_fields(entry: &OplogEntry, mode: DiffMode) -> Vec<String> {
    if entry.is_remove() {
        return Vec::new();
    }

    if entry.is_insert() {
        return top_level_keys(&entry.data);
    }

    match UpdateEncoding::classify(&entry.data) {
        UpdateEncoding::Replacement(doc) => top_level_keys(doc),
        UpdateEncoding::Legacy(ops) => legacy_fields(ops),
        UpdateEncoding::ModernDiff(diff) => match mode {
            DiffMode::Deep => modern_fields_deep(diff, ""),
            DiffMode::Shallow => modern_fields_shallow(diff),
        },
        UpdateEncoding::Unrecognized => Vec::new(),
    }
}

fn top_level_keys(doc: &Document) -> Vec<String> {
    doc.keys().cloned().collect()
}

/// Legacy operator map: every operator's nested map contributes its keys,
/// which are already full dotted paths.
fn legacy_fields(ops: &Document) -> Vec<String> {
    let mut fields = Vec::new();

    for (operator, operand) in ops {
        if operator == "$v" {
            // Update-language version marker, not an operator.
            continue;
        }

        match operand {
            Bson::Document(target) => fields.extend(target.keys().cloned()),
            _ => {
                metrics::increment_unprocessable_fields();
                warn!(operator = %operator, "legacy update operator with a non-map operand");
            }
        }
    }

    fields
}

/// Returns true if `value` is the indexed-array-mutation shape: a map
/// containing the marker `a: true` where every other key is an
/// insert/update/delete code followed by a decimal element index.
fn is_array_operator(value: &Bson) -> bool {
    let Bson::Document(doc) = value else {
        return false;
    };

    if !matches!(doc.get("a"), Some(Bson::Boolean(true))) {
        return false;
    }

    doc.keys().all(|key| key == "a" || is_array_index_key(key))
}

/// Matches `u0`, `i12`, `d3`-style keys.
fn is_array_index_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some('u' | 'i' | 'd'))
        && key.len() > 1
        && chars.all(|c| c.is_ascii_digit())
}

/// Flattens a subtree into its dotted leaf paths. Empty sub-documents and
/// non-document values (including arrays) are leaves.
fn flat_object_keys(prefix: &str, doc: &Document, acc: &mut Vec<String>) {
    for (key, value) in doc {
        match value {
            Bson::Document(sub) if !sub.is_empty() => {
                flat_object_keys(&format!("{prefix}{key}."), sub, acc);
            }
            _ => acc.push(format!("{prefix}{key}")),
        }
    }
}

/// Deep extraction: recurses into scoped sub-diffs, producing dotted paths.
fn modern_fields_deep(diff: &Document, prefix: &str) -> Vec<String> {
    let mut fields = Vec::new();

    for (key, value) in diff {
        if key == "i" || key == "u" || key == "d" {
            // Insert, update, or delete of a whole subtree.
            match value {
                Bson::Document(subtree) => flat_object_keys(prefix, subtree, &mut fields),
                _ => {
                    metrics::increment_unprocessable_fields();
                    warn!(key = %key, "v2 diff i/u/d key with a non-map value");
                }
            }
        } else if is_array_operator(value) {
            let Bson::Document(ops) = value else {
                unreachable!("array operator is always a document");
            };

            // Strip the operator letter from "sasd" and the index code from
            // "u0" to produce "asd.0".
            for op_key in ops.keys() {
                if op_key == "a" {
                    continue;
                }
                fields.push(format!("{prefix}{}.{}", &key[1..], &op_key[1..]));
            }
        } else if let Some(field) = key.strip_prefix('s') {
            // Scoped sub-diff for one field.
            match value {
                Bson::Document(sub) => {
                    fields.extend(modern_fields_deep(sub, &format!("{prefix}{field}.")));
                }
                _ => {
                    metrics::increment_unprocessable_fields();
                    warn!(key = %key, "v2 diff s-key with a non-map value");
                }
            }
        } else if key == "a" {
            // Array marker at this level; nothing to extract.
        } else {
            metrics::increment_unprocessable_fields();
            warn!(key = %key, "v2 diff key is not i/u/d, an array operator, or s-prefixed");
        }
    }

    fields
}

/// Shallow extraction: scoped sub-diffs report only the scoped field itself.
fn modern_fields_shallow(diff: &Document) -> Vec<String> {
    let mut fields = Vec::new();

    for (key, value) in diff {
        if key == "i" || key == "u" || key == "d" {
            match value {
                Bson::Document(subtree) => fields.extend(subtree.keys().cloned()),
                _ => {
                    metrics::increment_unprocessable_fields();
                    warn!(key = %key, "v2 diff i/u/d key with a non-map value");
                }
            }
        } else if let Some(field) = key.strip_prefix('s') {
            fields.push(field.to_string());
        } else if key == "a" || key.starts_with('o') {
            // Array marker / array length metadata.
        } else {
            metrics::increment_unprocessable_fields();
            warn!(key = %key, "v2 diff key is not i/u/d, an array operator, or s-prefixed");
        }
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Namespace, OperationKind};
    use crate::position::LogPosition;
    use bson::doc;

    fn entry(operation: OperationKind, data: Document) -> OplogEntry {
        OplogEntry {
            operation,
            namespace: Namespace::new("tests", "Foo"),
            doc_id: Bson::String("x".to_string()),
            data,
            position: LogPosition::new(1, 1),
            tx_idx: 0,
        }
    }

    fn sorted(mut fields: Vec<String>) -> Vec<String> {
        fields.sort();
        fields
    }

    #[test]
    fn insert_reports_top_level_keys() {
        let e = entry(
            OperationKind::Insert,
            doc! { "_id": "x", "hello": "world" },
        );
        assert_eq!(
            sorted(changed_fields(&e, DiffMode::Shallow)),
            vec!["_id", "hello"]
        );
    }

    #[test]
    fn remove_reports_nothing() {
        let e = entry(OperationKind::Remove, doc! { "_id": "x" });
        assert!(changed_fields(&e, DiffMode::Deep).is_empty());
    }

    #[test]
    fn legacy_set_unset() {
        let e = entry(
            OperationKind::Update,
            doc! { "$v": "1", "$set": { "a": 1, "b": 2 }, "$unset": { "c": 1 } },
        );
        assert_eq!(
            sorted(changed_fields(&e, DiffMode::Shallow)),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn legacy_keys_are_already_dotted_paths() {
        let e = entry(
            OperationKind::Update,
            doc! { "$set": { "a.b.c": 1 }, "$unset": { "d.0": 1 } },
        );
        assert_eq!(
            sorted(changed_fields(&e, DiffMode::Deep)),
            vec!["a.b.c", "d.0"]
        );
    }

    #[test]
    fn legacy_non_map_operand_is_skipped() {
        let e = entry(
            OperationKind::Update,
            doc! { "$set": { "a": 1 }, "$unset": true },
        );
        assert_eq!(sorted(changed_fields(&e, DiffMode::Shallow)), vec!["a"]);
    }

    #[test]
    fn replacement_update_reports_document_keys() {
        let e = entry(
            OperationKind::Update,
            doc! { "_id": "x", "name": "a", "count": 2 },
        );
        assert_eq!(
            sorted(changed_fields(&e, DiffMode::Shallow)),
            vec!["_id", "count", "name"]
        );
    }

    #[test]
    fn modern_shallow_scoped_field() {
        let e = entry(
            OperationKind::Update,
            doc! { "$v": 2, "diff": { "sa": { "i": { "b": 2 } } } },
        );
        assert_eq!(changed_fields(&e, DiffMode::Shallow), vec!["a"]);
    }

    #[test]
    fn modern_deep_scoped_field() {
        let e = entry(
            OperationKind::Update,
            doc! { "$v": 2, "diff": { "sa": { "i": { "b": 2 } } } },
        );
        assert_eq!(changed_fields(&e, DiffMode::Deep), vec!["a.b"]);
    }

    #[test]
    fn modern_top_level_subtree_ops() {
        let e = entry(
            OperationKind::Update,
            doc! { "$v": 2, "diff": { "i": { "a": 1 }, "u": { "b": 2 }, "d": { "c": true } } },
        );
        assert_eq!(
            sorted(changed_fields(&e, DiffMode::Shallow)),
            vec!["a", "b", "c"]
        );
    }

    #[test]
    fn modern_deep_flattens_subtree_leaves() {
        let e = entry(
            OperationKind::Update,
            doc! { "$v": 2, "diff": { "i": { "a": { "b": { "c": [{ "d": 1 }], "e": 2 }, "f": 3 } } } },
        );
        assert_eq!(
            sorted(changed_fields(&e, DiffMode::Deep)),
            vec!["a.b.c", "a.b.e", "a.f"]
        );
    }

    #[test]
    fn modern_deep_empty_subtree_is_a_leaf() {
        let e = entry(
            OperationKind::Update,
            doc! { "$v": 2, "diff": { "u": { "a": {} } } },
        );
        assert_eq!(changed_fields(&e, DiffMode::Deep), vec!["a"]);
    }

    #[test]
    fn modern_deep_array_operator() {
        let e = entry(
            OperationKind::Update,
            doc! { "$v": 2, "diff": { "sasd": { "a": true, "u0": 2 } } },
        );
        assert_eq!(changed_fields(&e, DiffMode::Deep), vec!["asd.0"]);
    }

    #[test]
    fn modern_shallow_array_operator_collapses_to_field() {
        let e = entry(
            OperationKind::Update,
            doc! { "$v": 2, "diff": { "sasd": { "a": true, "u0": 2 } } },
        );
        assert_eq!(changed_fields(&e, DiffMode::Shallow), vec!["asd"]);
    }

    #[test]
    fn modern_deep_mixed_array_index_codes() {
        let e = entry(
            OperationKind::Update,
            doc! { "$v": 2, "diff": { "sxs": { "a": true, "u0": 1, "i2": 3, "d5": true } } },
        );
        assert_eq!(
            sorted(changed_fields(&e, DiffMode::Deep)),
            vec!["xs.0", "xs.2", "xs.5"]
        );
    }

    #[test]
    fn modern_unknown_key_degrades_to_no_fields() {
        let e = entry(
            OperationKind::Update,
            doc! { "$v": 2, "diff": { "zzz": { "a": 1 }, "u": { "b": 1 } } },
        );
        assert_eq!(changed_fields(&e, DiffMode::Deep), vec!["b"]);
    }

    #[test]
    fn modern_missing_diff_is_unrecognized() {
        let e = entry(OperationKind::Update, doc! { "$v": 2 });
        assert!(changed_fields(&e, DiffMode::Deep).is_empty());

        let e = entry(OperationKind::Update, doc! { "$v": 2, "diff": 42 });
        assert!(changed_fields(&e, DiffMode::Shallow).is_empty());
    }

    #[test]
    fn array_operator_detection() {
        assert!(is_array_operator(&Bson::Document(
            doc! { "a": true, "u0": 1 }
        )));
        assert!(is_array_operator(&Bson::Document(
            doc! { "a": true, "i3": 1, "d10": true }
        )));
        // Missing marker, empty map, foreign key, bare "u"
        assert!(!is_array_operator(&Bson::Document(doc! { "u0": 1 })));
        assert!(!is_array_operator(&Bson::Document(doc! {})));
        assert!(!is_array_operator(&Bson::Document(
            doc! { "a": true, "b": 1 }
        )));
        assert!(!is_array_operator(&Bson::Document(
            doc! { "a": true, "u": 1 }
        )));
        assert!(!is_array_operator(&Bson::Int32(1)));
    }

    #[test]
    fn classify_variants() {
        let legacy = doc! { "$v": "1", "$set": { "a": 1 } };
        assert!(matches!(
            UpdateEncoding::classify(&legacy),
            UpdateEncoding::Legacy(_)
        ));

        let modern = doc! { "$v": 2, "diff": { "u": { "a": 1 } } };
        assert!(matches!(
            UpdateEncoding::classify(&modern),
            UpdateEncoding::ModernDiff(_)
        ));

        let replacement = doc! { "a": 1, "b": 2 };
        assert!(matches!(
            UpdateEncoding::classify(&replacement),
            UpdateEncoding::Replacement(_)
        ));

        let unrecognized = doc! { "$v": 2 };
        assert!(matches!(
            UpdateEncoding::classify(&unrecognized),
            UpdateEncoding::Unrecognized
        ));
    }
}
