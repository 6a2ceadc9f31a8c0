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

//! Runtime-mutable suppression rules.
//!
//! A denylist rule names a path into the entry's filter view (a flat lens
//! over namespace, operation code, and mutation payload) and a regular
//! expression. An entry whose value at that path is a string matching the
//! expression is suppressed before any channel or message is built. Paths
//! that don't resolve to a string never suppress; rules fail open so a
//! malformed rule cannot black-hole the stream.

use bson::{Bson, Document};
use regex::Regex;
use std::collections::HashMap;
use tracing::info;
use uuid::Uuid;

/// One suppression rule: a field path into the filter view plus the pattern
/// a string at that path must match for the entry to be suppressed.
#[derive(Debug, Clone)]
pub struct DenylistRule {
    /// Path segments, outermost first.
    pub keys: Vec<String>,

    /// Pattern tested against the string value at the path.
    pub pattern: Regex,
}

impl DenylistRule {
    /// Builds a rule from a dotted path and a regex source.
    ///
    /// # Errors
    ///
    /// Returns the regex compile error for an invalid pattern.
    pub fn new(path: &str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            keys: path.split('.').map(str::to_string).collect(),
            pattern: Regex::new(pattern)?,
        })
    }

    /// Tests this rule against a filter view document.
    ///
    /// Descends the path one map level per segment. A missing key, a
    /// non-document intermediate, or a non-string leaf means no match.
    #[must_use]
    pub fn matches(&self, view: &Document) -> bool {
        let mut current = view;

        let Some((leaf, intermediate)) = self.keys.split_last() else {
            return false;
        };

        for key in intermediate {
            match current.get(key) {
                Some(Bson::Document(next)) => current = next,
                _ => return false,
            }
        }

        match current.get(leaf) {
            Some(Bson::String(value)) => self.pattern.is_match(value),
            _ => false,
        }
    }
}

/// A mutable collection of suppression rules keyed by generated id.
///
/// Shared between the tail loop and whatever management surface mutates it;
/// callers wrap it in a lock.
#[derive(Debug, Default)]
pub struct Denylist {
    rules: HashMap<String, DenylistRule>,
}

impl Denylist {
    /// Creates an empty denylist.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule and returns its generated id.
    pub fn insert_rule(&mut self, rule: DenylistRule) -> String {
        let id = Uuid::new_v4().to_string();
        info!(rule_id = %id, path = ?rule.keys, "denylist rule added");
        self.rules.insert(id.clone(), rule);
        id
    }

    /// Looks up a rule by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&DenylistRule> {
        self.rules.get(id)
    }

    /// Removes a rule by id, returning it if present.
    pub fn delete(&mut self, id: &str) -> Option<DenylistRule> {
        let removed = self.rules.remove(id);
        if removed.is_some() {
            info!(rule_id = %id, "denylist rule removed");
        }
        removed
    }

    /// Ids of all current rules, in no particular order.
    #[must_use]
    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no rules are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Tests an entry's filter view against every rule.
    ///
    /// Returns the id of the first matching rule, if any. Rule order is
    /// unspecified; any match suppresses, so which rule wins is not
    /// observable beyond logging.
    #[must_use]
    pub fn filter(&self, view: &Document) -> Option<&str> {
        self.rules
            .iter()
            .find(|(_, rule)| rule.matches(view))
            .map(|(id, _)| id.as_str())
    }
}
