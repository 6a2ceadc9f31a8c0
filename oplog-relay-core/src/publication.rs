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

//! The unit of outbound work.

use crate::position::LogPosition;

/// A fully rendered message ready for the publish sink.
///
/// Built once per accepted oplog entry and immutable from then on: the sink
/// publishes the same `msg` bytes to every channel, so all recipients see an
/// identical payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Channels the message is delivered to, in order.
    pub channels: Vec<String>,

    /// Serialized message body, shared across channels.
    pub msg: Vec<u8>,

    /// Oplog position of the originating record.
    pub position: LogPosition,

    /// In-transaction index of the originating entry. Distinguishes the
    /// entries of one transaction, which share a position.
    pub tx_idx: u32,

    /// Stable routing key derived from the source database. Entries from the
    /// same database always carry the same key, so per-database ordering
    /// survives sharded publishing.
    pub parallelism_key: [u8; 8],
}

impl Publication {
    /// The sink-side dedupe marker key for this publication.
    ///
    /// Combines the encoded position with the in-transaction index, so every
    /// entry of a transaction deduplicates independently.
    #[must_use]
    pub fn dedup_key(&self, prefix: &str) -> String {
        format!("{}processed::{}::{}", prefix, self.position.encode(), self.tx_idx)
    }
}
