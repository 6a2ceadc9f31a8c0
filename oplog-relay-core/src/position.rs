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

//! Oplog position codec.
//!
//! A [`LogPosition`] is MongoDB's oplog timestamp: 32 bits of seconds since
//! the Unix epoch plus a 32-bit per-second sequence counter that makes the
//! tuple unique and totally ordered across the whole oplog.
//!
//! Checkpoints are persisted in the same wire form MongoDB itself uses for
//! timestamps, a single base-10 unsigned 64-bit integer with the seconds in
//! the high 32 bits, so a stored checkpoint stays portable across relay
//! versions and directly comparable to the raw oplog.
//!
//! # Example
//!
//! ```rust
//! use oplog_relay_core::position::LogPosition;
//!
//! let pos = LogPosition::new(1_700_000_000, 7);
//! let encoded = pos.encode();
//! assert_eq!(LogPosition::decode(&encoded).unwrap(), pos);
//! ```

use bson::Timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from decoding a persisted log position.
#[derive(Debug, Error)]
pub enum PositionError {
    /// The persisted string was not a base-10 unsigned 64-bit integer.
    #[error("malformed log position {input:?}: {reason}")]
    Malformed {
        /// The raw string that failed to parse.
        input: String,
        /// Parser diagnostic.
        reason: String,
    },
}

/// A unique, totally ordered position in the oplog.
///
/// Ordering is time-major, then sequence counter. Within a single tailing
/// session positions never decrease; an observed decrease is an invariant
/// violation upstream (the oplog is append-only).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogPosition {
    /// Seconds since the Unix epoch.
    pub time: u32,

    /// Per-second sequence counter.
    pub seq: u32,
}

impl LogPosition {
    /// Creates a position from seconds and sequence counter.
    #[must_use]
    pub fn new(time: u32, seq: u32) -> Self {
        Self { time, seq }
    }

    /// Packs the position into MongoDB's u64 timestamp representation:
    /// seconds in the high 32 bits, counter in the low 32 bits.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        (u64::from(self.time) << 32) | u64::from(self.seq)
    }

    /// Unpacks a position from the u64 timestamp representation.
    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self {
            time: (raw >> 32) as u32,
            seq: (raw & 0xFFFF_FFFF) as u32,
        }
    }

    /// Encodes the position as a base-10 string for persistence.
    #[must_use]
    pub fn encode(self) -> String {
        self.as_u64().to_string()
    }

    /// Decodes a position from its persisted string form.
    ///
    /// # Errors
    ///
    /// Returns [`PositionError::Malformed`] on non-numeric input.
    pub fn decode(encoded: &str) -> Result<Self, PositionError> {
        let raw = encoded
            .parse::<u64>()
            .map_err(|e| PositionError::Malformed {
                input: encoded.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self::from_u64(raw))
    }

    /// Returns the wall-clock time this position corresponds to.
    ///
    /// Accurate to one second; the sequence counter carries no wall-clock
    /// information. Used to decide whether a persisted checkpoint is still
    /// within the catch-up window.
    #[must_use]
    pub fn wall_time(self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.time), 0).unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Returns a position for the current wall-clock second.
    ///
    /// Last-resort resume point when neither a checkpoint nor the oplog end
    /// can be read.
    #[must_use]
    pub fn now() -> Self {
        let secs = Utc::now().timestamp();
        Self {
            time: u32::try_from(secs).unwrap_or(u32::MAX),
            seq: 0,
        }
    }
}

impl From<Timestamp> for LogPosition {
    fn from(ts: Timestamp) -> Self {
        Self {
            time: ts.time,
            seq: ts.increment,
        }
    }
}

impl From<LogPosition> for Timestamp {
    fn from(pos: LogPosition) -> Self {
        Timestamp {
            time: pos.time,
            increment: pos.seq,
        }
    }
}

impl std::fmt::Display for LogPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.time, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let cases = [
            LogPosition::new(0, 0),
            LogPosition::new(0, 1),
            LogPosition::new(1_700_000_000, 0),
            LogPosition::new(1_700_000_000, 42),
            LogPosition::new(u32::MAX, u32::MAX),
        ];

        for pos in cases {
            assert_eq!(LogPosition::decode(&pos.encode()).unwrap(), pos);
        }
    }

    #[test]
    fn encoding_matches_mongo_layout() {
        // 1 << 32 is second 1, counter 0
        assert_eq!(LogPosition::new(1, 0).encode(), "4294967296");
        assert_eq!(LogPosition::new(0, 5).encode(), "5");
    }

    #[test]
    fn decode_rejects_garbage() {
        for bad in ["", "abc", "-1", "12.5", "18446744073709551616"] {
            assert!(matches!(
                LogPosition::decode(bad),
                Err(PositionError::Malformed { .. })
            ));
        }
    }

    #[test]
    fn ordering_is_time_major() {
        let a = LogPosition::new(10, 99);
        let b = LogPosition::new(11, 0);
        let c = LogPosition::new(11, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn timestamp_conversion() {
        let ts = Timestamp {
            time: 123,
            increment: 456,
        };
        let pos = LogPosition::from(ts);
        assert_eq!(pos, LogPosition::new(123, 456));
        assert_eq!(Timestamp::from(pos), ts);
    }

    #[test]
    fn wall_time_uses_seconds_only() {
        let pos = LogPosition::new(1_700_000_000, 77);
        assert_eq!(pos.wall_time().timestamp(), 1_700_000_000);
    }
}
