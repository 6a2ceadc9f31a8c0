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

//! Relay configuration.

use crate::diff::DiffMode;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("missing required configuration field: {0}")]
    MissingField(&'static str),

    /// A field value is out of range.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        reason: &'static str,
    },
}

/// Validated relay settings.
///
/// Construct through [`RelayConfig::builder`]; the defaults are production
/// values, only the MongoDB URL is required.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// MongoDB connection string. Must point at a replica set member so the
    /// oplog is available.
    pub mongo_url: String,

    /// Capacity of the bounded channel between the tail loop and the
    /// publisher. When full, tailing blocks rather than buffering unbounded.
    pub queue_size: usize,

    /// Minimum spacing between checkpoint writes. Positions arriving faster
    /// are coalesced; only the newest is persisted.
    pub flush_interval: Duration,

    /// How far behind a persisted checkpoint may be and still be used as the
    /// resume point. Older checkpoints fall through to the oplog end.
    pub max_catch_up: Duration,

    /// TTL on sink-side dedupe markers. Bounds the window in which a
    /// redundant relay instance suppresses duplicates.
    pub dedupe_expiration: Duration,

    /// Upper bound on a single cursor await before the tail loop re-checks
    /// for shutdown and reports staleness.
    pub query_timeout: Duration,

    /// Pause between tailing sessions after a cursor or connection failure.
    pub retry_backoff: Duration,

    /// Changed-field reporting depth for v2 update diffs.
    pub diff_mode: DiffMode,
}

impl RelayConfig {
    /// Starts a builder with production defaults.
    #[must_use]
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }
}

/// Builder for [`RelayConfig`].
#[derive(Debug, Clone)]
pub struct RelayConfigBuilder {
    mongo_url: Option<String>,
    queue_size: usize,
    flush_interval: Duration,
    max_catch_up: Duration,
    dedupe_expiration: Duration,
    query_timeout: Duration,
    retry_backoff: Duration,
    diff_mode: DiffMode,
}

impl Default for RelayConfigBuilder {
    fn default() -> Self {
        Self {
            mongo_url: None,
            queue_size: 10_000,
            flush_interval: Duration::from_secs(1),
            max_catch_up: Duration::from_secs(60),
            dedupe_expiration: Duration::from_secs(120),
            query_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(1),
            diff_mode: DiffMode::Shallow,
        }
    }
}

impl RelayConfigBuilder {
    /// Sets the MongoDB connection string (required).
    #[must_use]
    pub fn with_mongo_url(mut self, url: impl Into<String>) -> Self {
        self.mongo_url = Some(url.into());
        self
    }

    /// Sets the tail-to-publisher queue capacity.
    #[must_use]
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Sets the checkpoint coalescing interval.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Sets the maximum checkpoint age usable for resume.
    #[must_use]
    pub fn with_max_catch_up(mut self, window: Duration) -> Self {
        self.max_catch_up = window;
        self
    }

    /// Sets the dedupe marker TTL.
    #[must_use]
    pub fn with_dedupe_expiration(mut self, ttl: Duration) -> Self {
        self.dedupe_expiration = ttl;
        self
    }

    /// Sets the per-await cursor timeout.
    #[must_use]
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Sets the between-sessions retry pause.
    #[must_use]
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Sets the changed-field reporting depth.
    #[must_use]
    pub fn with_diff_mode(mut self, mode: DiffMode) -> Self {
        self.diff_mode = mode;
        self
    }

    /// Validates and builds the configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingField`] if the MongoDB URL was never set;
    /// [`ConfigError::InvalidValue`] for empty URLs, a zero queue size, or
    /// zero timing values (the catch-up window may be zero, which disables
    /// checkpoint resume).
    pub fn build(self) -> Result<RelayConfig, ConfigError> {
        let mongo_url = self
            .mongo_url
            .ok_or(ConfigError::MissingField("mongo_url"))?;
        if mongo_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "mongo_url",
                reason: "must not be empty",
            });
        }

        if self.queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue_size",
                reason: "must be at least 1",
            });
        }

        for (field, value) in [
            ("flush_interval", self.flush_interval),
            ("dedupe_expiration", self.dedupe_expiration),
            ("query_timeout", self.query_timeout),
            ("retry_backoff", self.retry_backoff),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be non-zero",
                });
            }
        }

        Ok(RelayConfig {
            mongo_url,
            queue_size: self.queue_size,
            flush_interval: self.flush_interval,
            max_catch_up: self.max_catch_up,
            dedupe_expiration: self.dedupe_expiration,
            query_timeout: self.query_timeout,
            retry_backoff: self.retry_backoff,
            diff_mode: self.diff_mode,
        })
    }
}
