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

//! Redis publish sink for distributed deployments.
//!
//! Implements [`PublishSink`](oplog_relay_core::sink::PublishSink) over a
//! `deadpool-redis` pool. The dedupe-then-publish step runs as a single Lua
//! script, so checking the marker, setting it with its TTL, and publishing
//! to every channel is atomic on the server; two relay instances racing on
//! the same oplog entry produce exactly one delivery.
//!
//! # Example
//!
//! ```rust,no_run
//! use oplog_relay_stores::redis::{RedisSink, RedisSinkConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisSinkConfig::builder()
//!     .url("redis://localhost:6379")
//!     .pool_size(10)
//!     .build()?;
//!
//! let sink = RedisSink::new(config).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Key Pattern
//!
//! All keys share the configured prefix (default `oplogrelay::`):
//!
//! ```text
//! oplogrelay::processed::{position}::{tx_idx}   dedupe markers, expiring
//! oplogrelay::lastProcessedEntry                resume checkpoint
//! ```

use async_trait::async_trait;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use oplog_relay_core::position::LogPosition;
use oplog_relay_core::publication::Publication;
use oplog_relay_core::sink::{PublishOutcome, PublishSink, SinkError};
use redis::{AsyncCommands, RedisError, Script};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default prefix for every key the sink writes.
pub const DEFAULT_KEY_PREFIX: &str = "oplogrelay::";

/// Checkpoint key suffix, appended to the prefix.
const CHECKPOINT_KEY: &str = "lastProcessedEntry";

/// Maximum number of retry attempts for transient checkpoint errors.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (milliseconds).
const BASE_RETRY_DELAY_MS: u64 = 100;

/// Atomic dedupe-and-publish. `KEYS[1]` is the dedupe marker, `ARGV[1]` the
/// marker TTL in seconds, `ARGV[2]` the message, `ARGV[3..]` the channels.
/// Returns 1 if published, 0 if the marker already existed.
const PUBLISH_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) then
  return 0
end
redis.call('SETEX', KEYS[1], ARGV[1], 1)
for i = 3, #ARGV do
  redis.call('PUBLISH', ARGV[i], ARGV[2])
end
return 1
";

/// Configuration for the Redis publish sink.
///
/// Use [`RedisSinkConfigBuilder`] to construct this configuration with
/// validation.
#[derive(Debug, Clone)]
pub struct RedisSinkConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379").
    pub url: String,

    /// Connection pool size (default: 10).
    pub pool_size: usize,

    /// Connection timeout (default: 5 seconds).
    pub connection_timeout: Duration,

    /// Prefix for dedupe markers and the checkpoint key (default:
    /// `oplogrelay::`). Separate relays sharing one Redis must use distinct
    /// prefixes, or they will deduplicate against each other.
    pub key_prefix: String,
}

impl Default for RedisSinkConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            connection_timeout: Duration::from_secs(5),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl RedisSinkConfig {
    /// Creates a new builder for `RedisSinkConfig`.
    #[must_use]
    pub fn builder() -> RedisSinkConfigBuilder {
        RedisSinkConfigBuilder::default()
    }
}

/// Builder for [`RedisSinkConfig`] with validation.
#[derive(Debug, Default)]
pub struct RedisSinkConfigBuilder {
    url: Option<String>,
    pool_size: Option<usize>,
    connection_timeout: Option<Duration>,
    key_prefix: Option<String>,
}

impl RedisSinkConfigBuilder {
    /// Sets the Redis connection URL.
    ///
    /// # Formats
    ///
    /// - Standalone: `redis://localhost:6379`
    /// - With auth: `redis://:password@localhost:6379`
    /// - TLS: `rediss://localhost:6380`
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the connection pool size. Default: 10.
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = Some(size);
        self
    }

    /// Sets the connection timeout. Default: 5 seconds.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Sets the key prefix. Default: `oplogrelay::`.
    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Builds the `RedisSinkConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is missing or the pool size is 0.
    pub fn build(self) -> Result<RedisSinkConfig, SinkError> {
        let url = self
            .url
            .ok_or_else(|| SinkError::Backend("Redis URL is required".to_string()))?;

        let pool_size = self.pool_size.unwrap_or(10);
        if pool_size == 0 {
            return Err(SinkError::Backend(
                "Pool size must be greater than 0".to_string(),
            ));
        }

        Ok(RedisSinkConfig {
            url,
            pool_size,
            connection_timeout: self
                .connection_timeout
                .unwrap_or(Duration::from_secs(5)),
            key_prefix: self
                .key_prefix
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
        })
    }
}

/// Redis-backed publish sink.
///
/// `RedisSink` is `Send + Sync` and can be shared across tasks; the
/// underlying connection pool handles concurrent access.
#[derive(Clone)]
pub struct RedisSink {
    pool: Pool,
    config: RedisSinkConfig,
    script: Arc<Script>,
}

impl RedisSink {
    /// Creates a sink and verifies connectivity with a PING.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Connection`] if the pool cannot be created or
    /// Redis is unreachable.
    pub async fn new(config: RedisSinkConfig) -> Result<Self, SinkError> {
        debug!(url = %config.url, pool_size = config.pool_size, "initializing Redis sink");

        let mut pool_config = PoolConfig::from_url(&config.url);
        if let Some(pool) = pool_config.pool.as_mut() {
            pool.max_size = config.pool_size;
            pool.timeouts.wait = Some(config.connection_timeout);
            pool.timeouts.create = Some(config.connection_timeout);
            pool.timeouts.recycle = Some(config.connection_timeout);
        }

        let pool = pool_config
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| {
                error!(error = %e, "failed to create Redis connection pool");
                SinkError::Connection(format!("failed to create pool: {e}"))
            })?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| SinkError::Connection(format!("failed to connect to Redis: {e}")))?;
        redis::cmd("PING")
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| SinkError::Connection(format!("Redis connection test failed: {e}")))?;

        debug!("Redis sink initialized");

        Ok(Self {
            pool,
            config,
            script: Arc::new(Script::new(PUBLISH_SCRIPT)),
        })
    }

    fn checkpoint_key(&self) -> String {
        format!("{}{}", self.config.key_prefix, CHECKPOINT_KEY)
    }

    /// Executes a Redis operation with retry logic for transient errors.
    ///
    /// Used for checkpoint traffic only; publish attempts are never retried
    /// here, the pipeline treats a failed publish as a logged drop.
    async fn with_retry<F, T, Fut>(&self, operation: F) -> Result<T, SinkError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut retries = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if is_retryable(&e) && retries < MAX_RETRIES => {
                    retries += 1;
                    let delay = Duration::from_millis(BASE_RETRY_DELAY_MS * 2_u64.pow(retries - 1));
                    warn!(
                        attempt = retries,
                        max = MAX_RETRIES,
                        error = %e,
                        "Redis operation failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(SinkError::Connection(format!(
                        "Redis operation failed: {e}"
                    )));
                }
            }
        }
    }
}

fn is_retryable(error: &RedisError) -> bool {
    matches!(
        error.kind(),
        redis::ErrorKind::IoError | redis::ErrorKind::ResponseError
    )
}

fn pool_error(e: impl std::fmt::Display) -> RedisError {
    RedisError::from((
        redis::ErrorKind::IoError,
        "failed to get connection from pool",
        e.to_string(),
    ))
}

#[async_trait]
impl PublishSink for RedisSink {
    async fn publish(
        &self,
        publication: &Publication,
        dedupe_ttl: Duration,
    ) -> Result<PublishOutcome, SinkError> {
        let dedup_key = publication.dedup_key(&self.config.key_prefix);

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| SinkError::Connection(format!("failed to get connection: {e}")))?;

        let mut invocation = self.script.key(&dedup_key);
        invocation
            .arg(dedupe_ttl.as_secs().max(1))
            .arg(publication.msg.as_slice());
        for channel in &publication.channels {
            invocation.arg(channel);
        }

        let published: i64 = invocation
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| SinkError::Backend(format!("publish script failed: {e}")))?;

        if published == 1 {
            debug!(
                position = %publication.position,
                channels = publication.channels.len(),
                "published"
            );
            Ok(PublishOutcome::Published)
        } else {
            Ok(PublishOutcome::Duplicate)
        }
    }

    async fn read_checkpoint(&self) -> Result<Option<LogPosition>, SinkError> {
        let key = self.checkpoint_key();
        let pool = self.pool.clone();

        let encoded: Option<String> = self
            .with_retry(|| async {
                let mut conn = pool.get().await.map_err(pool_error)?;
                conn.get(&key).await
            })
            .await?;

        match encoded {
            Some(value) => Ok(Some(LogPosition::decode(&value)?)),
            None => Ok(None),
        }
    }

    async fn write_checkpoint(&self, position: LogPosition) -> Result<(), SinkError> {
        let key = self.checkpoint_key();
        let value = position.encode();
        let pool = self.pool.clone();

        self.with_retry::<_, (), _>(|| async {
            let mut conn = pool.get().await.map_err(pool_error)?;
            conn.set(&key, &value).await
        })
        .await?;

        debug!(%position, "checkpoint persisted");
        Ok(())
    }
}
