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

//! In-memory publish sink for tests and single-process experiments.
//!
//! Mirrors the Redis sink's semantics (expiring dedupe markers, a single
//! checkpoint slot) without any I/O, and keeps every delivered message for
//! inspection. Not for production: state dies with the process.

use async_trait::async_trait;
use oplog_relay_core::position::LogPosition;
use oplog_relay_core::publication::Publication;
use oplog_relay_core::sink::{PublishOutcome, PublishSink, SinkError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One message the sink delivered, kept for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Channels the message went to.
    pub channels: Vec<String>,

    /// Message body.
    pub msg: Vec<u8>,

    /// Source oplog position.
    pub position: LogPosition,

    /// In-transaction index.
    pub tx_idx: u32,
}

#[derive(Debug, Default)]
struct Inner {
    /// Dedupe marker expiry times, keyed like the Redis sink's markers.
    markers: HashMap<String, Instant>,
    delivered: Vec<DeliveredMessage>,
    checkpoint: Option<LogPosition>,
    checkpoint_writes: u64,
}

/// In-memory [`PublishSink`] implementation.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<Inner>,
    fail_publishes: AtomicBool,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent publish fail with a connection error, until
    /// switched back. For exercising the drop-on-failure path.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Everything delivered so far, in order.
    #[must_use]
    pub fn delivered(&self) -> Vec<DeliveredMessage> {
        self.inner.lock().unwrap().delivered.clone()
    }

    /// Number of delivered messages.
    #[must_use]
    pub fn delivered_count(&self) -> usize {
        self.inner.lock().unwrap().delivered.len()
    }

    /// The current checkpoint, if one was written.
    #[must_use]
    pub fn checkpoint(&self) -> Option<LogPosition> {
        self.inner.lock().unwrap().checkpoint
    }

    /// How many checkpoint writes have happened. Coalescing tests assert on
    /// this.
    #[must_use]
    pub fn checkpoint_writes(&self) -> u64 {
        self.inner.lock().unwrap().checkpoint_writes
    }

    /// Drops all state, including markers.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::default();
    }
}

#[async_trait]
impl PublishSink for MemorySink {
    async fn publish(
        &self,
        publication: &Publication,
        dedupe_ttl: Duration,
    ) -> Result<PublishOutcome, SinkError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(SinkError::Connection("memory sink set to fail".to_string()));
        }

        let key = publication.dedup_key("");
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let live = inner.markers.get(&key).is_some_and(|expiry| *expiry > now);
        if live {
            return Ok(PublishOutcome::Duplicate);
        }

        inner.markers.insert(key, now + dedupe_ttl);
        inner.delivered.push(DeliveredMessage {
            channels: publication.channels.clone(),
            msg: publication.msg.clone(),
            position: publication.position,
            tx_idx: publication.tx_idx,
        });

        Ok(PublishOutcome::Published)
    }

    async fn read_checkpoint(&self) -> Result<Option<LogPosition>, SinkError> {
        Ok(self.inner.lock().unwrap().checkpoint)
    }

    async fn write_checkpoint(&self, position: LogPosition) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().unwrap();
        inner.checkpoint = Some(position);
        inner.checkpoint_writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publication(position: LogPosition, tx_idx: u32) -> Publication {
        Publication {
            channels: vec!["tests.Foo".to_string(), "tests.Foo::x".to_string()],
            msg: br#"{"e":"i"}"#.to_vec(),
            position,
            tx_idx,
            parallelism_key: [0; 8],
        }
    }

    #[tokio::test]
    async fn publish_then_duplicate() {
        let sink = MemorySink::new();
        let p = publication(LogPosition::new(1, 1), 0);
        let ttl = Duration::from_secs(60);

        assert_eq!(
            sink.publish(&p, ttl).await.unwrap(),
            PublishOutcome::Published
        );
        assert_eq!(
            sink.publish(&p, ttl).await.unwrap(),
            PublishOutcome::Duplicate
        );
        assert_eq!(sink.delivered_count(), 1);
    }

    #[tokio::test]
    async fn transaction_entries_deduplicate_independently() {
        let sink = MemorySink::new();
        let ttl = Duration::from_secs(60);
        let position = LogPosition::new(1, 1);

        for tx_idx in 0..3 {
            assert_eq!(
                sink.publish(&publication(position, tx_idx), ttl)
                    .await
                    .unwrap(),
                PublishOutcome::Published
            );
        }
        assert_eq!(sink.delivered_count(), 3);
    }

    #[tokio::test]
    async fn expired_marker_allows_republish() {
        let sink = MemorySink::new();
        let p = publication(LogPosition::new(1, 1), 0);

        sink.publish(&p, Duration::ZERO).await.unwrap();
        assert_eq!(
            sink.publish(&p, Duration::from_secs(60)).await.unwrap(),
            PublishOutcome::Published
        );
        assert_eq!(sink.delivered_count(), 2);
    }

    #[tokio::test]
    async fn checkpoint_round_trip() {
        let sink = MemorySink::new();
        assert_eq!(sink.read_checkpoint().await.unwrap(), None);

        let position = LogPosition::new(42, 7);
        sink.write_checkpoint(position).await.unwrap();
        assert_eq!(sink.read_checkpoint().await.unwrap(), Some(position));
        assert_eq!(sink.checkpoint_writes(), 1);
    }

    #[tokio::test]
    async fn failure_toggle() {
        let sink = MemorySink::new();
        let p = publication(LogPosition::new(1, 1), 0);

        sink.set_fail_publishes(true);
        assert!(sink.publish(&p, Duration::from_secs(60)).await.is_err());

        sink.set_fail_publishes(false);
        assert_eq!(
            sink.publish(&p, Duration::from_secs(60)).await.unwrap(),
            PublishOutcome::Published
        );
    }
}
