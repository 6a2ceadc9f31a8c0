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

//! The oplog tail loop.
//!
//! Opens a tailable-await cursor on `local.oplog.rs`, strictly after the
//! resume position, and feeds accepted entries into the bounded publish
//! queue. The loop is structured as sessions: a session owns one cursor and
//! runs until the cursor dies, the server reports it expired, or shutdown is
//! requested. A dead session is reopened from the last observed position, so
//! progress never regresses within a process lifetime.
//!
//! An idle cursor is not a failure. When no record arrives within the query
//! timeout the loop reports staleness and keeps awaiting the same cursor;
//! only server-reported expiry or a stream error forces a reopen.

use crate::config::RelayConfig;
use crate::denylist::Denylist;
use crate::entry::{flatten_raw_entry, RawOplogEntry};
use crate::interval_max::IntervalMaxVec;
use crate::metrics;
use crate::position::LogPosition;
use crate::processor::process;
use crate::publication::Publication;
use crate::sink::PublishSink;
use bson::{doc, Bson, RawDocumentBuf, Timestamp};
use chrono::Utc;
use futures::StreamExt;
use mongodb::error::ErrorKind;
use mongodb::options::CursorType;
use mongodb::{Client, Collection};
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

const OPLOG_DATABASE: &str = "local";
const OPLOG_COLLECTION: &str = "oplog.rs";

/// Server error codes meaning the cursor is gone and must be reopened:
/// CursorNotFound, CappedPositionLost, and the two exceeded-time variants.
const CURSOR_EXPIRED_CODES: [i32; 4] = [43, 136, 280, 286];

/// Interval-max reporting window for per-database record sizes.
const MAX_SIZE_INTERVAL: Duration = Duration::from_secs(60);

/// Fatal tail-loop failures.
#[derive(Debug, Error)]
pub enum TailError {
    /// Driver-level failure that is not a recoverable cursor condition.
    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),

    /// The publish queue receiver was dropped; the pipeline is shutting
    /// down or the publisher died.
    #[error("publish queue closed")]
    QueueClosed,
}

/// Why a tailing session ended without a fatal error.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// Shutdown was requested.
    Shutdown,

    /// The server reported the cursor expired; reopen from the last
    /// position.
    CursorExpired,

    /// The stream ended; reopen from the last position.
    CursorClosed,
}

/// Minimal record shape for reading the newest oplog timestamp.
#[derive(Debug, Deserialize)]
struct TimestampOnly {
    ts: Timestamp,
}

/// Tails the oplog and emits publications into a bounded queue.
pub struct Tailer {
    client: Client,
    sink: Arc<dyn PublishSink>,
    denylist: Arc<RwLock<Denylist>>,
    config: RelayConfig,
    max_size: IntervalMaxVec,
}

impl Tailer {
    /// Connects to MongoDB and prepares a tailer.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the connection string is rejected.
    pub async fn connect(
        config: RelayConfig,
        sink: Arc<dyn PublishSink>,
        denylist: Arc<RwLock<Denylist>>,
    ) -> Result<Self, TailError> {
        let client = Client::with_uri_str(&config.mongo_url).await?;
        info!("connected to MongoDB");

        Ok(Self {
            client,
            sink,
            denylist,
            config,
            max_size: IntervalMaxVec::new(
                metrics::OPLOG_ENTRIES_MAX_SIZE,
                &["database"],
                MAX_SIZE_INTERVAL,
            ),
        })
    }

    /// Runs the tail loop until shutdown.
    ///
    /// Sessions that end in a recoverable way (cursor expired or closed)
    /// reopen immediately from the last observed position; fatal errors
    /// pause for the configured backoff before a fresh session. Entries are
    /// sent into `queue`, blocking when it is full.
    ///
    /// # Errors
    ///
    /// [`TailError::QueueClosed`] once the publisher side goes away.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        queue: mpsc::Sender<Publication>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), TailError> {
        let mut position = self.resume_position().await;
        info!(%position, "tailing oplog");

        loop {
            match self.tail_session(&mut position, &queue, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => {
                    info!(%position, "tail loop stopping");
                    return Ok(());
                }
                Ok(SessionEnd::CursorExpired) => {
                    warn!(%position, "oplog cursor expired; reopening");
                }
                Ok(SessionEnd::CursorClosed) => {
                    debug!(%position, "oplog cursor closed; reopening");
                }
                Err(TailError::QueueClosed) => return Err(TailError::QueueClosed),
                Err(TailError::Mongo(e)) => {
                    error!(error = %e, %position, "tailing session failed; backing off");
                    tokio::select! {
                        _ = shutdown.recv() => return Ok(()),
                        () = tokio::time::sleep(self.config.retry_backoff) => {}
                    }
                }
            }

            // Flush the interval-max gauge and drop idle partitions between
            // sessions as well as on the timer inside the session.
            self.max_size.flush();
            self.max_size.sweep();
        }
    }

    /// Picks where tailing starts.
    ///
    /// A persisted checkpoint wins if it is younger than the catch-up
    /// window. Otherwise the newest existing oplog record, and as a last
    /// resort the current wall clock. Never fails; every fallback is logged.
    async fn resume_position(&self) -> LogPosition {
        match self.sink.read_checkpoint().await {
            Ok(Some(checkpoint)) => {
                let age = checkpoint_age(checkpoint, Utc::now());
                if within_catch_up(age, self.config.max_catch_up) {
                    info!(position = %checkpoint, age_secs = age.as_secs(), "resuming from checkpoint");
                    return checkpoint;
                }
                info!(
                    position = %checkpoint,
                    age_secs = age.as_secs(),
                    "checkpoint is outside the catch-up window; skipping to oplog end"
                );
            }
            Ok(None) => info!("no checkpoint found; starting from oplog end"),
            Err(e) => warn!(error = %e, "failed to read checkpoint; starting from oplog end"),
        }

        match self.newest_oplog_position().await {
            Ok(Some(position)) => position,
            Ok(None) => {
                warn!("oplog is empty; starting from current wall clock");
                LogPosition::now()
            }
            Err(e) => {
                warn!(error = %e, "failed to read oplog end; starting from current wall clock");
                LogPosition::now()
            }
        }
    }

    /// Reads the position of the newest oplog record, if any.
    async fn newest_oplog_position(&self) -> Result<Option<LogPosition>, mongodb::error::Error> {
        let collection: Collection<TimestampOnly> = self
            .client
            .database(OPLOG_DATABASE)
            .collection(OPLOG_COLLECTION);

        let newest = collection
            .find_one(doc! {})
            .sort(doc! { "$natural": -1 })
            .projection(doc! { "ts": 1 })
            .await?;

        Ok(newest.map(|record| LogPosition::from(record.ts)))
    }

    /// Runs one cursor to completion.
    ///
    /// `position` is advanced as records arrive, so the caller can reopen
    /// without replaying anything already seen.
    async fn tail_session(
        &self,
        position: &mut LogPosition,
        queue: &mpsc::Sender<Publication>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<SessionEnd, TailError> {
        let collection: Collection<RawDocumentBuf> = self
            .client
            .database(OPLOG_DATABASE)
            .collection(OPLOG_COLLECTION);

        let mut cursor = collection
            .find(doc! { "ts": { "$gt": Bson::Timestamp(Timestamp::from(*position)) } })
            .cursor_type(CursorType::TailableAwait)
            .max_await_time(self.config.query_timeout)
            .await?;

        let mut last_received = Instant::now();
        let mut flush_timer = tokio::time::interval(MAX_SIZE_INTERVAL);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(SessionEnd::Shutdown),
                _ = flush_timer.tick() => {
                    self.max_size.flush();
                    self.max_size.sweep();
                }
                next = tokio::time::timeout(self.config.query_timeout, cursor.next()) => {
                    match next {
                        // No record within the timeout. The cursor is fine;
                        // report how stale we are and keep awaiting it.
                        Err(_) => {
                            metrics::record_staleness(last_received.elapsed());
                        }
                        Ok(None) => return Ok(SessionEnd::CursorClosed),
                        Ok(Some(Err(e))) if is_cursor_expired(&e) => {
                            return Ok(SessionEnd::CursorExpired);
                        }
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Ok(Some(Ok(record))) => {
                            last_received = Instant::now();
                            metrics::record_staleness(Duration::ZERO);
                            self.handle_record(&record, position, queue).await?;
                        }
                    }
                }
            }
        }
    }

    /// Decodes, flattens, filters, and enqueues one raw oplog record.
    ///
    /// Per-record and per-entry failures are logged and counted but never
    /// end the session; only a closed queue propagates.
    async fn handle_record(
        &self,
        record: &RawDocumentBuf,
        position: &mut LogPosition,
        queue: &mpsc::Sender<Publication>,
    ) -> Result<(), TailError> {
        let size = record.as_bytes().len();

        let raw: RawOplogEntry = match bson::from_slice(record.as_bytes()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, size, "undecodable oplog record");
                metrics::record_entry_size("", "error", size);
                return Ok(());
            }
        };

        let database = raw
            .namespace
            .split_once('.')
            .map_or(raw.namespace.as_str(), |(db, _)| db);
        self.max_size.report(&[database], size as f64);

        // Advance even for records that publish nothing, so a reopen after
        // a noop-heavy stretch does not replay it.
        if let Some(ts) = raw.timestamp {
            let record_position = LogPosition::from(ts);
            if record_position > *position {
                *position = record_position;
            }
        }

        let entries = flatten_raw_entry(&raw);
        if entries.is_empty() {
            metrics::record_entry_size(database, "ignored", size);
            return Ok(());
        }

        let mut status = "ignored";
        for entry in &entries {
            let processed = {
                let denylist = self.denylist.read().unwrap();
                process(entry, &denylist, self.config.diff_mode)
            };

            match processed {
                Ok(Some(publication)) => {
                    queue
                        .send(publication)
                        .await
                        .map_err(|_| TailError::QueueClosed)?;
                    if status != "error" {
                        status = "processed";
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, ns = %entry.namespace.full_name(), "entry failed processing");
                    status = "error";
                }
            }
        }

        metrics::record_entry_size(database, status, size);
        Ok(())
    }
}

/// How old a checkpoint is, by its embedded wall-clock second.
///
/// A checkpoint from the future (clock skew between writer and reader)
/// counts as age zero.
fn checkpoint_age(checkpoint: LogPosition, now: chrono::DateTime<Utc>) -> Duration {
    now.signed_duration_since(checkpoint.wall_time())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Whether a checkpoint of the given age may be used as the resume point.
///
/// The comparison is strict: the checkpoint must be newer than
/// `now - window`, so a zero window rejects every checkpoint and falls
/// through to the oplog end.
fn within_catch_up(age: Duration, window: Duration) -> bool {
    age < window
}

/// Returns true for server errors meaning the cursor no longer exists.
fn is_cursor_expired(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => CURSOR_EXPIRED_CODES.contains(&(command.code)),
        _ => false,
    }
}
