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

//! The publish side of the pipeline.
//!
//! One task drains the bounded queue and hands each publication to the sink;
//! a companion task persists the resume checkpoint. A failed publish is
//! logged, counted, and dropped; at-least-once delivery comes from the
//! checkpoint lagging behind delivery, not from retrying individual
//! messages, so one poisonous message can never wedge the stream.
//!
//! Checkpoint writes are coalesced: positions are reported through a watch
//! channel and the writer flushes the newest one at most once per flush
//! interval, plus a final flush on shutdown.

use crate::config::RelayConfig;
use crate::metrics;
use crate::position::LogPosition;
use crate::publication::Publication;
use crate::sink::{PublishOutcome, PublishSink};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

/// Drains publications from the queue into a sink.
pub struct Publisher {
    sink: Arc<dyn PublishSink>,
    dedupe_ttl: Duration,
    flush_interval: Duration,
}

impl Publisher {
    /// Creates a publisher over `sink` with the configured dedupe TTL and
    /// checkpoint flush interval.
    #[must_use]
    pub fn new(sink: Arc<dyn PublishSink>, config: &RelayConfig) -> Self {
        Self {
            sink,
            dedupe_ttl: config.dedupe_expiration,
            flush_interval: config.flush_interval,
        }
    }

    /// Consumes the queue until it closes or shutdown is requested.
    ///
    /// Spawns the checkpoint writer internally and joins it before
    /// returning, so the newest delivered position is flushed on the way
    /// out.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        mut queue: mpsc::Receiver<Publication>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let (position_tx, position_rx) = watch::channel(None::<LogPosition>);

        let writer = tokio::spawn(checkpoint_writer(
            Arc::clone(&self.sink),
            position_rx,
            self.flush_interval,
        ));

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("publisher draining before stop");
                    break;
                }
                next = queue.recv() => match next {
                    None => {
                        debug!("publish queue closed");
                        break;
                    }
                    Some(publication) => self.publish_one(publication, &position_tx).await,
                }
            }
        }

        // Nothing already enqueued is discarded: the tailer drops its sender
        // on the same stop signal, so this drain terminates promptly.
        while let Some(publication) = queue.recv().await {
            self.publish_one(publication, &position_tx).await;
        }

        // Closing the watch channel tells the writer to do its final flush.
        drop(position_tx);
        if let Err(e) = writer.await {
            error!(error = %e, "checkpoint writer panicked");
        }
    }

    /// Delivers one publication and reports its position on success.
    async fn publish_one(
        &self,
        publication: Publication,
        position_tx: &watch::Sender<Option<LogPosition>>,
    ) {
        let started = Instant::now();
        let outcome = self.sink.publish(&publication, self.dedupe_ttl).await;
        metrics::record_publish_duration(started.elapsed());

        match outcome {
            Ok(PublishOutcome::Published) => {
                metrics::increment_processed_messages("sent");
            }
            Ok(PublishOutcome::Duplicate) => {
                metrics::increment_processed_messages("duplicate");
                debug!(
                    position = %publication.position,
                    tx_idx = publication.tx_idx,
                    "publication already delivered by another writer"
                );
            }
            Err(e) => {
                metrics::increment_processed_messages("failed");
                error!(
                    error = %e,
                    position = %publication.position,
                    channels = ?publication.channels,
                    "publish failed; dropping message"
                );
                // The checkpoint is not advanced past a dropped message, so
                // a restart within the catch-up window replays it.
                return;
            }
        }

        position_tx.send_if_modified(|current| {
            if current.map_or(true, |prev| publication.position > prev) {
                *current = Some(publication.position);
                true
            } else {
                false
            }
        });
    }
}

/// Persists the newest delivered position, at most once per flush interval.
///
/// Runs until the position channel closes, then flushes whatever is newest.
/// The publisher drops its sender only after the shutdown drain, so
/// positions delivered while draining are covered by the final flush. Write
/// failures are logged and retried implicitly on the next flush.
async fn checkpoint_writer(
    sink: Arc<dyn PublishSink>,
    mut positions: watch::Receiver<Option<LogPosition>>,
    flush_interval: Duration,
) {
    let mut last_written: Option<LogPosition> = None;

    while positions.changed().await.is_ok() {
        write_newest(&sink, &mut positions, &mut last_written).await;

        // Hold off so a burst of positions becomes one write.
        tokio::time::sleep(flush_interval).await;
    }

    write_newest(&sink, &mut positions, &mut last_written).await;
    debug!(position = ?last_written, "checkpoint writer stopped");
}

async fn write_newest(
    sink: &Arc<dyn PublishSink>,
    positions: &mut watch::Receiver<Option<LogPosition>>,
    last_written: &mut Option<LogPosition>,
) {
    let newest = *positions.borrow_and_update();
    let Some(position) = newest else { return };
    if *last_written == Some(position) {
        return;
    }

    match sink.write_checkpoint(position).await {
        Ok(()) => *last_written = Some(position),
        Err(e) => warn!(error = %e, %position, "failed to persist checkpoint"),
    }
}
