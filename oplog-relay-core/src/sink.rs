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

//! The publish-sink abstraction.
//!
//! A sink delivers publications and persists the resume checkpoint. The
//! contract that makes multi-writer deployments safe lives here: `publish`
//! must atomically check the dedupe marker, set it with a TTL, and deliver
//! the message, so two relay instances racing on the same entry produce one
//! delivery.

use crate::position::{LogPosition, PositionError};
use crate::publication::Publication;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// What happened to a publish attempt that completed without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The message was delivered and the dedupe marker set.
    Published,

    /// Another writer already delivered this publication; nothing was sent.
    Duplicate,
}

/// Sink-side failures.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The backend was unreachable or the connection failed mid-operation.
    #[error("sink connection error: {0}")]
    Connection(String),

    /// A persisted checkpoint could not be decoded.
    #[error(transparent)]
    Checkpoint(#[from] PositionError),

    /// Any other backend-reported failure.
    #[error("sink backend error: {0}")]
    Backend(String),
}

/// Destination for publications plus the checkpoint store.
///
/// Implementations must be safe to share across tasks; the pipeline holds
/// one sink behind an `Arc` and calls it from the publisher and the
/// checkpoint writer concurrently.
#[async_trait]
pub trait PublishSink: Send + Sync {
    /// Atomically deduplicates and delivers one publication.
    ///
    /// If the publication's dedupe marker already exists, nothing is
    /// delivered and the outcome is [`PublishOutcome::Duplicate`]. Otherwise
    /// the marker is set with `dedupe_ttl` and the message is delivered to
    /// every channel, as one atomic step.
    async fn publish(
        &self,
        publication: &Publication,
        dedupe_ttl: Duration,
    ) -> Result<PublishOutcome, SinkError>;

    /// Reads the persisted resume checkpoint, if any.
    async fn read_checkpoint(&self) -> Result<Option<LogPosition>, SinkError>;

    /// Persists the resume checkpoint.
    async fn write_checkpoint(&self, position: LogPosition) -> Result<(), SinkError>;
}
