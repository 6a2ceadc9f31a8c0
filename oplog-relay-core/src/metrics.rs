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

//! Metric names and recording helpers.
//!
//! All instrumentation goes through the [`metrics`] facade; the binary picks
//! the exporter. Names are centralized here so dashboards and alerts have a
//! single source of truth, and [`describe_metrics`] registers the
//! descriptions once at startup.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Histogram: raw oplog record sizes in bytes, labeled by `database` and
/// `status` (`processed`, `ignored`, `error`).
pub const OPLOG_ENTRIES_BY_SIZE: &str = "oplogrelay_oplog_entries_by_size";

/// Gauge: per-database max raw record size over the last interval. Fed by
/// the interval-max tracker, labeled by `database`.
pub const OPLOG_ENTRIES_MAX_SIZE: &str = "oplogrelay_oplog_entries_max_size";

/// Counter: update payloads (or payload parts) whose shape could not be
/// decoded into changed fields.
pub const UNPROCESSABLE_CHANGED_FIELDS: &str =
    "oplogrelay_oplog_unprocessable_changed_fields_total";

/// Counter: entries dropped before publication, labeled by `database` and
/// `reason` (`system_collection`, `config_database`, `denylist`).
pub const ENTRIES_FILTERED: &str = "oplogrelay_oplog_entries_filtered_total";

/// Gauge: seconds since the newest oplog record was received. Grows while
/// the tail is idle or stuck.
pub const LAST_RECEIVED_STALENESS: &str = "oplogrelay_oplog_last_received_staleness_seconds";

/// Counter: publish attempts by `status` (`sent`, `duplicate`, `failed`).
pub const PROCESSED_MESSAGES: &str = "oplogrelay_redispub_processed_messages_total";

/// Histogram: wall time of one sink publish call, in seconds.
pub const PUBLISH_DURATION: &str = "oplogrelay_redispub_publish_duration_seconds";

/// Registers descriptions for every metric this crate records. Call once at
/// startup, after installing the exporter.
pub fn describe_metrics() {
    describe_histogram!(
        OPLOG_ENTRIES_BY_SIZE,
        "Size in bytes of received oplog records, by database and processing status"
    );
    describe_gauge!(
        OPLOG_ENTRIES_MAX_SIZE,
        "Largest oplog record seen per database during the last reporting interval"
    );
    describe_counter!(
        UNPROCESSABLE_CHANGED_FIELDS,
        "Update payloads whose shape could not be decoded into changed fields"
    );
    describe_counter!(
        ENTRIES_FILTERED,
        "Oplog entries dropped before publication, by reason"
    );
    describe_gauge!(
        LAST_RECEIVED_STALENESS,
        "Seconds since the newest oplog record was received"
    );
    describe_counter!(
        PROCESSED_MESSAGES,
        "Publish attempts handed to the sink, by outcome status"
    );
    describe_histogram!(
        PUBLISH_DURATION,
        "Wall time of one sink publish call, in seconds"
    );
}

/// Records the size and fate of one raw oplog record.
pub fn record_entry_size(database: &str, status: &'static str, size_bytes: usize) {
    histogram!(
        OPLOG_ENTRIES_BY_SIZE,
        "database" => database.to_string(),
        "status" => status,
    )
    .record(size_bytes as f64);
}

/// Bumps the unprocessable-payload diagnostics counter.
pub fn increment_unprocessable_fields() {
    counter!(UNPROCESSABLE_CHANGED_FIELDS).increment(1);
}

/// Counts one entry dropped before publication.
pub fn increment_entries_filtered(database: &str, reason: &'static str) {
    counter!(
        ENTRIES_FILTERED,
        "database" => database.to_string(),
        "reason" => reason,
    )
    .increment(1);
}

/// Updates the receive-staleness gauge.
pub fn record_staleness(staleness: Duration) {
    gauge!(LAST_RECEIVED_STALENESS).set(staleness.as_secs_f64());
}

/// Counts one publish attempt with its outcome status.
pub fn increment_processed_messages(status: &'static str) {
    counter!(PROCESSED_MESSAGES, "status" => status).increment(1);
}

/// Records the duration of one sink publish call.
pub fn record_publish_duration(elapsed: Duration) {
    histogram!(PUBLISH_DURATION).record(elapsed.as_secs_f64());
}
