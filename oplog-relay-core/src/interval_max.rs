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

//! Interval-max saturation metric.
//!
//! Reports the maximum value observed per label partition over fixed
//! wall-clock intervals, as a gauge. Each partition keeps two buckets, the
//! current interval and the one before it; a scrape sees the previous
//! bucket's max, and only while that bucket is exactly one interval old. A
//! partition that stops receiving reports therefore reads as absent rather
//! than holding its last max forever.
//!
//! Partitions are garbage-collected by an explicit [`IntervalMaxVec::sweep`]
//! call rather than as a side effect of scraping, so collection stays
//! read-only and the cleanup cadence is the caller's choice.

use metrics::Label;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Time source for interval bucketing. Injected so tests can drive the
/// bucket rotation deterministically.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Interval index: wall-clock millis since the epoch divided by the
    /// interval length.
    index: u64,
    max: f64,
}

#[derive(Debug, Default)]
struct Partition {
    current: Option<Bucket>,
    previous: Option<Bucket>,
}

/// A family of interval-max gauges, one per label-value combination.
pub struct IntervalMaxVec<C: Clock = SystemClock> {
    name: &'static str,
    label_names: &'static [&'static str],
    interval: Duration,
    clock: C,
    partitions: Mutex<HashMap<Vec<String>, Partition>>,
}

impl IntervalMaxVec<SystemClock> {
    /// Creates a family on the system clock.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    #[must_use]
    pub fn new(name: &'static str, label_names: &'static [&'static str], interval: Duration) -> Self {
        Self::with_clock(name, label_names, interval, SystemClock)
    }
}

impl<C: Clock> IntervalMaxVec<C> {
    /// Creates a family on an explicit clock.
    #[must_use]
    pub fn with_clock(
        name: &'static str,
        label_names: &'static [&'static str],
        interval: Duration,
        clock: C,
    ) -> Self {
        assert!(!interval.is_zero(), "interval must be non-zero");
        Self {
            name,
            label_names,
            interval,
            clock,
            partitions: Mutex::new(HashMap::new()),
        }
    }

    fn interval_index(&self) -> u64 {
        let since_epoch = self
            .clock
            .now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        since_epoch.as_millis() as u64 / self.interval.as_millis() as u64
    }

    /// Records an observation for one label partition, keeping the max for
    /// the current interval.
    ///
    /// # Panics
    ///
    /// Panics if `label_values` does not match the label names in length, or
    /// if the clock runs backwards past an interval boundary (the buckets
    /// are strictly ordered by interval).
    pub fn report(&self, label_values: &[&str], value: f64) {
        assert_eq!(
            label_values.len(),
            self.label_names.len(),
            "label cardinality mismatch for {}",
            self.name
        );

        let now = self.interval_index();
        let mut partitions = self.partitions.lock().unwrap();
        let partition = partitions
            .entry(label_values.iter().map(|v| (*v).to_string()).collect())
            .or_default();

        match partition.current {
            None => {
                partition.current = Some(Bucket {
                    index: now,
                    max: value,
                });
            }
            Some(current) if current.index == now => {
                partition.current = Some(Bucket {
                    index: now,
                    max: current.max.max(value),
                });
            }
            Some(current) if current.index < now => {
                partition.previous = Some(current);
                partition.current = Some(Bucket {
                    index: now,
                    max: value,
                });
            }
            Some(current) => {
                panic!(
                    "clock ran backwards: bucket {} is ahead of interval {}",
                    current.index, now
                );
            }
        }
    }

    /// Snapshot of the observable maxima: one `(label values, max)` pair per
    /// partition whose newest finished bucket is exactly one interval old.
    ///
    /// A bucket that finished without a report arriving in the next interval
    /// is still `current` in storage; it is read here as the finished bucket
    /// so a burst followed by silence reports its max for one interval.
    #[must_use]
    pub fn collect(&self) -> Vec<(Vec<String>, f64)> {
        let now = self.interval_index();
        let partitions = self.partitions.lock().unwrap();

        partitions
            .iter()
            .filter_map(|(labels, partition)| {
                let finished = match partition.current {
                    Some(current) if current.index + 1 == now => Some(current),
                    _ => partition.previous.filter(|bucket| bucket.index + 1 == now),
                };
                finished.map(|bucket| (labels.clone(), bucket.max))
            })
            .collect()
    }

    /// Pushes the current snapshot into the metrics recorder as gauges.
    pub fn flush(&self) {
        for (label_values, max) in self.collect() {
            let labels: Vec<Label> = self
                .label_names
                .iter()
                .zip(label_values)
                .map(|(name, value)| Label::new(*name, value))
                .collect();
            metrics::gauge!(self.name, labels).set(max);
        }
    }

    /// Drops partitions with no observable bucket left: both buckets older
    /// than the previous interval. Call periodically; the metric works
    /// without it but idle partitions accumulate.
    pub fn sweep(&self) {
        let now = self.interval_index();
        let mut partitions = self.partitions.lock().unwrap();
        let before = partitions.len();

        partitions.retain(|_, partition| {
            partition
                .current
                .map(|bucket| bucket.index + 1 >= now)
                .unwrap_or(false)
        });

        let dropped = before - partitions.len();
        if dropped > 0 {
            debug!(metric = self.name, dropped, "swept idle interval-max partitions");
        }
    }

    /// Number of live partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.lock().unwrap().len()
    }
}

impl<C: Clock> std::fmt::Debug for IntervalMaxVec<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalMaxVec")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("partitions", &self.partition_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Clock advanced by hand, in milliseconds since the epoch.
    #[derive(Debug, Default, Clone)]
    struct ManualClock(Arc<AtomicU64>);

    impl ManualClock {
        fn advance_ms(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> SystemTime {
            UNIX_EPOCH + Duration::from_millis(self.0.load(Ordering::SeqCst))
        }
    }

    const INTERVAL: Duration = Duration::from_millis(1000);
    const LABELS: &[&str] = &["database"];

    fn vec_with_clock(clock: ManualClock) -> IntervalMaxVec<ManualClock> {
        IntervalMaxVec::with_clock("test_max", LABELS, INTERVAL, clock)
    }

    #[test]
    fn current_interval_is_not_observable() {
        let clock = ManualClock::default();
        let vec = vec_with_clock(clock.clone());

        vec.report(&["tests"], 10.0);
        assert!(vec.collect().is_empty());
    }

    #[test]
    fn previous_interval_reports_its_max() {
        let clock = ManualClock::default();
        let vec = vec_with_clock(clock.clone());

        vec.report(&["tests"], 10.0);
        vec.report(&["tests"], 25.0);
        vec.report(&["tests"], 5.0);

        clock.advance_ms(1000);
        vec.report(&["tests"], 1.0);

        let snapshot = vec.collect();
        assert_eq!(snapshot, vec![(vec!["tests".to_string()], 25.0)]);
    }

    #[test]
    fn idle_interval_still_exposes_previous_max() {
        let clock = ManualClock::default();
        let vec = vec_with_clock(clock.clone());

        vec.report(&["tests"], 25.0);
        clock.advance_ms(1000);
        // No report yet in the new interval; the finished bucket must read
        // anyway, not wait for the next report to rotate it. A sweep keeps
        // it alive for the same interval.
        vec.sweep();
        assert_eq!(vec.collect(), vec![(vec!["tests".to_string()], 25.0)]);

        vec.report(&["tests"], 3.0);
        assert_eq!(vec.collect(), vec![(vec!["tests".to_string()], 25.0)]);
    }

    #[test]
    fn stale_previous_bucket_disappears() {
        let clock = ManualClock::default();
        let vec = vec_with_clock(clock.clone());

        vec.report(&["tests"], 7.0);
        clock.advance_ms(1000);
        vec.report(&["tests"], 3.0);
        // Two intervals later the rotated bucket is no longer exactly one
        // interval old.
        clock.advance_ms(2000);
        assert!(vec.collect().is_empty());
    }

    #[test]
    fn partitions_are_independent() {
        let clock = ManualClock::default();
        let vec = vec_with_clock(clock.clone());

        vec.report(&["a"], 1.0);
        vec.report(&["b"], 2.0);
        clock.advance_ms(1000);
        vec.report(&["a"], 0.0);
        vec.report(&["b"], 0.0);

        let mut snapshot = vec.collect();
        snapshot.sort_by(|x, y| x.0.cmp(&y.0));
        assert_eq!(
            snapshot,
            vec![
                (vec!["a".to_string()], 1.0),
                (vec!["b".to_string()], 2.0),
            ]
        );
    }

    #[test]
    fn sweep_drops_idle_partitions_only() {
        let clock = ManualClock::default();
        let vec = vec_with_clock(clock.clone());

        vec.report(&["idle"], 1.0);
        clock.advance_ms(3000);
        vec.report(&["active"], 2.0);

        assert_eq!(vec.partition_count(), 2);
        vec.sweep();
        assert_eq!(vec.partition_count(), 1);
        assert!(vec.collect().is_empty());

        clock.advance_ms(1000);
        vec.report(&["active"], 0.0);
        assert_eq!(vec.collect(), vec![(vec!["active".to_string()], 2.0)]);
    }

    #[test]
    #[should_panic(expected = "label cardinality mismatch")]
    fn label_cardinality_is_enforced() {
        let vec = vec_with_clock(ManualClock::default());
        vec.report(&["a", "b"], 1.0);
    }
}
