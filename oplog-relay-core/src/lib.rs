//! Oplog Relay Core - CDC Bridge from the MongoDB Oplog to Pub/Sub
//!
//! This crate provides the pipeline for tailing a replica set's oplog and
//! republishing every document mutation as a compact JSON message: which
//! document changed, how, and which fields were touched. Delivery is
//! at-least-once, deduplicated across redundant relay instances by the sink.
//!
//! # Key Components
//!
//! - **Entries**: [`entry`] parses raw oplog records and flattens
//!   transactions; [`position`] is the resumable oplog position codec
//! - **Diffing**: [`diff`] extracts changed field paths from both legacy and
//!   v2 update encodings
//! - **Pipeline**: [`tailer`] owns the cursor and resume policy,
//!   [`processor`] renders publications, [`publisher`] delivers them and
//!   checkpoints progress through a [`sink::PublishSink`]
//! - **Controls**: [`denylist`] for runtime suppression rules, [`config`]
//!   for validated settings, [`metrics`] and [`interval_max`] for
//!   observability
//!
//! # Example
//!
//! ```rust
//! use oplog_relay_core::config::RelayConfig;
//! use oplog_relay_core::diff::DiffMode;
//!
//! let config = RelayConfig::builder()
//!     .with_mongo_url("mongodb://localhost:27017/?replicaSet=rs0")
//!     .with_diff_mode(DiffMode::Deep)
//!     .build()
//!     .expect("valid configuration");
//! assert_eq!(config.queue_size, 10_000);
//! ```

pub mod config;
pub mod denylist;
pub mod diff;
pub mod entry;
pub mod interval_max;
pub mod metrics;
pub mod position;
pub mod processor;
pub mod publication;
pub mod publisher;
pub mod sink;
pub mod tailer;

pub use config::{ConfigError, RelayConfig};
pub use diff::DiffMode;
pub use position::LogPosition;
pub use publication::Publication;
pub use sink::{PublishOutcome, PublishSink, SinkError};
