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

//! Complete relay wiring: MongoDB oplog in, Redis pub/sub out.
//!
//! Run against a replica set and a Redis instance:
//!
//! ```text
//! MONGO_URL=mongodb://localhost:27017/?replicaSet=rs0 \
//! REDIS_URL=redis://localhost:6379 \
//! cargo run --example relay
//! ```
//!
//! Then subscribe to a collection channel (`SUBSCRIBE tests.Foo` in
//! redis-cli) and mutate documents to watch messages flow.

use oplog_relay_core::config::RelayConfig;
use oplog_relay_core::denylist::Denylist;
use oplog_relay_core::publisher::Publisher;
use oplog_relay_core::tailer::Tailer;
use oplog_relay_core::{metrics, PublishSink};
use oplog_relay_stores::redis::{RedisSink, RedisSinkConfig};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    metrics::describe_metrics();

    let mongo_url =
        std::env::var("MONGO_URL").unwrap_or_else(|_| "mongodb://localhost:27017".to_string());
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let config = RelayConfig::builder().with_mongo_url(mongo_url).build()?;

    let sink: Arc<dyn PublishSink> = Arc::new(
        RedisSink::new(RedisSinkConfig::builder().url(redis_url).build()?).await?,
    );
    let denylist = Arc::new(RwLock::new(Denylist::new()));

    let tailer = Tailer::connect(config.clone(), Arc::clone(&sink), denylist).await?;
    let publisher = Publisher::new(sink, &config);

    let (queue_tx, queue_rx) = mpsc::channel(config.queue_size);
    let (shutdown_tx, _) = broadcast::channel(1);

    let publish_task = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { publisher.run(queue_rx, shutdown).await })
    };

    let tail_shutdown = shutdown_tx.subscribe();
    let tail_task = tokio::spawn(async move { tailer.run(queue_tx, tail_shutdown).await });

    info!("relay running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(());

    if let Err(e) = tail_task.await? {
        error!(error = %e, "tail loop exited with error");
    }
    publish_task.await?;

    Ok(())
}
