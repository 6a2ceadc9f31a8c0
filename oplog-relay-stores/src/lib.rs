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

//! Publish-sink implementations for oplog-relay.
//!
//! - [`redis`]: production sink with pooled connections and a Lua script
//!   making dedupe-and-publish atomic on the server
//! - [`memory`]: in-process sink for tests, with inspection helpers
//!
//! Both implement [`PublishSink`](oplog_relay_core::sink::PublishSink) and
//! are interchangeable from the pipeline's point of view.

pub mod memory;
pub mod redis;

pub use memory::MemorySink;
pub use redis::{RedisSink, RedisSinkConfig};
