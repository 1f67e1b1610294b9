/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Packet-to-flow metering engine.
//!
//! Captured packets are claimed from a fixed [`packet::PacketPool`], decoded
//! in place, batched, and handed through bounded rings to shard workers. Each
//! worker owns one [`flow::FlowTable`] keyed by the canonical five-tuple and
//! exports a [`export::FlowRecord`] whenever a flow ends, whether by TCP
//! teardown, idle or active timeout, or end of stream.

pub mod common;
pub mod config;
pub mod counter;
pub mod dispatcher;
pub mod error;
pub mod export;
pub mod flow;
pub mod packet;
pub mod utils;

pub use config::{Config, KeyMode};
pub use dispatcher::{run_dispatch, EventPipeline, PipelineBuilder};
pub use error::{Error, Result};
pub use export::{FlowEndReason, FlowRecord, RecordSink};
