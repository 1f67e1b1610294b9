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

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::TcpFlags;
use crate::flow::key::FlowKey;
use crate::flow::pool::Recyclable;
use crate::packet::PacketBuffer;

/// Why a flow was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowEndReason {
    /// no traffic for the idle timeout
    Idle,
    /// flow lived past the active timeout
    Active,
    /// protocol termination, TCP FIN exchange or RST
    End,
    /// stream ended before any timeout
    Eof,
}

pub const DIRECTION_FORWARD: usize = 0;
pub const DIRECTION_REVERSE: usize = 1;

/// Per-flow accumulator fed with every packet of the flow. Obtained from
/// the owning table's pool and drained into the record on export.
#[derive(Debug, Default, Clone)]
pub struct FeatureRecord {
    pub packets: [u64; 2],
    pub bytes: [u64; 2],
    pub tcp_flags: [TcpFlags; 2],
    pub first_packet_nr: u64,
    pub label: Option<Arc<str>>,
}

impl FeatureRecord {
    pub fn start(&mut self, packet: &PacketBuffer) {
        self.first_packet_nr = packet.packet_nr;
        self.label = packet.label.clone();
    }

    pub fn update(&mut self, packet: &PacketBuffer) {
        let direction = if packet.forward {
            DIRECTION_FORWARD
        } else {
            DIRECTION_REVERSE
        };
        self.packets[direction] += 1;
        self.bytes[direction] += packet.wire_len as u64;
        if let Some(flags) = packet.tcp_flags() {
            self.tcp_flags[direction] |= flags;
        }
    }

    pub fn total_packets(&self) -> u64 {
        self.packets[DIRECTION_FORWARD] + self.packets[DIRECTION_REVERSE]
    }
}

impl Recyclable for FeatureRecord {
    fn reset(&mut self) {
        *self = Default::default();
    }
}

/// Final output of a terminated flow.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub first_seen: Duration,
    pub last_seen: Duration,
    pub reason: FlowEndReason,
    pub features: FeatureRecord,
}

/// Consumes exported records. Called synchronously from shard workers, so
/// implementations must be thread safe.
pub trait RecordSink: Send + Sync {
    fn emit(&self, record: FlowRecord);
}

/// Buffers records in memory. Handy for tests and small offline runs.
#[derive(Default)]
pub struct CollectSink {
    records: Mutex<Vec<FlowRecord>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn take(&self) -> Vec<FlowRecord> {
        std::mem::take(&mut self.records.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordSink for CollectSink {
    fn emit(&self, record: FlowRecord) {
        self.records.lock().unwrap().push(record);
    }
}
