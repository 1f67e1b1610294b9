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

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::batch::BatchProducer;
use super::buffer::PacketPool;
use crate::common::FirstLayer;
use crate::counter::PipelineCounter;

/// Capture metadata handed over by the packet source.
#[derive(Debug, Clone, Copy)]
pub struct CaptureInfo {
    /// capture time, nanosecond precision
    pub timestamp: Duration,
    /// length on the wire
    pub wire_len: usize,
    /// bytes actually captured (snap length)
    pub captured_len: usize,
}

/// Entry point for the packet source: claims a pool slot per packet,
/// decodes it in place, and publishes filled batches into the dispatch
/// ring. Malformed packets are counted and dropped here.
pub struct PacketInjector {
    pool: Arc<PacketPool>,
    producer: BatchProducer,
    current: Option<Box<super::batch::PacketBatch>>,
    counter: Arc<PipelineCounter>,
    received: u64,
}

impl PacketInjector {
    pub fn new(
        pool: Arc<PacketPool>,
        producer: BatchProducer,
        counter: Arc<PipelineCounter>,
    ) -> Self {
        Self {
            pool,
            producer,
            current: None,
            counter,
            received: 0,
        }
    }

    /// `packet_nr` is the source's own sequence number and travels with
    /// the packet into the flow record.
    pub fn inject(
        &mut self,
        data: &[u8],
        ci: CaptureInfo,
        first_layer: FirstLayer,
        packet_nr: u64,
        label: Option<Arc<str>>,
    ) {
        self.received += 1;
        self.counter.rx.fetch_add(1, Ordering::Relaxed);
        self.counter
            .rx_bytes
            .fetch_add(ci.wire_len as u64, Ordering::Relaxed);

        let mut packet = self.pool.claim();
        packet.assign(data, ci, first_layer, packet_nr, label);
        if !packet.decode() {
            self.counter.decode_failures.fetch_add(1, Ordering::Relaxed);
            packet.recycle();
            return;
        }

        if self.current.is_none() {
            self.current = Some(self.producer.pop_empty());
        }
        let batch = self.current.as_mut().unwrap();
        batch.push(packet);
        if batch.is_full() {
            let batch = self.current.take().unwrap();
            self.counter.batches.fetch_add(1, Ordering::Relaxed);
            self.producer.publish(batch);
        }
    }

    /// Publishes the partially filled batch, if any.
    pub fn flush(&mut self) {
        if let Some(batch) = self.current.take() {
            if batch.is_empty() {
                return;
            }
            self.counter.batches.fetch_add(1, Ordering::Relaxed);
            self.producer.publish(batch);
        }
    }

    /// Flushes and signals EOF downstream.
    pub fn close(mut self) {
        self.flush();
        debug!("packet source closed after {} packets", self.received);
        self.producer.close();
    }
}
