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

use std::fmt;
use std::time::Duration;

use super::buffer::PacketRef;
use crate::utils::queue::{self, bounded, Receiver, Sender};

/// Shallow batch of packet references plus a timestamp summary (the max
/// capture time in the batch). A batch carrying a tick asks the worker to
/// sweep its table with the dispatcher's clock instead of new packets.
pub struct PacketBatch {
    packets: Vec<PacketRef>,
    capacity: usize,
    timestamp: Duration,
    tick: Option<Duration>,
}

impl PacketBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            packets: Vec::with_capacity(capacity),
            capacity,
            timestamp: Duration::ZERO,
            tick: None,
        }
    }

    pub fn push(&mut self, packet: PacketRef) {
        debug_assert!(self.packets.len() < self.capacity);
        if packet.timestamp > self.timestamp {
            self.timestamp = packet.timestamp;
        }
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.packets.len() >= self.capacity
    }

    /// Max capture timestamp of the packets pushed so far.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn mark_tick(&mut self, now: Duration) {
        self.tick = Some(now);
    }

    pub fn tick(&self) -> Option<Duration> {
        self.tick
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, PacketRef> {
        self.packets.drain(..)
    }

    /// Keeps the packets `keep` approves, in order; rejected packets are
    /// recycled on the spot.
    pub fn retain<F: FnMut(&mut PacketRef) -> bool>(&mut self, mut keep: F) {
        let mut kept = 0;
        for i in 0..self.packets.len() {
            if keep(&mut self.packets[i]) {
                self.packets.swap(kept, i);
                kept += 1;
            }
        }
        for packet in self.packets.drain(kept..) {
            packet.recycle();
        }
    }

    /// Shallow copy into `dst`: every reference gains a counted owner, so
    /// both batches recycle independently. Used by single-shard dispatch
    /// to hand a whole capture batch to the worker ring.
    pub fn copy_into(&self, dst: &mut PacketBatch) {
        for packet in &self.packets {
            dst.push(packet.copy());
        }
    }

    pub fn reset(&mut self) {
        debug_assert!(self.packets.is_empty(), "resetting a batch with live refs");
        self.packets.clear();
        self.timestamp = Duration::ZERO;
        self.tick = None;
    }
}

impl fmt::Debug for PacketBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBatch")
            .field("len", &self.packets.len())
            .field("timestamp", &self.timestamp)
            .field("tick", &self.tick)
            .finish()
    }
}

/// Builds the empty/full queue pair of one ring, pre-seeding the empty
/// side. Producers pop empty, fill, publish; consumers pop full, drain,
/// recycle. Closing the full side is the EOF signal and remaining batches
/// drain first.
pub fn batch_ring(batches: usize, batch_size: usize) -> (BatchProducer, BatchConsumer) {
    assert!(batches >= 2, "ring needs room for a tick and a batch");
    let (empty_tx, empty_rx) = bounded(batches);
    let (full_tx, full_rx) = bounded(batches);
    for _ in 0..batches {
        empty_tx
            .send(Box::new(PacketBatch::with_capacity(batch_size)))
            .unwrap();
    }
    (
        BatchProducer {
            empty: empty_rx,
            full: full_tx,
        },
        BatchConsumer {
            full: full_rx,
            empty: empty_tx,
        },
    )
}

pub struct BatchProducer {
    empty: Receiver<Box<PacketBatch>>,
    full: Sender<Box<PacketBatch>>,
}

impl BatchProducer {
    /// Blocks while the consumer owns every batch: this is the ring's
    /// backpressure.
    pub fn pop_empty(&self) -> Box<PacketBatch> {
        self.empty.recv(None).expect("batch ring dismantled")
    }

    /// Pushing after close is a programmer error, hence fatal.
    pub fn publish(&self, batch: Box<PacketBatch>) {
        self.full.send(batch).expect("batch ring closed");
    }

    /// EOF signal to the consumer.
    pub fn close(&self) {
        self.full.close();
    }
}

pub struct BatchConsumer {
    full: Receiver<Box<PacketBatch>>,
    empty: Sender<Box<PacketBatch>>,
}

impl BatchConsumer {
    /// Next full batch; `None` once the ring is closed and drained.
    pub fn pop_full(&self) -> Option<Box<PacketBatch>> {
        self.full.recv(None).ok()
    }

    /// Returns a batch to the empty side, releasing any packet references
    /// still in it. The producer may already be gone during shutdown,
    /// which is fine.
    pub fn recycle(&self, mut batch: Box<PacketBatch>) {
        for packet in batch.drain() {
            packet.recycle();
        }
        batch.reset();
        if let Err(queue::Error::Terminated(_)) = self.empty.send(batch) {
            // shutdown, batch dropped
        }
    }
}
