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

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Copy, Debug)]
pub enum CounterType {
    Counted,
    Gauged,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CounterValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

pub type Counter = (&'static str, CounterType, CounterValue);

pub trait RefCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
}

/// Hot-path statistics. Drops are counted, never logged per packet.
#[derive(Debug, Default)]
pub struct PipelineCounter {
    pub rx: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub batches: AtomicU64,
    pub decode_failures: AtomicU64,
    pub no_key: AtomicU64,
    pub flows_created: AtomicU64,
    pub flows_exported: AtomicU64,
}

impl RefCountable for PipelineCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rx",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx.swap(0, Ordering::Relaxed)),
            ),
            (
                "rx_bytes",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx_bytes.swap(0, Ordering::Relaxed)),
            ),
            (
                "batches",
                CounterType::Counted,
                CounterValue::Unsigned(self.batches.swap(0, Ordering::Relaxed)),
            ),
            (
                "decode_failures",
                CounterType::Counted,
                CounterValue::Unsigned(self.decode_failures.swap(0, Ordering::Relaxed)),
            ),
            (
                "no_key",
                CounterType::Counted,
                CounterValue::Unsigned(self.no_key.swap(0, Ordering::Relaxed)),
            ),
            (
                "flows_created",
                CounterType::Counted,
                CounterValue::Unsigned(self.flows_created.swap(0, Ordering::Relaxed)),
            ),
            (
                "flows_exported",
                CounterType::Counted,
                CounterValue::Unsigned(self.flows_exported.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}
