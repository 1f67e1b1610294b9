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

use std::time::Duration;

use super::node::{TcpFlow, TimerEntry, TimerKind, UniFlow};
use crate::export::FeatureRecord;

pub trait Recyclable {
    fn reset(&mut self);
}

/// Bounded free list. Returns beyond `size` are dropped, which keeps the
/// steady-state footprint flat after a burst.
pub struct MemoryPool<T: Recyclable> {
    size: usize,
    objs: Vec<Box<T>>,
}

impl<T: Recyclable> MemoryPool<T> {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            objs: Vec::with_capacity(size),
        }
    }

    pub fn get(&mut self) -> Option<Box<T>> {
        self.objs.pop()
    }

    pub fn put(&mut self, mut obj: Box<T>) {
        if self.objs.len() >= self.size {
            return;
        }

        obj.reset();
        self.objs.push(obj);
    }

    pub fn len(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }
}

/// Shard-local pool registry. One free list per concrete flow variant plus
/// the feature records and timer entries they reference. Never shared
/// across threads.
pub struct FlowPools {
    pub tcp: MemoryPool<TcpFlow>,
    pub uni: MemoryPool<UniFlow>,
    pub features: MemoryPool<FeatureRecord>,
    pub timers: MemoryPool<TimerEntry>,
}

impl FlowPools {
    pub fn new(size: usize) -> Self {
        Self {
            tcp: MemoryPool::new(size),
            uni: MemoryPool::new(size),
            features: MemoryPool::new(size),
            // two timers per live flow
            timers: MemoryPool::new(size * 2),
        }
    }

    pub fn feature_record(&mut self) -> Box<FeatureRecord> {
        self.features.get().unwrap_or_default()
    }

    pub fn timer(&mut self, when: Duration, kind: TimerKind) -> Box<TimerEntry> {
        let mut entry = self.timers.get().unwrap_or_default();
        entry.when = when;
        entry.kind = kind;
        entry
    }
}
