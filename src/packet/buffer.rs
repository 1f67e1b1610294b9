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

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
};
use std::time::Duration;

use crate::common::consts::*;
use crate::common::{FirstLayer, IpProtocol, TcpFlags};
use crate::flow::key::FlowKey;

#[derive(Debug, Clone, Copy)]
pub struct LinkLayer {
    pub offset: usize,
    pub kind: FirstLayer,
}

#[derive(Debug, Clone, Copy)]
pub struct NetworkLayer {
    pub offset: usize,
    pub is_v6: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
    Icmpv4,
    Icmpv6,
}

#[derive(Debug, Clone, Copy)]
pub struct TransportLayer {
    pub offset: usize,
    pub kind: TransportKind,
}

/// Reusable packet slot. The byte buffer grows on demand and is kept for
/// the life of the pool; decoded layers are offsets into it, no per-packet
/// allocation happens on the steady-state path.
pub struct PacketBuffer {
    // owning pool and slot identity, null for detached buffers
    owner: *const PacketPool,
    slot: usize,
    refcnt: AtomicUsize,

    buffer: Vec<u8>,
    pub timestamp: Duration,
    pub packet_nr: u64,
    pub wire_len: usize,
    pub truncated: bool,
    pub label: Option<Arc<str>>,
    pub first_layer: FirstLayer,

    pub link: Option<LinkLayer>,
    pub network: Option<NetworkLayer>,
    pub transport: Option<TransportLayer>,
    pub proto: IpProtocol,
    pub hlen: usize,

    pub key: FlowKey,
    pub forward: bool,
}

impl PacketBuffer {
    /// Detached buffer with no owning pool. `recycle` on references to it
    /// is a no-op; meant for tests and benches.
    pub fn empty() -> Self {
        Self {
            owner: ptr::null(),
            slot: 0,
            refcnt: AtomicUsize::new(1),
            buffer: Vec::new(),
            timestamp: Duration::ZERO,
            packet_nr: 0,
            wire_len: 0,
            truncated: false,
            label: None,
            first_layer: FirstLayer::Ethernet,
            link: None,
            network: None,
            transport: None,
            proto: IpProtocol::Unknown,
            hlen: 0,
            key: FlowKey::Empty,
            forward: true,
        }
    }

    /// Loads capture data into the slot and clears previous decode state.
    pub fn assign(
        &mut self,
        data: &[u8],
        ci: super::source::CaptureInfo,
        first_layer: FirstLayer,
        packet_nr: u64,
        label: Option<Arc<str>>,
    ) -> Duration {
        self.link = None;
        self.network = None;
        self.transport = None;
        self.proto = IpProtocol::Unknown;
        self.hlen = 0;
        self.key = FlowKey::Empty;
        self.forward = true;
        self.refcnt.store(1, Ordering::Relaxed);

        self.buffer.clear();
        self.buffer.extend_from_slice(data);

        self.timestamp = ci.timestamp;
        self.wire_len = ci.wire_len;
        self.truncated = ci.captured_len < ci.wire_len || data.len() < ci.captured_len;
        self.first_layer = first_layer;
        self.packet_nr = packet_nr;
        self.label = label;
        self.timestamp
    }

    pub fn set_flow_info(&mut self, key: FlowKey, forward: bool) {
        self.key = key;
        self.forward = forward;
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn src_ip(&self) -> Option<&[u8]> {
        self.network.map(|n| {
            if n.is_v6 {
                &self.buffer[n.offset + IPV6_SRC_OFFSET..n.offset + IPV6_SRC_OFFSET + IPV6_ADDR_LEN]
            } else {
                &self.buffer[n.offset + IPV4_SRC_OFFSET..n.offset + IPV4_SRC_OFFSET + IPV4_ADDR_LEN]
            }
        })
    }

    pub fn dst_ip(&self) -> Option<&[u8]> {
        self.network.map(|n| {
            if n.is_v6 {
                &self.buffer[n.offset + IPV6_DST_OFFSET..n.offset + IPV6_DST_OFFSET + IPV6_ADDR_LEN]
            } else {
                &self.buffer[n.offset + IPV4_DST_OFFSET..n.offset + IPV4_DST_OFFSET + IPV4_ADDR_LEN]
            }
        })
    }

    /// First port field in wire order. For ICMP these are the type and
    /// code bytes, which never swap during canonicalization.
    pub fn src_port_bytes(&self) -> [u8; 2] {
        match self.transport {
            Some(t) => [self.buffer[t.offset], self.buffer[t.offset + 1]],
            None => [0, 0],
        }
    }

    pub fn dst_port_bytes(&self) -> [u8; 2] {
        match self.transport {
            Some(t) => match t.kind {
                TransportKind::Tcp | TransportKind::Udp => {
                    [self.buffer[t.offset + 2], self.buffer[t.offset + 3]]
                }
                TransportKind::Icmpv4 | TransportKind::Icmpv6 => [0, 0],
            },
            None => [0, 0],
        }
    }

    pub fn tcp_flags(&self) -> Option<TcpFlags> {
        self.transport.and_then(|t| {
            if t.kind != TransportKind::Tcp {
                return None;
            }
            Some(TcpFlags::from_bits_truncate(
                self.buffer[t.offset + TCP_OFFSET_FLAGS] & TcpFlags::MASK.bits(),
            ))
        })
    }
}

impl fmt::Debug for PacketBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuffer")
            .field("packet_nr", &self.packet_nr)
            .field("timestamp", &self.timestamp)
            .field("captured", &self.buffer.len())
            .field("wire_len", &self.wire_len)
            .field("proto", &self.proto)
            .field("truncated", &self.truncated)
            .finish()
    }
}

struct Slot {
    in_use: AtomicBool,
    buffer: UnsafeCell<PacketBuffer>,
}

/// Fixed-capacity arena of packet slots, shared by the capture thread and
/// every consumer. Claiming CASes the slot's in-use flag; exhaustion
/// blocks the producer until a consumer releases. Slot identity is the
/// index, no buffer leaves the pool while it lives.
///
/// SAFETY protocol: a freshly claimed slot is exclusively owned through
/// its `PacketRef`; after `copy()` all owners take shared access only.
/// The slot is reused only after every reference recycled.
pub struct PacketPool {
    slots: Box<[Slot]>,
    free: Mutex<usize>,
    released: Condvar,
    cursor: AtomicUsize,
}

unsafe impl Send for PacketPool {}
unsafe impl Sync for PacketPool {}

impl PacketPool {
    pub fn new(slot_count: usize) -> Arc<Self> {
        assert!(slot_count > 0);
        let slots: Box<[Slot]> = (0..slot_count)
            .map(|i| {
                let mut buffer = PacketBuffer::empty();
                buffer.slot = i;
                Slot {
                    in_use: AtomicBool::new(false),
                    buffer: UnsafeCell::new(buffer),
                }
            })
            .collect();
        let pool = Arc::new(Self {
            slots,
            free: Mutex::new(slot_count),
            released: Condvar::new(),
            cursor: AtomicUsize::new(0),
        });
        let pool_ptr = Arc::as_ptr(&pool);
        for slot in pool.slots.iter() {
            // SAFETY: no references have been handed out yet
            unsafe {
                (*slot.buffer.get()).owner = pool_ptr;
            }
        }
        pool
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn free_slots(&self) -> usize {
        *self.free.lock().unwrap()
    }

    /// Returns an unused slot, blocking while the pool is exhausted.
    pub fn claim(&self) -> PacketRef {
        {
            let mut free = self.free.lock().unwrap();
            while *free == 0 {
                free = self.released.wait(free).unwrap();
            }
            *free -= 1;
        }

        // the reservation above guarantees an unused slot exists
        let n = self.slots.len();
        loop {
            let i = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            let slot = &self.slots[i];
            if slot
                .in_use
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: the CAS above grants exclusive ownership
                unsafe {
                    (*slot.buffer.get()).refcnt.store(1, Ordering::Relaxed);
                }
                return PacketRef {
                    ptr: slot.buffer.get(),
                };
            }
        }
    }

    /// Returns `n` recycled slots to the free count and wakes the
    /// producer.
    pub fn release(&self, n: usize) {
        let mut free = self.free.lock().unwrap();
        *free += n;
        debug_assert!(*free <= self.slots.len());
        self.released.notify_all();
    }
}

/// Counted reference to a pooled packet. Exactly one logical owner unless
/// `copy()` was called; the final `recycle()` returns the slot.
pub struct PacketRef {
    ptr: *mut PacketBuffer,
}

// SAFETY: access is governed by the pool protocol above; a PacketRef is
// moved between threads, never aliased mutably.
unsafe impl Send for PacketRef {}

impl PacketRef {
    /// Adds a logical owner, as when single-shard dispatch copies a whole
    /// batch into the worker ring. From now on all owners must treat the
    /// buffer as read-only.
    pub fn copy(&self) -> PacketRef {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
        PacketRef { ptr: self.ptr }
    }

    /// Drops this reference; the last one clears the slot and returns it
    /// to the pool.
    pub fn recycle(self) {
        // SAFETY: `self.ptr` stays valid while the pool lives
        let buffer = unsafe { &*self.ptr };
        if buffer.refcnt.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if buffer.owner.is_null() {
            // detached test buffer
            return;
        }
        let owner = unsafe { &*buffer.owner };
        owner.slots[buffer.slot].in_use.store(false, Ordering::Release);
        owner.release(1);
    }
}

impl fmt::Debug for PacketRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl Deref for PacketRef {
    type Target = PacketBuffer;

    fn deref(&self) -> &Self::Target {
        // SAFETY: shared access is allowed for any live reference
        unsafe { &*self.ptr }
    }
}

impl DerefMut for PacketRef {
    fn deref_mut(&mut self) -> &mut Self::Target {
        debug_assert_eq!(self.refcnt.load(Ordering::Relaxed), 1);
        // SAFETY: mutable access requires the single logical owner
        unsafe { &mut *self.ptr }
    }
}
