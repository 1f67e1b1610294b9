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

use super::key::FlowKey;
use super::pool::Recyclable;
use crate::common::TcpFlags;
use crate::export::{FeatureRecord, FlowEndReason};
use crate::packet::PacketBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Idle,
    Active,
}

impl Default for TimerKind {
    fn default() -> Self {
        TimerKind::Idle
    }
}

/// Pooled expiry deadline. Each flow holds one idle and one active entry;
/// the flow's next-event time is the earlier of the two.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerEntry {
    pub when: Duration,
    pub kind: TimerKind,
}

impl Recyclable for TimerEntry {
    fn reset(&mut self) {
        *self = Default::default();
    }
}

/// State common to all flow variants.
#[derive(Debug, Default)]
pub struct BaseFlow {
    pub key: FlowKey,
    pub first_seen: Duration,
    pub last_seen: Duration,
    pub active: bool,
    pub features: Option<Box<FeatureRecord>>,
    pub idle_timer: Option<Box<TimerEntry>>,
    pub active_timer: Option<Box<TimerEntry>>,
}

impl BaseFlow {
    /// Earliest deadline. The idle timer moves with every packet, the
    /// active timer is pinned at `first_seen + active_timeout`, so this is
    /// `min(first_seen + active_timeout, last_seen + idle_timeout)`.
    pub fn next_event(&self) -> Duration {
        match (&self.idle_timer, &self.active_timer) {
            (Some(idle), Some(active)) => idle.when.min(active.when),
            (Some(idle), None) => idle.when,
            (None, Some(active)) => active.when,
            (None, None) => Duration::MAX,
        }
    }

    /// Which timeout has fired at `when`. The earlier deadline wins; on a
    /// tie the active timeout takes precedence.
    pub fn timeout_reason(&self, when: Duration) -> FlowEndReason {
        let idle_at = self.idle_timer.as_ref().map(|t| t.when).unwrap_or(Duration::MAX);
        let active_at = self
            .active_timer
            .as_ref()
            .map(|t| t.when)
            .unwrap_or(Duration::MAX);
        if active_at <= idle_at && when > active_at {
            FlowEndReason::Active
        } else {
            FlowEndReason::Idle
        }
    }

    fn touch(&mut self, when: Duration, idle_timeout: Duration) {
        debug_assert!(when >= self.last_seen);
        self.last_seen = when;
        if let Some(idle) = self.idle_timer.as_mut() {
            idle.when = when + idle_timeout;
        }
    }
}

/// TCP flow with teardown detection: a FIN/ACK pair exchange detector, not
/// a full TCP state machine. Half-closed flows fall back to the idle
/// timeout.
#[derive(Debug, Default)]
pub struct TcpFlow {
    pub base: BaseFlow,
    src_fin: bool,
    src_ack: bool,
    dst_fin: bool,
    dst_ack: bool,
}

impl TcpFlow {
    /// Returns true when the flow has terminated: immediately on RST, or
    /// once both FINs have been acknowledged.
    fn observe(&mut self, forward: bool, flags: TcpFlags) -> bool {
        if flags.contains(TcpFlags::RST) {
            return true;
        }
        if forward {
            if flags.contains(TcpFlags::FIN) {
                self.src_fin = true;
            }
            if self.dst_fin && flags.contains(TcpFlags::ACK) {
                self.dst_ack = true;
            }
        } else {
            if flags.contains(TcpFlags::FIN) {
                self.dst_fin = true;
            }
            if self.src_fin && flags.contains(TcpFlags::ACK) {
                self.src_ack = true;
            }
        }

        self.src_fin && self.src_ack && self.dst_fin && self.dst_ack
    }
}

impl Recyclable for TcpFlow {
    fn reset(&mut self) {
        *self = Default::default();
    }
}

/// Catch-all variant for non-TCP traffic; ends only by timeout or EOF.
#[derive(Debug, Default)]
pub struct UniFlow {
    pub base: BaseFlow,
}

impl Recyclable for UniFlow {
    fn reset(&mut self) {
        *self = Default::default();
    }
}

/// Tagged flow variants. Adding a variant means extending this enum and
/// the per-type pool registry.
#[derive(Debug)]
pub enum Flow {
    Tcp(Box<TcpFlow>),
    Uni(Box<UniFlow>),
}

impl Flow {
    pub fn base(&self) -> &BaseFlow {
        match self {
            Flow::Tcp(f) => &f.base,
            Flow::Uni(f) => &f.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseFlow {
        match self {
            Flow::Tcp(f) => &mut f.base,
            Flow::Uni(f) => &mut f.base,
        }
    }

    /// Applies one packet: updates timestamps and deadlines, feeds the
    /// feature accumulator, then runs variant logic. Returns the end
    /// reason when a protocol end condition fired.
    pub fn on_packet(
        &mut self,
        packet: &PacketBuffer,
        when: Duration,
        idle_timeout: Duration,
    ) -> Option<FlowEndReason> {
        let base = self.base_mut();
        base.touch(when, idle_timeout);
        if let Some(features) = base.features.as_mut() {
            features.update(packet);
        }

        match self {
            Flow::Tcp(flow) => {
                let flags = packet.tcp_flags().unwrap_or_default();
                if flow.observe(packet.forward, flags) {
                    return Some(FlowEndReason::End);
                }
                None
            }
            Flow::Uni(_) => None,
        }
    }
}
