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

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use super::key::FlowKey;
use super::node::{Flow, TimerKind};
use super::pool::FlowPools;
use crate::counter::PipelineCounter;
use crate::export::{FlowEndReason, FlowRecord, RecordSink};
use crate::packet::{PacketBuffer, TransportKind};
use crate::utils::hasher::FnvHasher;

/// Builds a flow for its first packet, pulling from the typed pools.
pub type FlowCreator = fn(&PacketBuffer, &mut FlowContext, FlowKey, Duration) -> Flow;

/// Everything a creator needs from the owning table.
pub struct FlowContext<'a> {
    pub pools: &'a mut FlowPools,
    pub active_timeout: Duration,
    pub idle_timeout: Duration,
}

impl FlowContext<'_> {
    fn init_base(&mut self, flow: &mut Flow, key: FlowKey, when: Duration, packet: &PacketBuffer) {
        let mut features = self.pools.feature_record();
        features.start(packet);

        let base = flow.base_mut();
        base.key = key;
        base.first_seen = when;
        base.last_seen = when;
        base.active = true;
        base.features = Some(features);
        base.idle_timer = Some(self.pools.timer(when + self.idle_timeout, TimerKind::Idle));
        base.active_timer = Some(self.pools.timer(when + self.active_timeout, TimerKind::Active));
    }
}

/// TCP packets get a `TcpFlow`, everything else a `UniFlow`.
pub fn default_flow_creator(
    packet: &PacketBuffer,
    ctx: &mut FlowContext,
    key: FlowKey,
    when: Duration,
) -> Flow {
    let is_tcp = packet
        .transport
        .map(|t| t.kind == TransportKind::Tcp)
        .unwrap_or(false);
    let mut flow = if is_tcp {
        Flow::Tcp(ctx.pools.tcp.get().unwrap_or_default())
    } else {
        Flow::Uni(ctx.pools.uni.get().unwrap_or_default())
    };
    ctx.init_base(&mut flow, key, when, packet);
    flow
}

/// Per-shard flow table. Single threaded; the shard worker is its only
/// caller. Expired and terminated flows are emitted through the sink and
/// recycled into the shard-local pools.
pub struct FlowTable {
    flows: HashMap<FlowKey, Flow, FnvHasher>,
    new_flow: FlowCreator,
    active_timeout: Duration,
    idle_timeout: Duration,
    now: Duration,
    pools: FlowPools,
    sink: Arc<dyn RecordSink>,
    counter: Arc<PipelineCounter>,
    eof: bool,
    shard_id: usize,
}

impl FlowTable {
    pub fn new(
        shard_id: usize,
        new_flow: FlowCreator,
        active_timeout: Duration,
        idle_timeout: Duration,
        pool_capacity: usize,
        sink: Arc<dyn RecordSink>,
        counter: Arc<PipelineCounter>,
    ) -> Self {
        Self {
            flows: HashMap::with_hasher(FnvHasher::default()),
            new_flow,
            active_timeout,
            idle_timeout,
            now: Duration::ZERO,
            pools: FlowPools::new(pool_capacity),
            sink,
            counter,
            eof: false,
            shard_id,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    /// Applies one keyed packet. Advances the table clock, expires a stale
    /// entry under this key synchronously, creates the flow if absent, and
    /// delivers the packet to it.
    pub fn event(&mut self, packet: &PacketBuffer) {
        let when = packet.timestamp;
        if when < self.now {
            panic!(
                "shard {}: clock regression {:?} -> {:?}, upstream must not reorder",
                self.shard_id, self.now, when
            );
        }
        self.now = when;
        let key = packet.key;

        if let Some(flow) = self.flows.get_mut(&key) {
            if when > flow.base().next_event() {
                let reason = flow.base().timeout_reason(when);
                let last_seen = flow.base().last_seen;
                Self::export_flow(
                    &*self.sink,
                    &mut self.pools,
                    &self.counter,
                    flow,
                    reason,
                    last_seen,
                );
                self.remove(&key);
            }
        }

        if !self.flows.contains_key(&key) {
            let mut ctx = FlowContext {
                pools: &mut self.pools,
                active_timeout: self.active_timeout,
                idle_timeout: self.idle_timeout,
            };
            let flow = (self.new_flow)(packet, &mut ctx, key, when);
            self.flows.insert(key, flow);
            self.counter
                .flows_created
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let flow = self.flows.get_mut(&key).unwrap();
        if let Some(reason) = flow.on_packet(packet, when, self.idle_timeout) {
            Self::export_flow(&*self.sink, &mut self.pools, &self.counter, flow, reason, when);
            self.remove(&key);
        }
    }

    /// Full scan over all flows, expiring those past their deadline. O(n)
    /// on purpose: a periodic sweep beats a timer heap at millions of
    /// flows and coarse expiry intervals. `when` is the dispatcher's clock
    /// at the tick; the shard clock is not advanced by it.
    pub fn expire_at(&mut self, when: Duration) {
        let when = when.max(self.now);
        let due: Vec<(FlowKey, FlowEndReason)> = self
            .flows
            .iter()
            .filter(|(_, flow)| when > flow.base().next_event())
            .map(|(key, flow)| (*key, flow.base().timeout_reason(when)))
            .collect();

        if !due.is_empty() {
            debug!("shard {}: expiring {} flows", self.shard_id, due.len());
        }
        for (key, reason) in due {
            let flow = self.flows.get_mut(&key).unwrap();
            let last_seen = flow.base().last_seen;
            Self::export_flow(
                &*self.sink,
                &mut self.pools,
                &self.counter,
                flow,
                reason,
                last_seen,
            );
            self.remove(&key);
        }
    }

    /// Sweep using the shard's own clock.
    pub fn expire(&mut self) {
        self.expire_at(self.now);
    }

    /// Drops the entry and returns the flow to its pool. No-op while the
    /// EOF drain is in progress so that the drain loop stays sound.
    pub fn remove(&mut self, key: &FlowKey) {
        if self.eof {
            return;
        }
        if let Some(flow) = self.flows.remove(key) {
            Self::recycle_flow(&mut self.pools, flow);
        }
    }

    /// Flushes every remaining flow: overdue ones with their timeout
    /// reason, the rest with `Eof`. Leaves the table empty and reusable.
    pub fn eof(&mut self, now: Duration) {
        self.eof = true;
        let flows = mem::replace(&mut self.flows, HashMap::with_hasher(FnvHasher::default()));
        debug!("shard {}: eof with {} live flows", self.shard_id, flows.len());
        for (_, mut flow) in flows {
            let (reason, end) = if now > flow.base().next_event() {
                (flow.base().timeout_reason(now), flow.base().last_seen)
            } else {
                (FlowEndReason::Eof, flow.base().last_seen)
            };
            Self::export_flow(&*self.sink, &mut self.pools, &self.counter, &mut flow, reason, end);
            Self::recycle_flow(&mut self.pools, flow);
        }
        self.eof = false;
    }

    /// Emits the record for a still-mapped flow and marks it inactive.
    /// Exactly one export happens per flow instance; the recycle follows
    /// in `remove` (or directly during the EOF drain).
    fn export_flow(
        sink: &dyn RecordSink,
        pools: &mut FlowPools,
        counter: &PipelineCounter,
        flow: &mut Flow,
        reason: FlowEndReason,
        last_seen: Duration,
    ) {
        let base = flow.base_mut();
        debug_assert!(base.active, "flow exported twice");
        base.active = false;

        let mut features = base.features.take().unwrap_or_default();
        sink.emit(FlowRecord {
            key: base.key,
            first_seen: base.first_seen,
            last_seen,
            reason,
            features: mem::take(&mut *features),
        });
        pools.features.put(features);
        counter
            .flows_exported
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn recycle_flow(pools: &mut FlowPools, mut flow: Flow) {
        let base = flow.base_mut();
        if let Some(timer) = base.idle_timer.take() {
            pools.timers.put(timer);
        }
        if let Some(timer) = base.active_timer.take() {
            pools.timers.put(timer);
        }
        if let Some(features) = base.features.take() {
            pools.features.put(features);
        }
        match flow {
            Flow::Tcp(f) => pools.tcp.put(f),
            Flow::Uni(f) => pools.uni.put(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FirstLayer;
    use crate::export::CollectSink;
    use crate::flow::key::KeySelector;
    use crate::packet::testutil::{decoded_packet, tcp_frame, udp_frame};

    const ACTIVE: Duration = Duration::from_secs(300);
    const IDLE: Duration = Duration::from_secs(10);

    fn table(sink: Arc<CollectSink>) -> FlowTable {
        FlowTable::new(
            0,
            default_flow_creator,
            ACTIVE,
            IDLE,
            64,
            sink,
            Arc::new(PipelineCounter::default()),
        )
    }

    fn keyed_packet(frame: &[u8], ts: Duration) -> crate::packet::PacketBuffer {
        let mut packet = decoded_packet(frame, FirstLayer::Ethernet);
        packet.timestamp = ts;
        let (key, forward) = KeySelector::FiveTuple.extract(&packet).unwrap();
        packet.set_flow_info(key, forward);
        packet
    }

    #[test]
    fn udp_pair_single_flow() {
        let sink = Arc::new(CollectSink::new());
        let mut tab = table(sink.clone());

        let req = udp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000);
        let rsp = udp_frame([10, 0, 0, 2], 2000, [10, 0, 0, 1], 1000);
        tab.event(&keyed_packet(&req, Duration::from_secs(1)));
        tab.event(&keyed_packet(&rsp, Duration::from_secs(2)));

        assert_eq!(tab.len(), 1);
        tab.eof(Duration::from_secs(2));
        assert_eq!(tab.len(), 0);

        let records = sink.take();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.reason, FlowEndReason::Eof);
        assert_eq!(record.features.packets, [1, 1]);
        assert_eq!(record.first_seen, Duration::from_secs(1));
        assert_eq!(record.last_seen, Duration::from_secs(2));
    }

    #[test]
    fn tcp_fin_handshake_exports_end() {
        let sink = Arc::new(CollectSink::new());
        let mut tab = table(sink.clone());

        let a = [10, 0, 0, 1];
        let b = [10, 0, 0, 2];
        let steps: Vec<(Vec<u8>, u64)> = vec![
            (tcp_frame(a, 1000, b, 2000, 0x02), 1), // SYN
            (tcp_frame(b, 2000, a, 1000, 0x12), 2), // SYN|ACK
            (tcp_frame(a, 1000, b, 2000, 0x18), 3), // PSH|ACK data
            (tcp_frame(a, 1000, b, 2000, 0x11), 4), // FIN|ACK src
            (tcp_frame(b, 2000, a, 1000, 0x10), 5), // ACK dst
            (tcp_frame(b, 2000, a, 1000, 0x11), 6), // FIN|ACK dst
            (tcp_frame(a, 1000, b, 2000, 0x10), 7), // final ACK
        ];
        for (frame, ts) in &steps {
            tab.event(&keyed_packet(frame, Duration::from_secs(*ts)));
        }

        assert_eq!(tab.len(), 0, "flow must be gone after the final ACK");
        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, FlowEndReason::End);
        assert_eq!(records[0].last_seen, Duration::from_secs(7));
        assert_eq!(records[0].features.total_packets(), 7);
    }

    #[test]
    fn tcp_rst_exports_end_immediately() {
        let sink = Arc::new(CollectSink::new());
        let mut tab = table(sink.clone());

        let a = [10, 0, 0, 1];
        let b = [10, 0, 0, 2];
        tab.event(&keyed_packet(
            &tcp_frame(a, 1000, b, 2000, 0x02),
            Duration::from_secs(1),
        ));
        tab.event(&keyed_packet(
            &tcp_frame(a, 1000, b, 2000, 0x18),
            Duration::from_secs(2),
        ));
        tab.event(&keyed_packet(
            &tcp_frame(b, 2000, a, 1000, 0x04),
            Duration::from_secs(3),
        ));

        assert_eq!(tab.len(), 0);
        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, FlowEndReason::End);
    }

    #[test]
    fn idle_expiry_on_sweep() {
        let sink = Arc::new(CollectSink::new());
        let mut tab = table(sink.clone());

        let first = udp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000);
        tab.event(&keyed_packet(&first, Duration::ZERO));

        // second flow arrives after the first went idle
        let second = udp_frame([10, 0, 0, 3], 1000, [10, 0, 0, 4], 2000);
        tab.event(&keyed_packet(&second, Duration::from_secs(11)));
        tab.expire();

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, FlowEndReason::Idle);
        assert_eq!(records[0].last_seen, Duration::ZERO);
        assert_eq!(tab.len(), 1, "the fresh flow must survive the sweep");
    }

    #[test]
    fn stale_entry_expired_on_event() {
        let sink = Arc::new(CollectSink::new());
        let mut tab = table(sink.clone());

        let frame = udp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000);
        tab.event(&keyed_packet(&frame, Duration::ZERO));
        // same key, past the idle deadline: old flow exported, new one made
        tab.event(&keyed_packet(&frame, Duration::from_secs(20)));

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, FlowEndReason::Idle);
        assert_eq!(tab.len(), 1);
        assert_eq!(
            tab.counter.flows_created.load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn active_timeout_fires_before_idle() {
        let sink = Arc::new(CollectSink::new());
        let mut tab = table(sink.clone());

        let frame = udp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000);
        // keep the flow busy past the active timeout
        let mut ts = Duration::ZERO;
        while ts <= ACTIVE {
            tab.event(&keyed_packet(&frame, ts));
            ts += Duration::from_secs(5);
        }
        tab.expire_at(ts);

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, FlowEndReason::Active);
    }

    #[test]
    #[should_panic(expected = "clock regression")]
    fn clock_regression_is_fatal() {
        let sink = Arc::new(CollectSink::new());
        let mut tab = table(sink);

        let frame = udp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000);
        tab.event(&keyed_packet(&frame, Duration::from_secs(5)));
        tab.event(&keyed_packet(&frame, Duration::from_secs(4)));
    }

    #[test]
    fn flows_recycled_into_pools() {
        let sink = Arc::new(CollectSink::new());
        let mut tab = table(sink);

        let frame = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0x02);
        tab.event(&keyed_packet(&frame, Duration::from_secs(1)));
        tab.eof(Duration::from_secs(1));

        assert_eq!(tab.pools.tcp.len(), 1);
        assert_eq!(tab.pools.features.len(), 1);
        assert_eq!(tab.pools.timers.len(), 2);
    }
}
