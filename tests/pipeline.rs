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

//! End-to-end scenarios: capture bytes in, flow records out, through the
//! pool, the rings, and the shard workers.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flowmeter::common::FirstLayer;
use flowmeter::counter::PipelineCounter;
use flowmeter::export::{CollectSink, FlowEndReason, FlowRecord};
use flowmeter::flow::KeySelector;
use flowmeter::packet::testutil::{decoded_packet, icmpv4_frame, tcp_frame, udp6_frame, udp_frame};
use flowmeter::packet::{batch_ring, CaptureInfo, PacketInjector, PacketPool};
use flowmeter::{run_dispatch, PipelineBuilder};

struct Harness {
    shards: usize,
    batch_size: usize,
    active_timeout: Duration,
    idle_timeout: Duration,
    expire_interval: Duration,
}

impl Default for Harness {
    fn default() -> Self {
        Self {
            shards: 1,
            batch_size: 1,
            active_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
            expire_interval: Duration::from_secs(5),
        }
    }
}

impl Harness {
    /// Feeds the frames through a full pipeline and returns the exported
    /// records in sink order.
    fn run(&self, frames: &[(Vec<u8>, Duration)]) -> Vec<FlowRecord> {
        let sink = Arc::new(CollectSink::new());
        let counter = Arc::new(PipelineCounter::default());
        let pool = PacketPool::new(256);
        let (producer, consumer) = batch_ring(4, self.batch_size);

        let mut pipeline = PipelineBuilder::new()
            .shards(self.shards)
            .active_timeout(self.active_timeout)
            .idle_timeout(self.idle_timeout)
            .expire_interval(self.expire_interval)
            .ring_capacity(4)
            .batch_size(self.batch_size)
            .key_selector(KeySelector::FiveTuple)
            .sink(sink.clone())
            .counter(counter.clone())
            .build()
            .unwrap();

        let eof_time = frames.iter().map(|(_, ts)| *ts).max().unwrap_or_default();
        let dispatcher = thread::spawn(move || {
            run_dispatch(consumer, &mut pipeline);
            pipeline.eof(eof_time);
        });

        let mut injector = PacketInjector::new(pool.clone(), producer, counter);
        for (nr, (frame, ts)) in frames.iter().enumerate() {
            injector.inject(
                frame,
                CaptureInfo {
                    timestamp: *ts,
                    wire_len: frame.len(),
                    captured_len: frame.len(),
                },
                FirstLayer::Ethernet,
                nr as u64 + 1,
                None,
            );
        }
        injector.close();
        dispatcher.join().unwrap();

        assert_eq!(pool.free_slots(), 256, "every packet must be recycled");
        sink.take()
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

#[test]
fn udp_pair_single_flow_eof() {
    let frames = vec![
        (udp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000), secs(1)),
        (udp_frame([10, 0, 0, 2], 2000, [10, 0, 0, 1], 1000), secs(2)),
    ];
    let records = Harness::default().run(&frames);

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.reason, FlowEndReason::Eof);
    // first packet ran forward, the reply reverse
    assert_eq!(record.features.packets, [1, 1]);
    assert_eq!(record.key.src_ip().unwrap(), &[10, 0, 0, 1]);
    assert_eq!(record.first_seen, secs(1));
    assert_eq!(record.last_seen, secs(2));
}

#[test]
fn tcp_fin_handshake_ends_flow() {
    let a = [10, 0, 0, 1];
    let b = [10, 0, 0, 2];
    let frames = vec![
        (tcp_frame(a, 1000, b, 2000, 0x02), secs(1)), // SYN
        (tcp_frame(b, 2000, a, 1000, 0x12), secs(2)), // SYN|ACK
        (tcp_frame(a, 1000, b, 2000, 0x18), secs(3)), // data
        (tcp_frame(a, 1000, b, 2000, 0x11), secs(4)), // FIN src
        (tcp_frame(b, 2000, a, 1000, 0x10), secs(5)), // ACK dst
        (tcp_frame(b, 2000, a, 1000, 0x11), secs(6)), // FIN dst
        (tcp_frame(a, 1000, b, 2000, 0x10), secs(7)), // ACK src
    ];
    let records = Harness::default().run(&frames);

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, FlowEndReason::End);
    assert_eq!(records[0].features.total_packets(), 7);
    assert_eq!(records[0].last_seen, secs(7));
}

#[test]
fn tcp_rst_ends_flow() {
    let a = [10, 0, 0, 1];
    let b = [10, 0, 0, 2];
    let frames = vec![
        (tcp_frame(a, 1000, b, 2000, 0x02), secs(1)), // SYN
        (tcp_frame(a, 1000, b, 2000, 0x18), secs(2)), // data
        (tcp_frame(b, 2000, a, 1000, 0x04), secs(3)), // RST
    ];
    let records = Harness::default().run(&frames);

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, FlowEndReason::End);
    assert_eq!(records[0].last_seen, secs(3));
}

#[test]
fn idle_timeout_exported_on_sweep() {
    let harness = Harness {
        idle_timeout: Duration::from_secs(10),
        expire_interval: Duration::from_secs(1),
        ..Default::default()
    };
    let frames = vec![
        (udp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000), secs(0)),
        // different flow, 11s later: its batch triggers the sweep
        (udp_frame([10, 0, 0, 3], 1000, [10, 0, 0, 4], 2000), secs(11)),
    ];
    let records = harness.run(&frames);

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].reason, FlowEndReason::Idle);
    assert_eq!(records[0].key.src_ip().unwrap(), &[10, 0, 0, 1]);
    assert_eq!(records[0].last_seen, secs(0));
    assert_eq!(records[1].reason, FlowEndReason::Eof);
}

#[test]
fn active_timeout_splits_long_flow() {
    let harness = Harness {
        active_timeout: Duration::from_secs(300),
        idle_timeout: Duration::from_secs(60),
        expire_interval: Duration::from_secs(1),
        ..Default::default()
    };
    // one packet per second for 311 seconds
    let frames: Vec<(Vec<u8>, Duration)> = (0..=310u64)
        .map(|t| (udp_frame([10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000), secs(t)))
        .collect();
    let records = harness.run(&frames);

    assert_eq!(records.len(), 2, "active timeout splits the stream");
    assert_eq!(records[0].reason, FlowEndReason::Active);
    assert_eq!(records[0].first_seen, secs(0));
    assert!(records[0].last_seen >= secs(299));
    // the remainder became a fresh flow
    assert_eq!(records[1].reason, FlowEndReason::Eof);
    assert!(records[1].first_seen > secs(299));
    assert_eq!(
        records[0].features.total_packets() + records[1].features.total_packets(),
        311
    );
}

#[test]
fn ipv6_canonicalization_end_to_end() {
    let src = [0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x02];
    let dst = [0x20, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01];
    let frames = vec![(udp6_frame(src, 1000, dst, 2000), secs(1))];
    let records = Harness::default().run(&frames);

    assert_eq!(records.len(), 1);
    let key = &records[0].key;
    assert_eq!(key.src_ip().unwrap(), &dst, "smaller address first");
    assert_eq!(key.dst_ip().unwrap(), &src);
    assert_eq!(key.src_port_bytes().unwrap(), &2000u16.to_be_bytes());
    assert_eq!(key.dst_port_bytes().unwrap(), &1000u16.to_be_bytes());
    // the only packet ran against the canonical direction
    assert_eq!(records[0].features.packets, [0, 1]);
}

#[test]
fn icmp_conversation_is_one_flow() {
    let frames = vec![
        (icmpv4_frame([10, 0, 0, 9], [10, 0, 0, 1], 8, 0), secs(1)),
        (icmpv4_frame([10, 0, 0, 1], [10, 0, 0, 9], 8, 0), secs(2)),
    ];
    let records = Harness::default().run(&frames);

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].features.total_packets(), 2);
    // type/code bytes stay in place regardless of direction
    assert_eq!(records[0].key.src_port_bytes().unwrap(), &[8, 0]);
}

#[test]
fn sharded_run_matches_single_shard() {
    // requests first, replies second: timestamps stay non-decreasing
    let mut frames: Vec<(Vec<u8>, Duration)> = Vec::new();
    for i in 0..32u8 {
        frames.push((udp_frame([10, 0, i, 1], 1000, [10, 0, i, 2], 2000), secs(1)));
    }
    for i in 0..32u8 {
        frames.push((udp_frame([10, 0, i, 2], 2000, [10, 0, i, 1], 1000), secs(2)));
    }

    let single = Harness {
        batch_size: 8,
        ..Default::default()
    }
    .run(&frames);
    let sharded = Harness {
        shards: 4,
        batch_size: 8,
        ..Default::default()
    }
    .run(&frames);

    assert_eq!(single.len(), 32);
    assert_eq!(sharded.len(), 32, "sharding must not split or merge flows");
    for records in [&single, &sharded] {
        for record in records.iter() {
            assert_eq!(record.features.packets, [1, 1]);
        }
    }
}

#[test]
fn random_conversations_share_one_key() {
    use rand::{Rng, SeedableRng};

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let src: [u8; 4] = rng.gen();
        let dst: [u8; 4] = rng.gen();
        if src == dst {
            continue;
        }
        let sport: u16 = rng.gen();
        let dport: u16 = rng.gen();

        let fwd = decoded_packet(&tcp_frame(src, sport, dst, dport, 0x10), FirstLayer::Ethernet);
        let rev = decoded_packet(&tcp_frame(dst, dport, src, sport, 0x10), FirstLayer::Ethernet);
        let (k1, f1) = KeySelector::FiveTuple.extract(&fwd).unwrap();
        let (k2, f2) = KeySelector::FiveTuple.extract(&rev).unwrap();

        assert_eq!(k1, k2, "both directions must share one key");
        assert_ne!(f1, f2, "directions must disagree on forward");
        // same key, same shard, for any shard count
        for shards in [1u64, 2, 4, 7] {
            assert_eq!(k1.hash() % shards, k2.hash() % shards);
        }
    }
}

#[test]
fn keyless_packets_are_dropped() {
    // ARP ethertype decodes but yields no key
    let mut arp = tcp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, 0x02);
    arp[12] = 0x08;
    arp[13] = 0x06;
    let frames = vec![
        (arp, secs(1)),
        (udp_frame([10, 0, 0, 1], 1, [10, 0, 0, 2], 2), secs(2)),
    ];
    let records = Harness::default().run(&frames);
    assert_eq!(records.len(), 1, "only the keyed packet builds a flow");
}
