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

//! Hand-built frames and detached packet buffers for tests and benches.

use std::time::Duration;

use super::buffer::PacketBuffer;
use super::source::CaptureInfo;
use crate::common::FirstLayer;

/// Buffer loaded with `data` but not decoded.
pub fn raw_packet(data: &[u8], first_layer: FirstLayer) -> PacketBuffer {
    let mut packet = PacketBuffer::empty();
    packet.assign(
        data,
        CaptureInfo {
            timestamp: Duration::ZERO,
            wire_len: data.len(),
            captured_len: data.len(),
        },
        first_layer,
        1,
        None,
    );
    packet
}

/// Buffer loaded with `data` and decoded; panics on malformed frames.
pub fn decoded_packet(data: &[u8], first_layer: FirstLayer) -> PacketBuffer {
    let mut packet = raw_packet(data, first_layer);
    assert!(packet.decode(), "test frame failed to decode");
    packet
}

fn ethernet_header(eth_type: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(64);
    frame.extend_from_slice(&[0x00, 0x15, 0x5d, 0x70, 0x01, 0x03]); // dst mac
    frame.extend_from_slice(&[0xb0, 0x60, 0x88, 0x51, 0xd7, 0x54]); // src mac
    frame.extend_from_slice(&eth_type.to_be_bytes());
    frame
}

fn ipv4_header(src: [u8; 4], dst: [u8; 4], proto: u8, payload_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(20);
    header.push(0x45);
    header.push(0);
    header.extend_from_slice(&((20 + payload_len) as u16).to_be_bytes());
    header.extend_from_slice(&[0, 0, 0x40, 0]); // id, don't fragment
    header.push(64); // ttl
    header.push(proto);
    header.extend_from_slice(&[0, 0]); // checksum, unchecked
    header.extend_from_slice(&src);
    header.extend_from_slice(&dst);
    header
}

fn ipv6_header(src: [u8; 16], dst: [u8; 16], next_header: u8, payload_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(40);
    header.extend_from_slice(&[0x60, 0, 0, 0]);
    header.extend_from_slice(&(payload_len as u16).to_be_bytes());
    header.push(next_header);
    header.push(64); // hop limit
    header.extend_from_slice(&src);
    header.extend_from_slice(&dst);
    header
}

fn tcp_header(sport: u16, dport: u16, flags: u8, data_offset_words: u8) -> Vec<u8> {
    let mut header = Vec::with_capacity(20);
    header.extend_from_slice(&sport.to_be_bytes());
    header.extend_from_slice(&dport.to_be_bytes());
    header.extend_from_slice(&1u32.to_be_bytes()); // seq
    header.extend_from_slice(&0u32.to_be_bytes()); // ack
    header.push(data_offset_words << 4);
    header.push(flags);
    header.extend_from_slice(&1024u16.to_be_bytes()); // window
    header.extend_from_slice(&[0, 0, 0, 0]); // checksum, urgent
    header
}

fn udp_header(sport: u16, dport: u16, payload_len: usize) -> Vec<u8> {
    let mut header = Vec::with_capacity(8);
    header.extend_from_slice(&sport.to_be_bytes());
    header.extend_from_slice(&dport.to_be_bytes());
    header.extend_from_slice(&((8 + payload_len) as u16).to_be_bytes());
    header.extend_from_slice(&[0, 0]);
    header
}

pub fn tcp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, flags: u8) -> Vec<u8> {
    let mut frame = ethernet_header(0x0800);
    frame.extend_from_slice(&ipv4_header(src, dst, 6, 20));
    frame.extend_from_slice(&tcp_header(sport, dport, flags, 5));
    frame
}

/// TCP frame with an eight-byte options block (data offset 7 words).
pub fn tcp_frame_with_options(
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    flags: u8,
) -> Vec<u8> {
    let mut frame = ethernet_header(0x0800);
    frame.extend_from_slice(&ipv4_header(src, dst, 6, 28));
    frame.extend_from_slice(&tcp_header(sport, dport, flags, 7));
    frame.extend_from_slice(&[2, 4, 0x05, 0xb4, 1, 1, 1, 0]); // mss + nops
    frame
}

pub fn udp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Vec<u8> {
    let mut frame = ethernet_header(0x0800);
    frame.extend_from_slice(&ipv4_header(src, dst, 17, 12));
    frame.extend_from_slice(&udp_header(sport, dport, 4));
    frame.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    frame
}

pub fn udp6_frame(src: [u8; 16], sport: u16, dst: [u8; 16], dport: u16) -> Vec<u8> {
    let mut frame = ethernet_header(0x86DD);
    frame.extend_from_slice(&ipv6_header(src, dst, 17, 12));
    frame.extend_from_slice(&udp_header(sport, dport, 4));
    frame.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    frame
}

pub fn icmpv4_frame(src: [u8; 4], dst: [u8; 4], icmp_type: u8, code: u8) -> Vec<u8> {
    let mut frame = ethernet_header(0x0800);
    frame.extend_from_slice(&ipv4_header(src, dst, 1, 8));
    frame.extend_from_slice(&[icmp_type, code, 0, 0, 0, 1, 0, 1]);
    frame
}

pub fn vlan_tcp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, flags: u8) -> Vec<u8> {
    let mut frame = ethernet_header(0x8100);
    frame.extend_from_slice(&[0x00, 0x64]); // vlan 100
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(&ipv4_header(src, dst, 6, 20));
    frame.extend_from_slice(&tcp_header(sport, dport, flags, 5));
    frame
}

pub fn sll_udp_frame(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Vec<u8> {
    let mut frame = Vec::with_capacity(64);
    frame.extend_from_slice(&[0, 0]); // packet type
    frame.extend_from_slice(&[0, 1]); // arphrd ethernet
    frame.extend_from_slice(&[0, 6]); // address length
    frame.extend_from_slice(&[0xb0, 0x60, 0x88, 0x51, 0xd7, 0x54, 0, 0]);
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(&ipv4_header(src, dst, 17, 12));
    frame.extend_from_slice(&udp_header(sport, dport, 4));
    frame.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    frame
}

pub fn raw_ipv4_udp(src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16) -> Vec<u8> {
    let mut frame = ipv4_header(src, dst, 17, 8);
    frame.extend_from_slice(&udp_header(sport, dport, 0));
    frame
}

pub fn raw_ipv6_udp(src: [u8; 16], sport: u16, dst: [u8; 16], dport: u16) -> Vec<u8> {
    let mut frame = ipv6_header(src, dst, 17, 8);
    frame.extend_from_slice(&udp_header(sport, dport, 0));
    frame
}

pub fn ipv6_hopbyhop_udp_frame(src: [u8; 16], sport: u16, dst: [u8; 16], dport: u16) -> Vec<u8> {
    let mut frame = ethernet_header(0x86DD);
    frame.extend_from_slice(&ipv6_header(src, dst, 0, 16)); // hop-by-hop first
    frame.extend_from_slice(&[17, 0, 0, 0, 0, 0, 0, 0]); // next: udp, 8 bytes
    frame.extend_from_slice(&udp_header(sport, dport, 0));
    frame
}
