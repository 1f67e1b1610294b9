/*
 * Copyright (c) 2022 Yunshan Networks
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

use std::hash::{Hash, Hasher};

use serde::Deserialize;

use crate::common::consts::*;
use crate::packet::{PacketBuffer, TransportKind};
use crate::utils::hasher::fnv1a;

// src 4 | dst 4 | proto 1 | src port 2 | dst port 2
pub const V4_KEY_LEN: usize = 2 * IPV4_ADDR_LEN + 1 + 2 * PORT_LEN;
// src 16 | dst 16 | proto 1 | src port 2 | dst port 2
pub const V6_KEY_LEN: usize = 2 * IPV6_ADDR_LEN + 1 + 2 * PORT_LEN;

/// Canonical flow identity. Address bytes are stored exactly as observed
/// on the wire; canonicalization orders the endpoints, it never reencodes
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKey {
    V4([u8; V4_KEY_LEN]),
    V6([u8; V6_KEY_LEN]),
    /// all packets fall into a single flow
    Empty,
    /// configurable field subset
    Dynamic(DynamicKey),
}

impl FlowKey {
    pub fn bytes(&self) -> &[u8] {
        match self {
            FlowKey::V4(b) => b,
            FlowKey::V6(b) => b,
            FlowKey::Empty => &[],
            FlowKey::Dynamic(d) => d.bytes(),
        }
    }

    /// FNV-1a 64 over the key bytes; also the shard routing value.
    pub fn hash(&self) -> u64 {
        fnv1a(self.bytes())
    }

    pub fn src_ip(&self) -> Option<&[u8]> {
        match self {
            FlowKey::V4(b) => Some(&b[..IPV4_ADDR_LEN]),
            FlowKey::V6(b) => Some(&b[..IPV6_ADDR_LEN]),
            _ => None,
        }
    }

    pub fn dst_ip(&self) -> Option<&[u8]> {
        match self {
            FlowKey::V4(b) => Some(&b[IPV4_ADDR_LEN..2 * IPV4_ADDR_LEN]),
            FlowKey::V6(b) => Some(&b[IPV6_ADDR_LEN..2 * IPV6_ADDR_LEN]),
            _ => None,
        }
    }

    pub fn proto(&self) -> Option<u8> {
        match self {
            FlowKey::V4(b) => Some(b[2 * IPV4_ADDR_LEN]),
            FlowKey::V6(b) => Some(b[2 * IPV6_ADDR_LEN]),
            _ => None,
        }
    }

    pub fn src_port_bytes(&self) -> Option<&[u8]> {
        match self {
            FlowKey::V4(b) => Some(&b[2 * IPV4_ADDR_LEN + 1..2 * IPV4_ADDR_LEN + 3]),
            FlowKey::V6(b) => Some(&b[2 * IPV6_ADDR_LEN + 1..2 * IPV6_ADDR_LEN + 3]),
            _ => None,
        }
    }

    pub fn dst_port_bytes(&self) -> Option<&[u8]> {
        match self {
            FlowKey::V4(b) => Some(&b[2 * IPV4_ADDR_LEN + 3..]),
            FlowKey::V6(b) => Some(&b[2 * IPV6_ADDR_LEN + 3..]),
            _ => None,
        }
    }
}

impl Default for FlowKey {
    fn default() -> Self {
        FlowKey::Empty
    }
}

// The map hasher must observe exactly the key bytes so that its value
// agrees with `FlowKey::hash()`.
impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(self.bytes());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicKey {
    bytes: [u8; V6_KEY_LEN],
    len: u8,
}

impl DynamicKey {
    fn new() -> Self {
        Self {
            bytes: [0; V6_KEY_LEN],
            len: 0,
        }
    }

    fn push(&mut self, field: &[u8]) {
        let start = self.len as usize;
        self.bytes[start..start + field.len()].copy_from_slice(field);
        self.len += field.len() as u8;
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// Field subset for dynamic key mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DynamicFields {
    pub src_ip: bool,
    pub dst_ip: bool,
    pub proto: bool,
    pub src_port: bool,
    pub dst_port: bool,
}

/// Key function chosen at startup; every table built from one configuration
/// uses the same selector for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySelector {
    FiveTuple,
    Empty,
    Dynamic(DynamicFields),
}

impl KeySelector {
    /// Derives the canonical key and the forward bit, or `None` when the
    /// packet has no network or transport layer or an unsupported address
    /// length.
    pub fn extract(&self, packet: &PacketBuffer) -> Option<(FlowKey, bool)> {
        match self {
            KeySelector::FiveTuple => five_tuple(packet),
            KeySelector::Empty => Some((FlowKey::Empty, true)),
            KeySelector::Dynamic(fields) => dynamic_key(packet, fields),
        }
    }
}

struct RawTuple<'a> {
    src_ip: &'a [u8],
    dst_ip: &'a [u8],
    src_port: [u8; 2],
    dst_port: [u8; 2],
    proto: u8,
    ip_control: bool,
    forward: bool,
}

/// Pulls the raw endpoint fields out of a decoded packet and orders them:
/// the lexicographically smaller IP becomes the source. Ports swap along
/// with the addresses except for IP-control protocols (ICMP), whose
/// type/code bytes are not directional. Equal addresses count as forward.
fn raw_tuple(packet: &PacketBuffer) -> Option<RawTuple<'_>> {
    packet.network?;
    let transport = packet.transport?;

    let mut src_ip = packet.src_ip()?;
    let mut dst_ip = packet.dst_ip()?;
    let mut src_port = packet.src_port_bytes();
    let mut dst_port = packet.dst_port_bytes();

    let (proto, ip_control) = match transport.kind {
        TransportKind::Tcp => (u8::from(crate::common::IpProtocol::Tcp), false),
        TransportKind::Udp => (u8::from(crate::common::IpProtocol::Udp), false),
        TransportKind::Icmpv4 => (u8::from(crate::common::IpProtocol::Icmpv4), true),
        TransportKind::Icmpv6 => (u8::from(crate::common::IpProtocol::Icmpv6), true),
    };

    let mut forward = true;
    if dst_ip < src_ip {
        forward = false;
        std::mem::swap(&mut src_ip, &mut dst_ip);
        if !ip_control {
            std::mem::swap(&mut src_port, &mut dst_port);
        }
    }

    Some(RawTuple {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        proto,
        ip_control,
        forward,
    })
}

fn five_tuple(packet: &PacketBuffer) -> Option<(FlowKey, bool)> {
    let t = raw_tuple(packet)?;

    match t.src_ip.len() {
        IPV4_ADDR_LEN => {
            let mut key = [0u8; V4_KEY_LEN];
            key[0..4].copy_from_slice(t.src_ip);
            key[4..8].copy_from_slice(t.dst_ip);
            key[8] = t.proto;
            key[9..11].copy_from_slice(&t.src_port);
            key[11..13].copy_from_slice(&t.dst_port);
            Some((FlowKey::V4(key), t.forward))
        }
        IPV6_ADDR_LEN => {
            let mut key = [0u8; V6_KEY_LEN];
            key[0..16].copy_from_slice(t.src_ip);
            key[16..32].copy_from_slice(t.dst_ip);
            key[32] = t.proto;
            key[33..35].copy_from_slice(&t.src_port);
            key[35..37].copy_from_slice(&t.dst_port);
            Some((FlowKey::V6(key), t.forward))
        }
        _ => None,
    }
}

fn dynamic_key(packet: &PacketBuffer, fields: &DynamicFields) -> Option<(FlowKey, bool)> {
    let mut t = raw_tuple(packet)?;
    if t.src_ip.len() != IPV4_ADDR_LEN && t.src_ip.len() != IPV6_ADDR_LEN {
        return None;
    }

    // canonical ordering only applies when both endpoints are part of the
    // key; otherwise restore wire order and direction
    if !(fields.src_ip && fields.dst_ip) && !t.forward {
        std::mem::swap(&mut t.src_ip, &mut t.dst_ip);
        if !t.ip_control {
            std::mem::swap(&mut t.src_port, &mut t.dst_port);
        }
        t.forward = true;
    }

    let mut key = DynamicKey::new();
    if fields.src_ip {
        key.push(t.src_ip);
    }
    if fields.dst_ip {
        key.push(t.dst_ip);
    }
    if fields.proto {
        key.push(&[t.proto]);
    }
    if fields.src_port {
        key.push(&t.src_port);
    }
    if fields.dst_port {
        key.push(&t.dst_port);
    }
    Some((FlowKey::Dynamic(key), t.forward))
}
