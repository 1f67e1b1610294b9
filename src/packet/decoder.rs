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

use super::buffer::{LinkLayer, NetworkLayer, PacketBuffer, TransportKind, TransportLayer};
use crate::common::consts::*;
use crate::common::{EthernetType, FirstLayer, IpProtocol};
use crate::utils::bytes::read_u16_be;

enum NextLayer {
    Ipv4(usize),
    Ipv6(usize),
    None,
}

impl PacketBuffer {
    /// Walks the headers from the first-layer tag, recording layer offsets
    /// in place. Returns false on a malformed packet; finding no network
    /// or transport layer is a success, the packet simply yields no key.
    ///
    /// A TCP header whose options are clipped still decodes: the fixed
    /// header carries the flags, which is all teardown detection needs.
    pub fn decode(&mut self) -> bool {
        let len = self.data().len();

        let network = match self.first_layer {
            FirstLayer::Ethernet => {
                if len < ETH_HEADER_SIZE {
                    return false;
                }
                self.link = Some(LinkLayer {
                    offset: 0,
                    kind: FirstLayer::Ethernet,
                });
                self.hlen += ETH_HEADER_SIZE;
                let mut offset = ETH_HEADER_SIZE;
                let mut eth_type = read_u16_be(&self.data()[ETH_TYPE_OFFSET..]);
                if eth_type == u16::from(EthernetType::Dot1Q)
                    || eth_type == u16::from(EthernetType::QinQ)
                {
                    if len < offset + VLAN_HEADER_SIZE {
                        return false;
                    }
                    eth_type = read_u16_be(&self.data()[offset + 2..]);
                    offset += VLAN_HEADER_SIZE;
                    self.hlen += VLAN_HEADER_SIZE;
                }
                match EthernetType::from(eth_type) {
                    EthernetType::Ipv4 => NextLayer::Ipv4(offset),
                    EthernetType::Ipv6 => NextLayer::Ipv6(offset),
                    _ => NextLayer::None,
                }
            }
            FirstLayer::LinuxSll => {
                if len < SLL_HEADER_SIZE {
                    return false;
                }
                self.link = Some(LinkLayer {
                    offset: 0,
                    kind: FirstLayer::LinuxSll,
                });
                self.hlen += SLL_HEADER_SIZE;
                match EthernetType::from(read_u16_be(&self.data()[SLL_TYPE_OFFSET..])) {
                    EthernetType::Ipv4 => NextLayer::Ipv4(SLL_HEADER_SIZE),
                    EthernetType::Ipv6 => NextLayer::Ipv6(SLL_HEADER_SIZE),
                    _ => NextLayer::None,
                }
            }
            FirstLayer::Raw => {
                if len < 1 {
                    return false;
                }
                match self.data()[0] >> 4 {
                    4 => NextLayer::Ipv4(0),
                    6 => NextLayer::Ipv6(0),
                    _ => return false,
                }
            }
            FirstLayer::Ipv4 => NextLayer::Ipv4(0),
            FirstLayer::Ipv6 => NextLayer::Ipv6(0),
        };

        let (proto, transport_offset) = match network {
            NextLayer::Ipv4(offset) => {
                if len < offset + IPV4_HEADER_SIZE {
                    return false;
                }
                let ihl = ((self.data()[offset] & 0x0f) as usize) * 4;
                if ihl < IPV4_HEADER_SIZE || len < offset + ihl {
                    return false;
                }
                self.network = Some(NetworkLayer {
                    offset,
                    is_v6: false,
                });
                self.hlen += ihl;
                (self.data()[offset + IPV4_PROTO_OFFSET], offset + ihl)
            }
            NextLayer::Ipv6(offset) => {
                if len < offset + IPV6_HEADER_SIZE {
                    return false;
                }
                self.network = Some(NetworkLayer { offset, is_v6: true });
                self.hlen += IPV6_HEADER_SIZE;
                let mut next = self.data()[offset + IPV6_PROTO_OFFSET];
                let mut walk = offset + IPV6_HEADER_SIZE;
                // skip extension headers to the real transport
                while IpProtocol::from(next).is_ipv6_extension() {
                    if len < walk + IPV6_EXT_MIN_SIZE {
                        return false;
                    }
                    let ext_len = (self.data()[walk + 1] as usize + 1) * 8;
                    if len < walk + ext_len {
                        return false;
                    }
                    next = self.data()[walk];
                    self.hlen += ext_len;
                    walk += ext_len;
                }
                self.proto = IpProtocol::from(next);
                if self.proto == IpProtocol::Ipv6NoNext || self.proto == IpProtocol::Ipv6Fragment {
                    // fragments are not reassembled, no transport layer
                    return true;
                }
                (next, walk)
            }
            NextLayer::None => return true,
        };

        self.proto = IpProtocol::from(proto);
        let t = transport_offset;
        match self.proto {
            IpProtocol::Tcp => {
                if len < t + TCP_HEADER_SIZE {
                    return false;
                }
                let data_offset = ((self.data()[t + TCP_OFFSET_DATAOFF] >> 4) as usize) * 4;
                if data_offset < TCP_HEADER_SIZE {
                    return false;
                }
                self.transport = Some(TransportLayer {
                    offset: t,
                    kind: TransportKind::Tcp,
                });
                // options may be clipped by the snap length
                self.hlen += data_offset.min(len - t);
                true
            }
            IpProtocol::Udp => {
                if len < t + UDP_HEADER_SIZE {
                    return false;
                }
                self.transport = Some(TransportLayer {
                    offset: t,
                    kind: TransportKind::Udp,
                });
                self.hlen += UDP_HEADER_SIZE;
                true
            }
            IpProtocol::Icmpv4 => {
                if len < t + ICMP_HEADER_SIZE {
                    return false;
                }
                self.transport = Some(TransportLayer {
                    offset: t,
                    kind: TransportKind::Icmpv4,
                });
                self.hlen += ICMP_HEADER_SIZE;
                true
            }
            IpProtocol::Icmpv6 => {
                if len < t + ICMP_HEADER_SIZE {
                    return false;
                }
                self.transport = Some(TransportLayer {
                    offset: t,
                    kind: TransportKind::Icmpv6,
                });
                self.hlen += ICMP_HEADER_SIZE;
                true
            }
            // no transport layer this engine keys on
            _ => true,
        }
    }
}
