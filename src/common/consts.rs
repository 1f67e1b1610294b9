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

pub const ETH_HEADER_SIZE: usize = 14;
pub const ETH_TYPE_OFFSET: usize = 12;
pub const VLAN_HEADER_SIZE: usize = 4;
pub const SLL_HEADER_SIZE: usize = 16;
pub const SLL_TYPE_OFFSET: usize = 14;

pub const IPV4_HEADER_SIZE: usize = 20;
pub const IPV4_PROTO_OFFSET: usize = 9;
pub const IPV4_SRC_OFFSET: usize = 12;
pub const IPV4_DST_OFFSET: usize = 16;
pub const IPV4_ADDR_LEN: usize = 4;

pub const IPV6_HEADER_SIZE: usize = 40;
pub const IPV6_PROTO_OFFSET: usize = 6;
pub const IPV6_SRC_OFFSET: usize = 8;
pub const IPV6_DST_OFFSET: usize = 24;
pub const IPV6_ADDR_LEN: usize = 16;
pub const IPV6_EXT_MIN_SIZE: usize = 8;

pub const TCP_HEADER_SIZE: usize = 20;
pub const TCP_OFFSET_DATAOFF: usize = 12;
pub const TCP_OFFSET_FLAGS: usize = 13;
pub const UDP_HEADER_SIZE: usize = 8;
pub const ICMP_HEADER_SIZE: usize = 4;

pub const PORT_LEN: usize = 2;
