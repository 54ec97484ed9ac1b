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

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};

pub const DEFAULT_NETFLOW_PORT: u16 = 2055;
pub const DEFAULT_SFLOW_PORT: u16 = 6343;

/// Normalized flow record, the unit of exchange between decoders and
/// the writer.
///
/// `bytes` and `packets` are already multiplied by `sampling_rate`, so
/// they are estimates of the traffic the exporter observed, not of the
/// samples it emitted. A record is immutable once a decoder returns it.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowRecord {
    pub timestamp: DateTime<Utc>,
    pub exporter_ip: IpAddr,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    // only meaningful for TCP/UDP, zero otherwise
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub bytes: u64,
    pub packets: u64,
    // cumulative OR over the flow, NetFlow only
    pub tcp_flags: u8,
    pub tos: u8,
    pub input_interface: u32,
    pub output_interface: u32,
    // NetFlow only, unspecified for sFlow
    pub next_hop_ip: IpAddr,
    pub src_as: u32,
    pub dst_as: u32,
    pub duration_ms: u32,
    // multiplier already applied to bytes/packets, never zero
    pub sampling_rate: u32,
}

impl Default for FlowRecord {
    fn default() -> Self {
        FlowRecord {
            timestamp: DateTime::<Utc>::default(),
            exporter_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_port: 0,
            protocol: 0,
            bytes: 0,
            packets: 0,
            tcp_flags: 0,
            tos: 0,
            input_interface: 0,
            output_interface: 0,
            next_hop_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_as: 0,
            dst_as: 0,
            duration_ms: 0,
            sampling_rate: 1,
        }
    }
}
