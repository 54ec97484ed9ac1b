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

//! sFlow v5 decoder.
//!
//! An sFlow datagram is a nested TLV structure: the datagram header is
//! followed by samples, each sample by records. Only standard flow
//! samples carrying raw packet headers produce flow records; the
//! sampled Ethernet frame inside is parsed just deep enough to pull
//! out the IPv4 five-tuple. A malformed sample is skipped and counted
//! without failing the datagram around it, since one broken sample
//! says nothing about its siblings.

use std::cmp;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{Decoder, Error, Result};
use crate::common::FlowRecord;
use crate::utils::bytes::{read_ipv4, read_ipv6, read_u16_be, read_u32_be};
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

pub const SFLOW_V5: u32 = 5;

const ADDRESS_TYPE_IPV4: u32 = 1;
const ADDRESS_TYPE_IPV6: u32 = 2;

const ENTERPRISE_STANDARD: u32 = 0;
const SAMPLE_FLOW: u32 = 1;
const SAMPLE_COUNTER: u32 = 2;
const SAMPLE_FLOW_EXPANDED: u32 = 3;
const SAMPLE_COUNTER_EXPANDED: u32 = 4;
const RECORD_RAW_PACKET_HEADER: u32 = 1;

// datagram header with an IPv4 agent address
const DATAGRAM_HEADER_SIZE: usize = 28;
const FLOW_SAMPLE_PREAMBLE: usize = 32;
const RAW_HEADER_PREAMBLE: usize = 16;

const ETHERNET_HEADER_SIZE: usize = 14;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IPV4_MIN_HEADER_SIZE: usize = 20;

#[derive(Debug, Default)]
pub struct SflowCounter {
    pub packets_received: AtomicU64,
    pub records_emitted: AtomicU64,
    pub decode_errors: AtomicU64,
    // raw headers whose ethertype we do not parse (IPv6 among them),
    // not an error condition
    pub unsupported_link_type: AtomicU64,
}

impl RefCountable for SflowCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "packets_received",
                CounterType::Counted,
                CounterValue::Unsigned(self.packets_received.load(Ordering::Relaxed)),
            ),
            (
                "records_emitted",
                CounterType::Counted,
                CounterValue::Unsigned(self.records_emitted.load(Ordering::Relaxed)),
            ),
            (
                "decode_errors",
                CounterType::Counted,
                CounterValue::Unsigned(self.decode_errors.load(Ordering::Relaxed)),
            ),
            (
                "unsupported_link_type",
                CounterType::Counted,
                CounterValue::Unsigned(self.unsupported_link_type.load(Ordering::Relaxed)),
            ),
        ]
    }
}

pub struct SflowParser {
    counter: Arc<SflowCounter>,
    // records are stamped at receive time, injected for tests
    clock: fn() -> DateTime<Utc>,
}

impl SflowParser {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(SflowCounter::default()),
            clock: Utc::now,
        }
    }

    pub fn with_clock(clock: fn() -> DateTime<Utc>) -> Self {
        Self {
            counter: Arc::new(SflowCounter::default()),
            clock,
        }
    }

    pub fn counter(&self) -> &Arc<SflowCounter> {
        &self.counter
    }

    fn parse_datagram(&self, payload: &[u8]) -> Result<Vec<FlowRecord>> {
        if payload.len() < DATAGRAM_HEADER_SIZE {
            return Err(Error::ShortPacket(payload.len()));
        }

        let version = read_u32_be(payload);
        if version != SFLOW_V5 {
            return Err(Error::UnsupportedVersion(version));
        }

        let address_type = read_u32_be(&payload[4..]);
        let mut offset = 8;
        let agent_ip: IpAddr = match address_type {
            ADDRESS_TYPE_IPV4 => {
                // covered by the minimum header check above
                let ip = read_ipv4(&payload[offset..]);
                offset += 4;
                IpAddr::V4(ip)
            }
            ADDRESS_TYPE_IPV6 => {
                if payload.len() < offset + 16 {
                    return Err(Error::ShortPacket(payload.len()));
                }
                let ip = read_ipv6(&payload[offset..]);
                offset += 16;
                IpAddr::V6(ip)
            }
            _ => return Err(Error::MalformedSample("agent address type")),
        };

        // sub-agent id, sequence number, uptime
        offset += 12;
        if payload.len() < offset + 4 {
            return Err(Error::ShortPacket(payload.len()));
        }
        let num_samples = read_u32_be(&payload[offset..]);
        offset += 4;

        let timestamp = (self.clock)();
        let mut records = Vec::new();

        for _ in 0..num_samples {
            if offset + 8 > payload.len() {
                // declared more samples than the datagram carries
                self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
            let sample_format = read_u32_be(&payload[offset..]);
            let sample_length = read_u32_be(&payload[offset + 4..]) as usize;
            offset += 8;
            if offset + sample_length > payload.len() {
                // the rest of the datagram cannot be framed
                self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
            let sample = &payload[offset..offset + sample_length];
            offset += sample_length;

            let enterprise = sample_format >> 12;
            let format = sample_format & 0xFFF;
            if enterprise != ENTERPRISE_STANDARD {
                continue;
            }
            match format {
                SAMPLE_FLOW | SAMPLE_FLOW_EXPANDED => {
                    self.parse_flow_sample(sample, agent_ip, timestamp, &mut records)
                }
                // interface counter samples carry no flows
                SAMPLE_COUNTER | SAMPLE_COUNTER_EXPANDED => (),
                _ => (),
            }
        }

        Ok(records)
    }

    fn parse_flow_sample(
        &self,
        sample: &[u8],
        agent_ip: IpAddr,
        timestamp: DateTime<Utc>,
        records: &mut Vec<FlowRecord>,
    ) {
        if sample.len() < FLOW_SAMPLE_PREAMBLE {
            self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let sampling_rate = cmp::max(1, read_u32_be(&sample[8..]));
        let input_interface = read_u32_be(&sample[20..]);
        let output_interface = read_u32_be(&sample[24..]);
        let num_records = read_u32_be(&sample[28..]);

        let mut offset = FLOW_SAMPLE_PREAMBLE;
        for _ in 0..num_records {
            if offset + 8 > sample.len() {
                self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let record_format = read_u32_be(&sample[offset..]);
            let record_length = read_u32_be(&sample[offset + 4..]) as usize;
            offset += 8;
            if offset + record_length > sample.len() {
                self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let record = &sample[offset..offset + record_length];
            offset += record_length;

            let enterprise = record_format >> 12;
            let format = record_format & 0xFFF;
            if enterprise != ENTERPRISE_STANDARD || format != RECORD_RAW_PACKET_HEADER {
                continue;
            }
            if let Some(r) = self.parse_raw_packet_header(
                record,
                agent_ip,
                timestamp,
                input_interface,
                output_interface,
                sampling_rate,
            ) {
                records.push(r);
            }
        }
    }

    fn parse_raw_packet_header(
        &self,
        data: &[u8],
        agent_ip: IpAddr,
        timestamp: DateTime<Utc>,
        input_interface: u32,
        output_interface: u32,
        sampling_rate: u32,
    ) -> Option<FlowRecord> {
        if data.len() < RAW_HEADER_PREAMBLE {
            self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let frame_length = read_u32_be(&data[4..]);
        let header_length = read_u32_be(&data[12..]) as usize;
        if RAW_HEADER_PREAMBLE + header_length > data.len() {
            self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let header = &data[RAW_HEADER_PREAMBLE..RAW_HEADER_PREAMBLE + header_length];

        if header.len() < ETHERNET_HEADER_SIZE {
            self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut ethertype = read_u16_be(&header[12..]);
        let mut ip_offset = ETHERNET_HEADER_SIZE;
        if ethertype == ETHERTYPE_VLAN {
            if header.len() < ip_offset + 4 {
                self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            let _vlan_id = read_u16_be(&header[ip_offset..]) & 0x0FFF;
            ethertype = read_u16_be(&header[ip_offset + 2..]);
            ip_offset += 4;
        }
        if ethertype != ETHERTYPE_IPV4 {
            self.counter
                .unsupported_link_type
                .fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let ip = &header[ip_offset..];
        if ip.len() < IPV4_MIN_HEADER_SIZE {
            self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let ihl = ((ip[0] & 0x0F) as usize) * 4;
        if ihl < IPV4_MIN_HEADER_SIZE || ip.len() < ihl {
            self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let tos = ip[1];
        let protocol = ip[9];
        let src_ip = read_ipv4(&ip[12..]);
        let dst_ip = read_ipv4(&ip[16..]);

        // ports are only present if the transport header was sampled
        let (src_port, dst_port) = if ip.len() >= ihl + 4 {
            (read_u16_be(&ip[ihl..]), read_u16_be(&ip[ihl + 2..]))
        } else {
            (0, 0)
        };

        Some(FlowRecord {
            timestamp,
            exporter_ip: agent_ip,
            src_ip: IpAddr::V4(src_ip),
            dst_ip: IpAddr::V4(dst_ip),
            src_port,
            dst_port,
            protocol,
            bytes: frame_length as u64 * sampling_rate as u64,
            // one sampled frame stands for `sampling_rate` on the wire
            packets: sampling_rate as u64,
            tcp_flags: 0,
            tos,
            input_interface,
            output_interface,
            next_hop_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_as: 0,
            dst_as: 0,
            duration_ms: 0,
            sampling_rate,
        })
    }
}

impl Default for SflowParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for SflowParser {
    fn decode(&self, payload: &[u8], _exporter_ip: IpAddr) -> Result<Vec<FlowRecord>> {
        // the agent address inside the datagram identifies the
        // exporter, not the UDP source
        match self.parse_datagram(payload) {
            Ok(records) => {
                self.counter.packets_received.fetch_add(1, Ordering::Relaxed);
                self.counter
                    .records_emitted
                    .fetch_add(records.len() as u64, Ordering::Relaxed);
                Ok(records)
            }
            Err(e) => {
                self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }
}
