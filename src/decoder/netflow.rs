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

//! NetFlow v5 decoder.
//!
//! v5 is the fixed-layout variant: a 24 byte header followed by
//! `count` 48 byte records, all fields big-endian. Versions 9 and 10
//! (IPFIX) are template-based and intentionally unsupported; they fail
//! decoding like any other unknown version instead of being silently
//! dropped, so exporter misconfiguration stays visible in counters.

use std::cmp;
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{Decoder, Error, ParserCounter, Result};
use crate::common::FlowRecord;
use crate::utils::bytes::{read_ipv4, read_u16_be, read_u32_be};

pub const NETFLOW_V5: u16 = 5;

const HEADER_SIZE: usize = 24;
const RECORD_SIZE: usize = 48;
// low 14 bits of the sampling-interval field carry the rate
const SAMPLING_RATE_MASK: u16 = 0x3FFF;

pub struct NetflowParser {
    counter: Arc<ParserCounter>,
}

impl NetflowParser {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(ParserCounter::default()),
        }
    }

    pub fn counter(&self) -> &Arc<ParserCounter> {
        &self.counter
    }

    fn parse_v5(&self, payload: &[u8], exporter_ip: IpAddr) -> Result<Vec<FlowRecord>> {
        if payload.len() < 2 {
            return Err(Error::ShortPacket(payload.len()));
        }
        let version = read_u16_be(payload);
        if version != NETFLOW_V5 {
            return Err(Error::UnsupportedVersion(version as u32));
        }
        if payload.len() < HEADER_SIZE {
            return Err(Error::ShortPacket(payload.len()));
        }

        let count = read_u16_be(&payload[2..]) as usize;
        let unix_secs = read_u32_be(&payload[8..]);
        let unix_nsecs = read_u32_be(&payload[12..]);
        let sampling_interval = read_u16_be(&payload[22..]);

        // trailing bytes beyond the declared records are exporter
        // padding, but a packet shorter than declared is rejected whole
        let expected = HEADER_SIZE + count * RECORD_SIZE;
        if payload.len() < expected {
            return Err(Error::SizeMismatch {
                got: payload.len(),
                expected,
            });
        }

        let sampling_rate = cmp::max(1, (sampling_interval & SAMPLING_RATE_MASK) as u32);
        let timestamp = header_timestamp(unix_secs, unix_nsecs);

        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let offset = HEADER_SIZE + i * RECORD_SIZE;
            let rec = &payload[offset..offset + RECORD_SIZE];

            let packets = read_u32_be(&rec[16..]);
            let bytes = read_u32_be(&rec[20..]);
            let first = read_u32_be(&rec[24..]);
            let last = read_u32_be(&rec[28..]);

            records.push(FlowRecord {
                timestamp,
                exporter_ip,
                src_ip: IpAddr::V4(read_ipv4(&rec[0..])),
                dst_ip: IpAddr::V4(read_ipv4(&rec[4..])),
                src_port: read_u16_be(&rec[32..]),
                dst_port: read_u16_be(&rec[34..]),
                protocol: rec[38],
                bytes: bytes as u64 * sampling_rate as u64,
                packets: packets as u64 * sampling_rate as u64,
                // byte 36 is an unused pad
                tcp_flags: rec[37],
                tos: rec[39],
                input_interface: read_u16_be(&rec[12..]) as u32,
                output_interface: read_u16_be(&rec[14..]) as u32,
                next_hop_ip: IpAddr::V4(read_ipv4(&rec[8..])),
                src_as: read_u16_be(&rec[40..]) as u32,
                dst_as: read_u16_be(&rec[42..]) as u32,
                duration_ms: last.saturating_sub(first),
                sampling_rate,
            });
        }

        Ok(records)
    }
}

impl Default for NetflowParser {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for NetflowParser {
    fn decode(&self, payload: &[u8], exporter_ip: IpAddr) -> Result<Vec<FlowRecord>> {
        match self.parse_v5(payload, exporter_ip) {
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

fn header_timestamp(unix_secs: u32, unix_nsecs: u32) -> DateTime<Utc> {
    // exporters have been seen emitting nsecs beyond a full second
    let secs = unix_secs as i64 + (unix_nsecs / 1_000_000_000) as i64;
    let nsecs = unix_nsecs % 1_000_000_000;
    DateTime::from_timestamp(secs, nsecs).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const EXPORTER: IpAddr = IpAddr::V4(Ipv4Addr::new(172, 16, 0, 1));

    struct RecordSpec {
        src: [u8; 4],
        dst: [u8; 4],
        packets: u32,
        bytes: u32,
        first: u32,
        last: u32,
        src_port: u16,
        dst_port: u16,
        tcp_flags: u8,
        protocol: u8,
    }

    impl Default for RecordSpec {
        fn default() -> Self {
            RecordSpec {
                src: [0; 4],
                dst: [0; 4],
                packets: 0,
                bytes: 0,
                first: 0,
                last: 0,
                src_port: 0,
                dst_port: 0,
                tcp_flags: 0,
                protocol: 0,
            }
        }
    }

    fn build_v5_packet(unix_secs: u32, sampling_interval: u16, records: &[RecordSpec]) -> Vec<u8> {
        let mut packet = vec![0u8; 24 + records.len() * 48];
        packet[0..2].copy_from_slice(&5u16.to_be_bytes());
        packet[2..4].copy_from_slice(&(records.len() as u16).to_be_bytes());
        packet[4..8].copy_from_slice(&100u32.to_be_bytes()); // sys uptime
        packet[8..12].copy_from_slice(&unix_secs.to_be_bytes());
        packet[22..24].copy_from_slice(&sampling_interval.to_be_bytes());
        for (i, r) in records.iter().enumerate() {
            let rec = &mut packet[24 + i * 48..24 + (i + 1) * 48];
            rec[0..4].copy_from_slice(&r.src);
            rec[4..8].copy_from_slice(&r.dst);
            rec[16..20].copy_from_slice(&r.packets.to_be_bytes());
            rec[20..24].copy_from_slice(&r.bytes.to_be_bytes());
            rec[24..28].copy_from_slice(&r.first.to_be_bytes());
            rec[28..32].copy_from_slice(&r.last.to_be_bytes());
            rec[32..34].copy_from_slice(&r.src_port.to_be_bytes());
            rec[34..36].copy_from_slice(&r.dst_port.to_be_bytes());
            rec[37] = r.tcp_flags;
            rec[38] = r.protocol;
        }
        packet
    }

    #[test]
    fn single_record_no_sampling() {
        let packet = build_v5_packet(
            100,
            0,
            &[RecordSpec {
                src: [192, 168, 1, 10],
                dst: [10, 0, 0, 50],
                packets: 100,
                bytes: 150000,
                src_port: 443,
                dst_port: 54321,
                protocol: 6,
                ..Default::default()
            }],
        );

        let parser = NetflowParser::new();
        let records = parser.decode(&packet, EXPORTER).unwrap();
        assert_eq!(records.len(), 1);

        let r = &records[0];
        assert_eq!(r.src_ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)));
        assert_eq!(r.dst_ip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 50)));
        assert_eq!(r.src_port, 443);
        assert_eq!(r.dst_port, 54321);
        assert_eq!(r.protocol, 6);
        assert_eq!(r.packets, 100);
        assert_eq!(r.bytes, 150000);
        assert_eq!(r.sampling_rate, 1);
        assert_eq!(r.exporter_ip, EXPORTER);
        assert_eq!(r.timestamp, DateTime::from_timestamp(100, 0).unwrap());
        assert_eq!(
            parser.counter().packets_received.load(Ordering::Relaxed),
            1
        );
        assert_eq!(parser.counter().records_emitted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn sampling_rate_scales_counters() {
        // sampling mode in the top 2 bits must be masked off
        let packet = build_v5_packet(
            0,
            (1 << 14) | 100,
            &[RecordSpec {
                packets: 10,
                bytes: 1500,
                ..Default::default()
            }],
        );

        let records = NetflowParser::new().decode(&packet, EXPORTER).unwrap();
        assert_eq!(records[0].sampling_rate, 100);
        assert_eq!(records[0].packets, 1000);
        assert_eq!(records[0].bytes, 150000);
        assert_eq!(records[0].bytes % records[0].sampling_rate as u64, 0);
    }

    #[test]
    fn count_zero_yields_no_records() {
        let packet = build_v5_packet(0, 0, &[]);
        let records = NetflowParser::new().decode(&packet, EXPORTER).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn declared_count_exceeding_payload_is_rejected_whole() {
        let mut packet = build_v5_packet(0, 0, &[RecordSpec::default()]);
        packet[2..4].copy_from_slice(&2u16.to_be_bytes());

        let parser = NetflowParser::new();
        let result = parser.decode(&packet, EXPORTER);
        assert_eq!(
            result,
            Err(Error::SizeMismatch {
                got: 72,
                expected: 120
            })
        );
        assert_eq!(parser.counter().decode_errors.load(Ordering::Relaxed), 1);
        assert_eq!(parser.counter().records_emitted.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut packet = build_v5_packet(0, 0, &[]);
        packet[0] = 0xFF;
        let result = NetflowParser::new().decode(&packet, EXPORTER);
        assert_eq!(result, Err(Error::UnsupportedVersion(0xFF05)));
    }

    #[test]
    fn template_based_versions_stay_unsupported() {
        for version in [9u16, 10] {
            let mut packet = build_v5_packet(0, 0, &[]);
            packet[0..2].copy_from_slice(&version.to_be_bytes());
            let result = NetflowParser::new().decode(&packet, EXPORTER);
            assert_eq!(result, Err(Error::UnsupportedVersion(version as u32)));
        }
    }

    #[test]
    fn short_packet_is_rejected() {
        let parser = NetflowParser::new();
        assert_eq!(parser.decode(&[], EXPORTER), Err(Error::ShortPacket(0)));
        assert_eq!(
            parser.decode(&[0x00], EXPORTER),
            Err(Error::ShortPacket(1))
        );
        // valid version but truncated header
        assert_eq!(
            parser.decode(&[0x00, 0x05, 0x00, 0x00], EXPORTER),
            Err(Error::ShortPacket(4))
        );
    }

    #[test]
    fn trailing_padding_is_ignored() {
        let mut packet = build_v5_packet(
            0,
            0,
            &[RecordSpec {
                packets: 1,
                bytes: 64,
                ..Default::default()
            }],
        );
        packet.extend_from_slice(&[0xAA; 13]);
        let records = NetflowParser::new().decode(&packet, EXPORTER).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn flow_duration_clamps_at_zero() {
        let packet = build_v5_packet(
            0,
            0,
            &[
                RecordSpec {
                    first: 1000,
                    last: 4000,
                    ..Default::default()
                },
                RecordSpec {
                    first: 4000,
                    last: 1000,
                    ..Default::default()
                },
            ],
        );
        let records = NetflowParser::new().decode(&packet, EXPORTER).unwrap();
        assert_eq!(records[0].duration_ms, 3000);
        assert_eq!(records[1].duration_ms, 0);
    }

    #[test]
    fn tcp_flags_read_from_byte_37() {
        let mut packet = build_v5_packet(0, 0, &[RecordSpec::default()]);
        packet[24 + 36] = 0xEE; // pad byte, must not leak into flags
        packet[24 + 37] = 0x12; // SYN|ACK
        let records = NetflowParser::new().decode(&packet, EXPORTER).unwrap();
        assert_eq!(records[0].tcp_flags, 0x12);
    }

    #[test]
    fn decoding_is_pure() {
        let packet = build_v5_packet(
            1700000000,
            512,
            &[RecordSpec {
                src: [1, 2, 3, 4],
                dst: [5, 6, 7, 8],
                packets: 7,
                bytes: 4200,
                src_port: 80,
                dst_port: 50000,
                protocol: 6,
                ..Default::default()
            }],
        );
        let parser = NetflowParser::new();
        let first = parser.decode(&packet, EXPORTER).unwrap();
        let second = parser.decode(&packet, EXPORTER).unwrap();
        assert_eq!(first, second);
    }
}
