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

pub mod netflow;
pub mod sflow;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::common::FlowRecord;
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("packet too short: {0} bytes")]
    ShortPacket(usize),
    #[error("unsupported flow export version: {0}")]
    UnsupportedVersion(u32),
    #[error("packet size mismatch: got {got} bytes, expected {expected}")]
    SizeMismatch { got: usize, expected: usize },
    #[error("malformed sample: {0}")]
    MalformedSample(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A stateless wire-format decoder. One UDP payload in, zero or more
/// normalized records out. Decoders are shared between receiver
/// workers, so implementations keep their state in atomics.
pub trait Decoder: Send + Sync {
    fn decode(&self, payload: &[u8], exporter_ip: IpAddr) -> Result<Vec<FlowRecord>>;
}

#[derive(Debug, Default)]
pub struct ParserCounter {
    pub packets_received: AtomicU64,
    pub records_emitted: AtomicU64,
    pub decode_errors: AtomicU64,
}

impl RefCountable for ParserCounter {
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
        ]
    }
}
