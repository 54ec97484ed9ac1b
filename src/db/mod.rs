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

//! TimescaleDB/PostgreSQL output.
//!
//! One append-only hypertable, written exclusively through binary COPY.
//! The schema is managed outside this process; only the column
//! contract below is assumed.

use std::time::Duration;

use log::debug;
use postgres::binary_copy::BinaryCopyInWriter;
use postgres::types::{ToSql, Type};
use postgres::NoTls;
use r2d2_postgres::PostgresConnectionManager;
use thiserror::Error;

use crate::common::FlowRecord;
use crate::config::DatabaseConfig;
use crate::writer::FlowSink;

// connection establishment and pool acquisition bound; also the time
// budget of the final shutdown flush
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const COPY_STATEMENT: &str = "COPY flow_records (\
    time, exporter_ip, source_ip, destination_ip, \
    source_port, destination_port, protocol, bytes, packets, \
    tcp_flags, tos, input_interface, output_interface, \
    next_hop_ip, source_as, destination_as, flow_duration_ms, sampling_rate\
) FROM STDIN BINARY";

static FLOW_COLUMN_TYPES: &[Type] = &[
    Type::TIMESTAMPTZ,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::INT4,
    Type::INT4,
    Type::INT4,
    Type::INT8,
    Type::INT8,
    Type::INT4,
    Type::INT4,
    Type::INT4,
    Type::INT4,
    Type::TEXT,
    Type::INT4,
    Type::INT4,
    Type::INT4,
    Type::INT4,
];

#[derive(Debug, Error)]
pub enum Error {
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("postgres: {0}")]
    Postgres(#[from] postgres::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub struct Client {
    pool: r2d2::Pool<PostgresConnectionManager<NoTls>>,
}

impl Client {
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        let mut pg = postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .connect_timeout(CONNECT_TIMEOUT);
        if !config.password.is_empty() {
            pg.password(&config.password);
        }
        let manager = PostgresConnectionManager::new(pg, NoTls);
        // single consumer, one warm connection is enough
        let pool = r2d2::Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(1))
            .connection_timeout(CONNECT_TIMEOUT)
            .build(manager)?;
        Ok(Self { pool })
    }

    /// Startup health check, failure is fatal to the process.
    pub fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get()?;
        conn.batch_execute("SELECT 1")?;
        Ok(())
    }

    /// Bulk-inserts one batch. A connection is held only for the
    /// duration of the COPY.
    pub fn insert_flow_records(&self, records: &[FlowRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.get()?;
        let sink = conn.copy_in(COPY_STATEMENT)?;
        let mut writer = BinaryCopyInWriter::new(sink, FLOW_COLUMN_TYPES);
        for r in records {
            let exporter_ip = r.exporter_ip.to_string();
            let source_ip = r.src_ip.to_string();
            let destination_ip = r.dst_ip.to_string();
            let next_hop_ip = r.next_hop_ip.to_string();
            let source_port = r.src_port as i32;
            let destination_port = r.dst_port as i32;
            let protocol = r.protocol as i32;
            let bytes = r.bytes as i64;
            let packets = r.packets as i64;
            let tcp_flags = r.tcp_flags as i32;
            let tos = r.tos as i32;
            let input_interface = r.input_interface as i32;
            let output_interface = r.output_interface as i32;
            let source_as = r.src_as as i32;
            let destination_as = r.dst_as as i32;
            let flow_duration_ms = r.duration_ms as i32;
            let sampling_rate = r.sampling_rate as i32;
            let row: [&(dyn ToSql + Sync); 18] = [
                &r.timestamp,
                &exporter_ip,
                &source_ip,
                &destination_ip,
                &source_port,
                &destination_port,
                &protocol,
                &bytes,
                &packets,
                &tcp_flags,
                &tos,
                &input_interface,
                &output_interface,
                &next_hop_ip,
                &source_as,
                &destination_as,
                &flow_duration_ms,
                &sampling_rate,
            ];
            writer.write(&row)?;
        }
        let rows = writer.finish()?;
        debug!("copied {} rows into flow_records", rows);
        Ok(rows)
    }
}

impl FlowSink for Client {
    type Error = Error;

    fn write(&mut self, records: &[FlowRecord]) -> Result<u64> {
        self.insert_flow_records(records)
    }
}
