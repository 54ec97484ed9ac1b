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

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::common::{DEFAULT_NETFLOW_PORT, DEFAULT_SFLOW_PORT};

const DEFAULT_LOG_FILE: &str = "/var/log/xflow-ingester/xflow-ingester.log";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
    #[error("listen address invalid: {0}")]
    ListenInvalid(String),
    #[error("collectors share listen address: {0}")]
    ListenConflict(String),
    #[error("{0} must be greater than zero")]
    NotPositive(&'static str),
    #[error("no collector enabled")]
    NoCollectorEnabled,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub log_file: String,
    #[serde(with = "LevelDef")]
    pub log_level: log::Level,
    pub collectors: CollectorsConfig,
    pub database: DatabaseConfig,
    pub performance: PerformanceConfig,
    pub monitoring: MonitoringConfig,
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        let mut config: Self = if contents.is_empty() {
            // parsing empty string leads to EOF error
            Self::default()
        } else {
            serde_yaml::from_str(contents)
                .map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?
        };
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    // A partially-specified collector section deserializes against
    // `CollectorConfig::default()`, which carries no endpoint; the
    // per-protocol port is filled in here.
    fn normalize(&mut self) {
        if self.collectors.netflow.listen.is_empty() {
            self.collectors.netflow.listen = format!("0.0.0.0:{}", DEFAULT_NETFLOW_PORT);
        }
        if self.collectors.sflow.listen.is_empty() {
            self.collectors.sflow.listen = format!("0.0.0.0:{}", DEFAULT_SFLOW_PORT);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.collectors.netflow.enabled && !self.collectors.sflow.enabled {
            return Err(ConfigError::NoCollectorEnabled);
        }
        for collector in [&self.collectors.netflow, &self.collectors.sflow] {
            if !collector.enabled {
                continue;
            }
            collector.listen_addr()?;
            if collector.workers == 0 {
                return Err(ConfigError::NotPositive("collector workers"));
            }
        }
        // a shared endpoint would only surface later as a bind failure
        if self.collectors.netflow.enabled
            && self.collectors.sflow.enabled
            && self.collectors.netflow.listen_addr()? == self.collectors.sflow.listen_addr()?
        {
            return Err(ConfigError::ListenConflict(
                self.collectors.netflow.listen.clone(),
            ));
        }
        if self.performance.buffer_size == 0 {
            return Err(ConfigError::NotPositive("performance.buffer-size"));
        }
        if self.performance.flush_interval == 0 {
            return Err(ConfigError::NotPositive("performance.flush-interval"));
        }
        if self.performance.udp_buffer_size == 0 {
            return Err(ConfigError::NotPositive("performance.udp-buffer-size"));
        }
        if self.monitoring.stats_interval == 0 {
            return Err(ConfigError::NotPositive("monitoring.stats-interval"));
        }
        if self.database.pool_size == 0 {
            return Err(ConfigError::NotPositive("database.pool-size"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: DEFAULT_LOG_FILE.into(),
            log_level: log::Level::Info,
            collectors: Default::default(),
            database: Default::default(),
            performance: Default::default(),
            monitoring: Default::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct CollectorsConfig {
    pub netflow: CollectorConfig,
    pub sflow: CollectorConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct CollectorConfig {
    pub listen: String,
    pub workers: usize,
    pub enabled: bool,
}

impl CollectorConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::ListenInvalid(self.listen.clone()))
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            // protocol-specific, resolved by Config::normalize
            listen: String::new(),
            workers: 1,
            enabled: true,
        }
    }
}

impl Default for CollectorsConfig {
    fn default() -> Self {
        CollectorsConfig {
            netflow: CollectorConfig {
                listen: format!("0.0.0.0:{}", DEFAULT_NETFLOW_PORT),
                ..Default::default()
            },
            sflow: CollectorConfig {
                listen: format!("0.0.0.0:{}", DEFAULT_SFLOW_PORT),
                ..Default::default()
            },
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            host: "127.0.0.1".into(),
            port: 5432,
            database: "xflow".into(),
            user: "xflow".into(),
            password: "".into(),
            pool_size: 20,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct PerformanceConfig {
    // queue capacity and writer batch size, in records
    pub buffer_size: usize,
    // seconds between forced flushes
    pub flush_interval: u64,
    // SO_RCVBUF, in bytes
    pub udp_buffer_size: usize,
}

impl PerformanceConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval)
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        PerformanceConfig {
            buffer_size: 10000,
            flush_interval: 5,
            udp_buffer_size: 25 << 20,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct MonitoringConfig {
    pub enabled: bool,
    // seconds between statistics reports
    pub stats_interval: u64,
}

impl MonitoringConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval)
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            enabled: true,
            stats_interval: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(remote = "log::Level", rename_all = "kebab-case")]
enum LevelDef {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
