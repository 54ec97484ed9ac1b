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

use thiserror::Error;

// Errors fatal to process startup. Everything past startup is handled
// and counted inside the component that hit it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config invalid: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("bind {addr} failed: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },
    #[error("database unavailable: {0}")]
    DatabasePing(#[from] crate::db::Error),
    #[error("logger init failed: {0}")]
    Logger(#[from] flexi_logger::FlexiLoggerError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
