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

use std::panic;

use anyhow::Result;
use clap::{ArgAction, Parser};
use log::error;
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

use xflow_ingester::{config::Config, ingester::Ingester};

#[derive(Parser)]
struct Opts {
    /// Specify config file location
    #[clap(
        short = 'f',
        visible_short_alias = 'c',
        long,
        default_value = "/etc/xflow-ingester.yaml"
    )]
    config_file: String,

    /// Display the version
    #[clap(short, long, action = ArgAction::SetTrue)]
    version: bool,
}

fn wait_on_signals() {
    let mut signals = Signals::new(TERM_SIGNALS).unwrap();
    signals.forever().next();
    signals.handle().close();
}

fn main() -> Result<()> {
    panic::set_hook(Box::new(|panic_info| {
        error!("{:?}", panic_info.to_string());
    }));
    let opts = Opts::parse();
    if opts.version {
        println!("xflow-ingester {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    let config = Config::load_from_file(&opts.config_file)?;
    let mut ingester = Ingester::new(config)?;
    ingester.start();
    wait_on_signals();
    ingester.stop();

    Ok(())
}
