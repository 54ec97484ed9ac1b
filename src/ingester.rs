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

use std::path::Path;
use std::sync::{Arc, Weak};

use flexi_logger::{
    colored_opt_format, Age, Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming,
};
use log::{info, warn};

use crate::config::Config;
use crate::db;
use crate::decoder::{netflow::NetflowParser, sflow::SflowParser, Decoder};
use crate::error::Result;
use crate::receiver::UdpReceiver;
use crate::utils::queue;
use crate::utils::stats::{self, Countable, RefCountable, StatsOption};
use crate::writer::FlowWriterThread;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum State {
    Created,
    Running,
    Draining,
    Stopped,
}

struct Components {
    receivers: Vec<UdpReceiver>,
    writer: FlowWriterThread<db::Client>,
    stats_collector: Arc<stats::Collector>,
    monitoring_enabled: bool,
}

/// Wires the pipeline together and owns its lifetime.
///
/// Construction does everything that may fail: config validation
/// happened at load, the database must answer a ping and every enabled
/// listener must bind. `start` only spawns threads, writer before
/// receivers so records never pile up unconsumed.
pub struct Ingester {
    state: State,
    components: Option<Components>,
    _logger: LoggerHandle,
}

impl Ingester {
    pub fn new(config: Config) -> Result<Self> {
        let logger = init_logger(&config)?;
        info!("==================== Launching xFlow Ingester ====================");

        let db_client = db::Client::connect(&config.database)?;
        db_client.ping()?;
        info!(
            "connected to database {}:{}/{}",
            config.database.host, config.database.port, config.database.database
        );

        let stats_collector = Arc::new(stats::Collector::new(config.monitoring.stats_interval()));

        let (sender, receiver, queue_counter) = queue::bounded(config.performance.buffer_size);
        stats_collector.register_countable(
            "queue",
            Countable::Owned(Box::new(queue_counter)),
            vec![StatsOption::Tag("module", "flow-record-to-writer".to_owned())],
        );

        let writer = FlowWriterThread::new(
            receiver,
            db_client,
            config.performance.buffer_size,
            config.performance.flush_interval(),
        );
        stats_collector.register_countable(
            "writer",
            Countable::Ref(Arc::downgrade(writer.counter()) as Weak<dyn RefCountable>),
            vec![],
        );

        let mut receivers = vec![];
        if config.collectors.netflow.enabled {
            let parser = Arc::new(NetflowParser::new());
            stats_collector.register_countable(
                "decoder",
                Countable::Ref(Arc::downgrade(parser.counter()) as Weak<dyn RefCountable>),
                vec![StatsOption::Tag("protocol", "netflow".to_owned())],
            );
            let udp_receiver = UdpReceiver::new(
                "netflow",
                config.collectors.netflow.listen_addr()?,
                config.collectors.netflow.workers,
                config.performance.udp_buffer_size,
                parser as Arc<dyn Decoder>,
                sender.clone(),
            )?;
            stats_collector.register_countable(
                "receiver",
                Countable::Ref(Arc::downgrade(udp_receiver.counter()) as Weak<dyn RefCountable>),
                vec![StatsOption::Tag("protocol", "netflow".to_owned())],
            );
            receivers.push(udp_receiver);
        }
        if config.collectors.sflow.enabled {
            let parser = Arc::new(SflowParser::new());
            stats_collector.register_countable(
                "decoder",
                Countable::Ref(Arc::downgrade(parser.counter()) as Weak<dyn RefCountable>),
                vec![StatsOption::Tag("protocol", "sflow".to_owned())],
            );
            let udp_receiver = UdpReceiver::new(
                "sflow",
                config.collectors.sflow.listen_addr()?,
                config.collectors.sflow.workers,
                config.performance.udp_buffer_size,
                parser as Arc<dyn Decoder>,
                sender.clone(),
            )?;
            stats_collector.register_countable(
                "receiver",
                Countable::Ref(Arc::downgrade(udp_receiver.counter()) as Weak<dyn RefCountable>),
                vec![StatsOption::Tag("protocol", "sflow".to_owned())],
            );
            receivers.push(udp_receiver);
        }
        // receivers hold the only remaining senders; when the last one
        // stops the queue closes and the writer drains
        drop(sender);

        Ok(Ingester {
            state: State::Created,
            components: Some(Components {
                receivers,
                writer,
                stats_collector,
                monitoring_enabled: config.monitoring.enabled,
            }),
            _logger: logger,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn start(&mut self) {
        if self.state != State::Created {
            warn!("ingester in state {:?}, cannot start", self.state);
            return;
        }
        let components = self.components.as_mut().unwrap();
        components.writer.start();
        for receiver in components.receivers.iter() {
            receiver.start();
        }
        if components.monitoring_enabled {
            components.stats_collector.start();
        }
        self.state = State::Running;
        info!("xflow ingester started");
    }

    pub fn stop(&mut self) {
        if self.state != State::Running {
            warn!("ingester in state {:?}, cannot stop", self.state);
            return;
        }
        self.state = State::Draining;
        info!("stopping xflow ingester");

        let mut components = self.components.take().unwrap();
        // stop producing first; workers return within one read timeout
        let mut handles = vec![];
        for receiver in components.receivers.iter() {
            handles.extend(receiver.notify_stop());
        }
        for handle in handles {
            let _ = handle.join();
        }
        // dropping the receivers drops the last queue senders, the
        // writer then drains the backlog and performs its final flush
        drop(components.receivers);
        components.writer.stop();
        components.stats_collector.stop();

        self.state = State::Stopped;
        info!("xflow ingester stopped");
    }
}

fn init_logger(config: &Config) -> Result<LoggerHandle> {
    let logger = Logger::try_with_str(config.log_level.as_str().to_lowercase())?
        .format_for_files(colored_opt_format)
        .log_to_file(FileSpec::try_from(Path::new(&config.log_file))?)
        .rotate(Criterion::Age(Age::Day), Naming::Timestamps, Cleanup::Never)
        .create_symlink(&config.log_file)
        .append()
        .duplicate_to_stderr(Duplicate::All)
        .start()?;
    Ok(logger)
}
