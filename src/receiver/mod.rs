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

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use socket2::{Domain, Socket, Type};

use crate::common::FlowRecord;
use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::utils::queue::{self, Sender};
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

// sized for jumbo frames, reused across reads
const RECV_BUFFER_SIZE: usize = 9000;
// read deadline; bounds how long workers take to observe shutdown
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct ReceiverCounter {
    pub rx: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub io_errors: AtomicU64,
}

impl RefCountable for ReceiverCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rx",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx.load(Ordering::Relaxed)),
            ),
            (
                "rx_bytes",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx_bytes.load(Ordering::Relaxed)),
            ),
            (
                "io_errors",
                CounterType::Counted,
                CounterValue::Unsigned(self.io_errors.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/// A pool of workers draining one UDP socket into the flow queue.
///
/// All workers share the socket; the kernel serializes reads. Decoded
/// records go to the bounded queue, and when the queue is full the
/// record is dropped on the spot: the exporters cannot be throttled,
/// so shedding here beats filling the kernel buffer and losing
/// datagrams without a trace.
pub struct UdpReceiver {
    name: &'static str,
    socket: Arc<UdpSocket>,
    workers: usize,

    decoder: Arc<dyn Decoder>,
    output: Sender<FlowRecord>,
    counter: Arc<ReceiverCounter>,

    running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpReceiver {
    pub fn new(
        name: &'static str,
        listen: SocketAddr,
        workers: usize,
        recv_buffer_size: usize,
        decoder: Arc<dyn Decoder>,
        output: Sender<FlowRecord>,
    ) -> Result<Self> {
        assert!(workers > 0);
        let socket = Self::bind(listen, recv_buffer_size).map_err(|e| Error::BindFailed {
            addr: listen.to_string(),
            source: e,
        })?;
        Ok(Self {
            name,
            socket: Arc::new(socket),
            workers,
            decoder,
            output,
            counter: Arc::new(ReceiverCounter::default()),
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(vec![]),
        })
    }

    fn bind(addr: SocketAddr, recv_buffer_size: usize) -> std::io::Result<UdpSocket> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, None)?;
        if let Err(e) = socket.set_recv_buffer_size(recv_buffer_size) {
            warn!(
                "set receive buffer to {} bytes failed: {}, kernel default in effect",
                recv_buffer_size, e
            );
        }
        socket.bind(&addr.into())?;
        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        Ok(socket)
    }

    pub fn counter(&self) -> &Arc<ReceiverCounter> {
        &self.counter
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("{} receiver already started, do nothing.", self.name);
            return;
        }
        let mut threads = self.threads.lock().unwrap();
        for _ in 0..self.workers {
            let name = self.name;
            let running = self.running.clone();
            let socket = self.socket.clone();
            let decoder = self.decoder.clone();
            let output = self.output.clone();
            let counter = self.counter.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("{}-receiver", self.name))
                    .spawn(move || Self::process(name, running, socket, decoder, output, counter))
                    .unwrap(),
            );
        }
        info!(
            "{} receiver listening on {} with {} workers",
            self.name,
            self.socket
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            self.workers
        );
    }

    fn process(
        name: &'static str,
        running: Arc<AtomicBool>,
        socket: Arc<UdpSocket>,
        decoder: Arc<dyn Decoder>,
        output: Sender<FlowRecord>,
        counter: Arc<ReceiverCounter>,
    ) {
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        while running.load(Ordering::Relaxed) {
            let (n, remote) = match socket.recv_from(&mut buffer) {
                Ok(read) => read,
                // read deadline, loop around to check the running flag
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue
                }
                Err(e) => {
                    counter.io_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("{} receiver read failed: {}", name, e);
                    continue;
                }
            };
            counter.rx.fetch_add(1, Ordering::Relaxed);
            counter.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);

            let records = match decoder.decode(&buffer[..n], remote.ip()) {
                Ok(records) => records,
                Err(e) => {
                    debug!("{} decode from {} failed: {}", name, remote.ip(), e);
                    continue;
                }
            };
            for record in records {
                match output.send(record) {
                    Ok(()) => (),
                    // intentional shedding, counted by the queue
                    Err(queue::Error::Full(_)) => (),
                    Err(queue::Error::Terminated(_)) => return,
                    Err(queue::Error::Timeout) => unreachable!(),
                }
            }
        }
    }

    pub fn notify_stop(&self) -> Vec<JoinHandle<()>> {
        if !self.running.swap(false, Ordering::Relaxed) {
            return vec![];
        }
        info!("notified stopping {} receiver", self.name);
        self.threads.lock().unwrap().drain(..).collect()
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("{} receiver already stopped, do nothing.", self.name);
            return;
        }
        info!("stopping {} receiver", self.name);
        for handle in self.threads.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        info!("stopped {} receiver", self.name);
    }
}
