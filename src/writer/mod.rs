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

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::common::FlowRecord;
use crate::utils::queue::{self, Receiver};
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

// records read from the queue per wakeup
pub const QUEUE_BATCH_SIZE: usize = 1024;
// upper bound on one queue wait, keeps the stop flag observed
const QUEUE_READ_TIMEOUT: Duration = Duration::from_secs(3);

/// Where finished batches go. The single production implementation is
/// the database client; tests plug in their own.
pub trait FlowSink: Send {
    type Error: fmt::Display;

    fn write(&mut self, records: &[FlowRecord]) -> Result<u64, Self::Error>;
}

#[derive(Debug, Default)]
pub struct WriterCounter {
    pub rx: AtomicU64,
    pub batches_ok: AtomicU64,
    pub batches_failed: AtomicU64,
    pub records_written: AtomicU64,
    pub records_dropped: AtomicU64,
}

impl RefCountable for WriterCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rx",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx.load(Ordering::Relaxed)),
            ),
            (
                "batches_ok",
                CounterType::Counted,
                CounterValue::Unsigned(self.batches_ok.load(Ordering::Relaxed)),
            ),
            (
                "batches_failed",
                CounterType::Counted,
                CounterValue::Unsigned(self.batches_failed.load(Ordering::Relaxed)),
            ),
            (
                "records_written",
                CounterType::Counted,
                CounterValue::Unsigned(self.records_written.load(Ordering::Relaxed)),
            ),
            (
                "records_dropped",
                CounterType::Counted,
                CounterValue::Unsigned(self.records_dropped.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/// Thread wrapper around [`FlowWriter`].
pub struct FlowWriterThread<S> {
    input: Option<Receiver<FlowRecord>>,
    sink: Option<S>,
    batch_size: usize,
    flush_interval: Duration,

    counter: Arc<WriterCounter>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<S: FlowSink + 'static> FlowWriterThread<S> {
    pub fn new(
        input: Receiver<FlowRecord>,
        sink: S,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            input: Some(input),
            sink: Some(sink),
            batch_size,
            flush_interval,
            counter: Arc::new(WriterCounter::default()),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn counter(&self) -> &Arc<WriterCounter> {
        &self.counter
    }

    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::Relaxed) {
            warn!("flow writer already started, do nothing.");
            return;
        }
        let mut writer = FlowWriter {
            input: self.input.take().unwrap(),
            sink: self.sink.take().unwrap(),
            batch: Vec::with_capacity(self.batch_size),
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            counter: self.counter.clone(),
            running: self.running.clone(),
        };
        self.thread = Some(
            thread::Builder::new()
                .name("flow-writer".to_owned())
                .spawn(move || writer.process())
                .unwrap(),
        );
        info!(
            "flow writer started, batch size {}, flush interval {:?}",
            self.batch_size, self.flush_interval
        );
    }

    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            warn!("flow writer already stopped, do nothing.");
            return;
        }
        info!("stopping flow writer");
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        info!("stopped flow writer");
    }
}

struct FlowWriter<S> {
    input: Receiver<FlowRecord>,
    sink: S,

    batch: Vec<FlowRecord>,
    batch_size: usize,
    flush_interval: Duration,

    counter: Arc<WriterCounter>,
    running: Arc<AtomicBool>,
}

impl<S: FlowSink> FlowWriter<S> {
    // Single consumer loop: wait for records, a tick or termination,
    // whichever comes first. Size-triggered flushes do not reset the
    // tick.
    fn process(&mut self) {
        let mut chunk: Vec<FlowRecord> = Vec::with_capacity(QUEUE_BATCH_SIZE);
        let mut next_tick = Instant::now() + self.flush_interval;
        loop {
            let timeout = next_tick
                .saturating_duration_since(Instant::now())
                .min(QUEUE_READ_TIMEOUT);
            match self.input.recv_all(&mut chunk, Some(timeout)) {
                Ok(()) => {
                    self.counter
                        .rx
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    for record in chunk.drain(..) {
                        self.batch.push(record);
                        if self.batch.len() >= self.batch_size {
                            self.flush();
                        }
                    }
                }
                Err(queue::Error::Timeout) => (),
                Err(queue::Error::Terminated(..)) => {
                    // the queue has been drained dry, write what's left
                    self.flush();
                    break;
                }
                Err(queue::Error::Full(..)) => unreachable!(),
            }
            if Instant::now() >= next_tick {
                self.flush();
                next_tick = Instant::now() + self.flush_interval;
            }
            if !self.running.load(Ordering::Relaxed) {
                self.flush();
                break;
            }
        }
        info!("flow writer drained");
    }

    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        match self.sink.write(&self.batch) {
            Ok(rows) => {
                self.counter.batches_ok.fetch_add(1, Ordering::Relaxed);
                self.counter
                    .records_written
                    .fetch_add(self.batch.len() as u64, Ordering::Relaxed);
                debug!("wrote {} flow records", rows);
            }
            Err(e) => {
                // at-most-once: the batch is dropped, never requeued,
                // so a dead database cannot grow memory without bound
                self.counter.batches_failed.fetch_add(1, Ordering::Relaxed);
                self.counter
                    .records_dropped
                    .fetch_add(self.batch.len() as u64, Ordering::Relaxed);
                warn!("failed to write batch of {} flow records: {}", self.batch.len(), e);
            }
        }
        self.batch.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::sync::Mutex;

    use super::*;
    use crate::utils::queue::bounded;
    use crate::utils::stats::OwnedCountable;

    #[derive(Clone, Default)]
    struct MockSink {
        batches: Arc<Mutex<Vec<usize>>>,
        fail: Arc<AtomicBool>,
    }

    impl FlowSink for MockSink {
        type Error = String;

        fn write(&mut self, records: &[FlowRecord]) -> Result<u64, String> {
            if self.fail.load(Ordering::Relaxed) {
                return Err("database unavailable".to_owned());
            }
            self.batches.lock().unwrap().push(records.len());
            Ok(records.len() as u64)
        }
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn size_triggered_flush() {
        let (sender, receiver, _) = bounded(1024);
        let sink = MockSink::default();
        let batches = sink.batches.clone();
        let mut writer = FlowWriterThread::new(receiver, sink, 10, Duration::from_secs(3600));
        writer.start();

        for _ in 0..25 {
            sender.send(FlowRecord::default()).unwrap();
        }
        wait_until(|| writer.counter().records_written.load(Ordering::Relaxed) == 20);
        assert_eq!(*batches.lock().unwrap(), vec![10, 10]);
        // the remaining 5 sit in the batch until a tick or shutdown
        assert_eq!(writer.counter().batches_ok.load(Ordering::Relaxed), 2);

        mem::drop(sender);
        writer.stop();
        assert_eq!(*batches.lock().unwrap(), vec![10, 10, 5]);
        assert_eq!(writer.counter().records_written.load(Ordering::Relaxed), 25);
    }

    #[test]
    fn tick_triggered_flush() {
        let (sender, receiver, _) = bounded(1024);
        let sink = MockSink::default();
        let batches = sink.batches.clone();
        let mut writer =
            FlowWriterThread::new(receiver, sink, 10000, Duration::from_millis(100));
        writer.start();

        for _ in 0..7 {
            sender.send(FlowRecord::default()).unwrap();
        }
        // far below batch size; only the ticker can flush these
        wait_until(|| batches.lock().unwrap().iter().sum::<usize>() == 7);

        mem::drop(sender);
        writer.stop();
    }

    #[test]
    fn failed_batches_are_dropped_and_counted() {
        let (sender, receiver, _) = bounded(1024);
        let sink = MockSink::default();
        let batches = sink.batches.clone();
        let fail = sink.fail.clone();
        let mut writer = FlowWriterThread::new(receiver, sink, 5, Duration::from_secs(3600));
        writer.start();

        fail.store(true, Ordering::Relaxed);
        for _ in 0..5 {
            sender.send(FlowRecord::default()).unwrap();
        }
        wait_until(|| writer.counter().records_dropped.load(Ordering::Relaxed) == 5);
        assert_eq!(writer.counter().batches_failed.load(Ordering::Relaxed), 1);
        assert!(batches.lock().unwrap().is_empty());

        // writer keeps going after a failure, records are not replayed
        fail.store(false, Ordering::Relaxed);
        for _ in 0..5 {
            sender.send(FlowRecord::default()).unwrap();
        }
        wait_until(|| writer.counter().records_written.load(Ordering::Relaxed) == 5);
        assert_eq!(*batches.lock().unwrap(), vec![5]);

        mem::drop(sender);
        writer.stop();
    }

    #[test]
    fn shutdown_flushes_remaining_records() {
        let (sender, receiver, _) = bounded(1024);
        let sink = MockSink::default();
        let batches = sink.batches.clone();
        let mut writer =
            FlowWriterThread::new(receiver, sink, 10000, Duration::from_secs(3600));

        for _ in 0..500 {
            sender.send(FlowRecord::default()).unwrap();
        }
        writer.start();
        // closing the queue triggers exactly one final batch
        mem::drop(sender);
        writer.stop();

        assert_eq!(*batches.lock().unwrap(), vec![500]);
        assert_eq!(writer.counter().records_written.load(Ordering::Relaxed), 500);
        assert_eq!(writer.counter().batches_ok.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn overflow_sheds_then_drains_exactly_what_was_accepted() {
        // writer paused: fill a 10k buffer with 30k records
        let (sender, receiver, stats) = bounded(10000);
        let mut accepted = 0u64;
        let mut rejected = 0u64;
        for _ in 0..30000 {
            match sender.send(FlowRecord::default()) {
                Ok(()) => accepted += 1,
                Err(queue::Error::Full(_)) => rejected += 1,
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }
        assert_eq!(accepted, 10000);
        assert_eq!(rejected, 20000);
        let counters = stats.get_counters();
        assert_eq!(counters[2].2, CounterValue::Unsigned(20000)); // rejected

        // resume: everything accepted is written, nothing more
        let sink = MockSink::default();
        let batches = sink.batches.clone();
        let mut writer = FlowWriterThread::new(receiver, sink, 10000, Duration::from_secs(3600));
        writer.start();
        mem::drop(sender);
        writer.stop();

        assert_eq!(
            writer.counter().records_written.load(Ordering::Relaxed),
            accepted
        );
        assert_eq!(batches.lock().unwrap().iter().sum::<usize>(), 10000);
    }
}
