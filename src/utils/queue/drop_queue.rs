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

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Condvar, Mutex,
};
use std::time::{Duration, Instant};

use super::Error;
use crate::utils::stats;

pub fn bounded<T>(size: usize) -> (Sender<T>, Receiver<T>, StatsHandle<T>) {
    assert!(size > 0);
    let inner = Arc::new(DropQueue {
        capacity: size,
        queue: Mutex::new(VecDeque::with_capacity(size)),
        notify: Condvar::new(),
        terminated: AtomicBool::new(false),
        senders: AtomicUsize::new(1),
        counter: Counter::default(),
    });
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver {
            inner: inner.clone(),
        },
        StatsHandle { inner },
    )
}

#[derive(Debug, Default)]
pub struct Counter {
    pub input: AtomicU64,
    pub output: AtomicU64,
    pub rejected: AtomicU64,
}

// Fixed capacity MPSC queue. Sending never blocks: at capacity the
// message is rejected, because producers sit on a UDP hot path that
// cannot be paused. The queue closes when the last sender (or the
// receiver) drops; a closed queue still hands out its backlog.
struct DropQueue<T> {
    capacity: usize,

    queue: Mutex<VecDeque<T>>,
    notify: Condvar,

    terminated: AtomicBool,
    senders: AtomicUsize,

    counter: Counter,
}

impl<T> DropQueue<T> {
    fn terminate(&self) {
        let _guard = self.queue.lock().unwrap();
        self.terminated.store(true, Ordering::Release);
        self.notify.notify_all();
    }
}

pub struct Sender<T> {
    inner: Arc<DropQueue<T>>,
}

impl<T> Sender<T> {
    pub fn terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    pub fn send(&self, msg: T) -> Result<(), Error<T>> {
        if self.terminated() {
            return Err(Error::Terminated(Some(msg)));
        }
        let mut queue = self.inner.queue.lock().unwrap();
        if self.inner.terminated.load(Ordering::Acquire) {
            return Err(Error::Terminated(Some(msg)));
        }
        if queue.len() >= self.inner.capacity {
            self.inner.counter.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Full(Some(msg)));
        }
        queue.push_back(msg);
        drop(queue);
        self.inner.counter.input.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_one();
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.senders.fetch_add(1, Ordering::Relaxed);
        Sender {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        // last sender to drop closes the queue
        if self.inner.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.terminate();
        }
    }
}

pub struct Receiver<T> {
    inner: Arc<DropQueue<T>>,
}

impl<T> Receiver<T> {
    pub fn terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    pub fn recv(&self, timeout: Option<Duration>) -> Result<T, Error<T>> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut queue = self.inner.queue.lock().unwrap();
        loop {
            if let Some(msg) = queue.pop_front() {
                self.inner.counter.output.fetch_add(1, Ordering::Relaxed);
                return Ok(msg);
            }
            if self.inner.terminated.load(Ordering::Acquire) {
                return Err(Error::Terminated(None));
            }
            queue = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.inner
                        .notify
                        .wait_timeout(queue, deadline - now)
                        .unwrap()
                        .0
                }
                None => self.inner.notify.wait(queue).unwrap(),
            };
        }
    }

    // Clears `msgs` and receives at most `msgs.capacity()` messages.
    pub fn recv_all(&self, msgs: &mut Vec<T>, timeout: Option<Duration>) -> Result<(), Error<T>> {
        msgs.clear();
        let max_recv = msgs.capacity();
        assert!(max_recv > 0);
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut queue = self.inner.queue.lock().unwrap();
        loop {
            if !queue.is_empty() {
                while msgs.len() < max_recv {
                    match queue.pop_front() {
                        Some(msg) => msgs.push(msg),
                        None => break,
                    }
                }
                self.inner
                    .counter
                    .output
                    .fetch_add(msgs.len() as u64, Ordering::Relaxed);
                return Ok(());
            }
            if self.inner.terminated.load(Ordering::Acquire) {
                return Err(Error::Terminated(None));
            }
            queue = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.inner
                        .notify
                        .wait_timeout(queue, deadline - now)
                        .unwrap()
                        .0
                }
                None => self.inner.notify.wait(queue).unwrap(),
            };
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.terminate();
    }
}

pub struct StatsHandle<T> {
    inner: Arc<DropQueue<T>>,
}

impl<T: Send> stats::OwnedCountable for StatsHandle<T> {
    fn get_counters(&self) -> Vec<stats::Counter> {
        let pending = self.inner.queue.lock().unwrap().len();
        vec![
            (
                "in",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.inner.counter.input.load(Ordering::Relaxed)),
            ),
            (
                "out",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.inner.counter.output.load(Ordering::Relaxed)),
            ),
            (
                "rejected",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(self.inner.counter.rejected.load(Ordering::Relaxed)),
            ),
            (
                "pending",
                stats::CounterType::Gauged,
                stats::CounterValue::Unsigned(pending as u64),
            ),
        ]
    }

    fn closed(&self) -> bool {
        self.inner.terminated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::thread;

    use super::*;
    use crate::utils::stats::OwnedCountable;

    #[test]
    fn one_element_send_receive() {
        let (s, r, _) = bounded(2);
        let h = thread::spawn(move || {
            let v: u64 = r.recv(None).unwrap();
            assert_eq!(v, 42, "expected: 42, result: {}", v);
        });
        s.send(42u64).unwrap();
        h.join().unwrap();
    }

    #[test]
    fn full_queue_rejects() {
        let (s, r, handle) = bounded(2);
        s.send(1).unwrap();
        s.send(2).unwrap();
        assert_eq!(s.send(3), Err(Error::Full(Some(3))));
        assert_eq!(s.send(4), Err(Error::Full(Some(4))));

        // rejected messages are gone, accepted ones keep their order
        assert_eq!(r.recv(None).unwrap(), 1);
        assert_eq!(r.recv(None).unwrap(), 2);

        let counters = handle.get_counters();
        assert_eq!(counters[0].2, stats::CounterValue::Unsigned(2)); // in
        assert_eq!(counters[2].2, stats::CounterValue::Unsigned(2)); // rejected
    }

    #[test]
    fn dequeue_after_reject_makes_room() {
        let (s, r, _) = bounded(1);
        s.send(1).unwrap();
        assert_eq!(s.send(2), Err(Error::Full(Some(2))));
        assert_eq!(r.recv(None).unwrap(), 1);
        s.send(3).unwrap();
        assert_eq!(r.recv(None).unwrap(), 3);
    }

    #[test]
    fn multiple_senders() {
        let (s, r, _) = bounded(1024);
        for i in 0..10 {
            let sender = s.clone();
            thread::spawn(move || {
                for j in 1..=10 {
                    sender.send(i * 100 + j).unwrap();
                }
            });
        }
        mem::drop(s);

        let mut count = 0;
        loop {
            match r.recv(Some(Duration::from_secs(5))) {
                Ok(_) => count += 1,
                Err(Error::Terminated(..)) => break,
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn timeout_and_terminate() {
        let (s, r, _) = bounded(4);

        let e: Error<u64> = r.recv(Some(Duration::from_millis(10))).err().unwrap();
        assert_eq!(e, Error::Timeout);

        s.send(42).unwrap();
        s.send(43).unwrap();
        mem::drop(s);

        // backlog drains after close, then terminated
        let mut msgs = Vec::with_capacity(100);
        r.recv_all(&mut msgs, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(msgs, vec![42, 43]);
        let e = r.recv(Some(Duration::from_millis(10))).err().unwrap();
        assert_eq!(e, Error::Terminated(None));
    }

    #[test]
    fn send_after_close_fails() {
        let (s, r, _) = bounded(4);
        mem::drop(r);
        assert_eq!(s.send(1), Err(Error::Terminated(Some(1))));
    }

    #[test]
    fn recv_all_respects_capacity() {
        let (s, r, _) = bounded(16);
        for i in 0..10 {
            s.send(i).unwrap();
        }
        let mut msgs = Vec::with_capacity(4);
        r.recv_all(&mut msgs, None).unwrap();
        assert_eq!(msgs, vec![0, 1, 2, 3]);
        r.recv_all(&mut msgs, None).unwrap();
        assert_eq!(msgs, vec![4, 5, 6, 7]);
    }

    #[test]
    fn pending_gauge_tracks_depth() {
        let (s, r, handle) = bounded(8);
        for i in 0..5 {
            s.send(i).unwrap();
        }
        assert_eq!(
            handle.get_counters()[3].2,
            stats::CounterValue::Unsigned(5)
        );
        let _ = r.recv(None).unwrap();
        assert_eq!(
            handle.get_counters()[3].2,
            stats::CounterValue::Unsigned(4)
        );
    }
}
