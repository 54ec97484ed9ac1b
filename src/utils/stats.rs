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

use std::fmt::{self, Write as _};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

#[derive(Clone, Copy, Debug)]
pub enum CounterType {
    Counted,
    Gauged,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CounterValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterValue::Signed(v) => write!(f, "{}", v),
            CounterValue::Unsigned(v) => write!(f, "{}", v),
            CounterValue::Float(v) => write!(f, "{}", v),
        }
    }
}

pub type Counter = (&'static str, CounterType, CounterValue);

pub trait RefCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
}

pub trait OwnedCountable: Send + Sync {
    fn get_counters(&self) -> Vec<Counter>;
    fn closed(&self) -> bool;
}

pub enum Countable {
    Owned(Box<dyn OwnedCountable>),
    Ref(Weak<dyn RefCountable>),
}

impl Countable {
    fn get_counters(&self) -> Vec<Counter> {
        match self {
            Countable::Owned(c) => c.get_counters(),
            Countable::Ref(c) => c.upgrade().map(|c| c.get_counters()).unwrap_or_default(),
        }
    }

    fn closed(&self) -> bool {
        match self {
            Countable::Owned(c) => c.closed(),
            Countable::Ref(c) => c.strong_count() == 0,
        }
    }
}

pub enum StatsOption {
    Tag(&'static str, String),
}

struct Source {
    module: &'static str,
    countable: Countable,
    tags: Vec<(&'static str, String)>,
}

impl PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        self.module == other.module && self.tags == other.tags
    }
}

impl Eq for Source {}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:?}", self.module, self.tags)
    }
}

/// Walks all registered countables on a fixed interval and emits one
/// log line per module with every counter it exposes. Counters are
/// cumulative, reset only at process restart.
pub struct Collector {
    hostname: String,
    interval: Duration,

    sources: Arc<Mutex<Vec<Source>>>,

    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(interval: Duration) -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|s| s.into_string().ok())
                .unwrap_or_default(),
            interval,
            sources: Arc::new(Mutex::new(vec![])),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
        }
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let mut source = Source {
            module,
            countable,
            tags: vec![],
        };
        for option in options {
            match option {
                StatsOption::Tag(k, v) if !source.tags.iter().any(|(key, _)| key == &k) => {
                    source.tags.push((k, v))
                }
                _ => warn!("ignored duplicated tag for module {}", source.module),
            }
        }
        let mut sources = self.sources.lock().unwrap();
        sources.retain(|s| {
            let closed = s.countable.closed();
            let equals = s == &source;
            if !closed && equals {
                warn!(
                    "possible memory leak! countable {} is not correctly closed.",
                    source
                );
            }
            !closed && !equals
        });
        sources.push(source);
    }

    pub fn start(&self) {
        {
            let (started, _) = &*self.running;
            let mut started = started.lock().unwrap();
            if *started {
                return;
            }
            *started = true;
        }

        let running = self.running.clone();
        let sources = self.sources.clone();
        let hostname = self.hostname.clone();
        let interval = self.interval;
        *self.thread.lock().unwrap() = Some(
            thread::Builder::new()
                .name("stats-collector".to_owned())
                .spawn(move || loop {
                    {
                        let mut sources = sources.lock().unwrap();
                        sources.retain(|s| !s.countable.closed());
                        for source in sources.iter() {
                            let points = source.countable.get_counters();
                            if points.is_empty() {
                                continue;
                            }
                            let mut line = String::new();
                            for (k, v) in source.tags.iter() {
                                let _ = write!(line, " {}={}", k, v);
                            }
                            for (name, _, value) in points.iter() {
                                let _ = write!(line, " {}={}", name, value);
                            }
                            info!(
                                "statistics module={} host={}{}",
                                source.module, hostname, line
                            );
                        }
                    }

                    let (running, timer) = &*running;
                    let mut running = running.lock().unwrap();
                    if !*running {
                        break;
                    }
                    running = timer.wait_timeout(running, interval).unwrap().0;
                    if !*running {
                        break;
                    }
                })
                .unwrap(),
        );
        info!("stats collector started");
    }

    pub fn stop(&self) {
        {
            let (started, timer) = &*self.running;
            let mut started = started.lock().unwrap();
            if !*started {
                return;
            }
            *started = false;
            timer.notify_one();
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!("stats collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    struct FakeCounter(AtomicU64);

    impl RefCountable for FakeCounter {
        fn get_counters(&self) -> Vec<Counter> {
            vec![(
                "value",
                CounterType::Counted,
                CounterValue::Unsigned(self.0.load(Ordering::Relaxed)),
            )]
        }
    }

    #[test]
    fn register_and_drop_source() {
        let collector = Collector::new(Duration::from_secs(30));
        let counter = Arc::new(FakeCounter(AtomicU64::new(42)));
        collector.register_countable(
            "fake",
            Countable::Ref(Arc::downgrade(&counter) as Weak<dyn RefCountable>),
            vec![StatsOption::Tag("protocol", "netflow".to_owned())],
        );
        assert_eq!(collector.sources.lock().unwrap().len(), 1);

        // dropping the strong ref closes the source
        drop(counter);
        let sources = collector.sources.lock().unwrap();
        assert!(sources[0].countable.closed());
        assert!(sources[0].countable.get_counters().is_empty());
    }

    #[test]
    fn duplicate_registration_replaces() {
        let collector = Collector::new(Duration::from_secs(30));
        let first = Arc::new(FakeCounter(AtomicU64::new(1)));
        let second = Arc::new(FakeCounter(AtomicU64::new(2)));
        collector.register_countable(
            "fake",
            Countable::Ref(Arc::downgrade(&first) as Weak<dyn RefCountable>),
            vec![],
        );
        collector.register_countable(
            "fake",
            Countable::Ref(Arc::downgrade(&second) as Weak<dyn RefCountable>),
            vec![],
        );
        let sources = collector.sources.lock().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(
            sources[0].countable.get_counters()[0].2,
            CounterValue::Unsigned(2)
        );
    }
}
