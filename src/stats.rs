use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// One hour of per-second QPS samples.
const QPS_WINDOW: usize = 3600;

const QPS_TICK: Duration = Duration::from_millis(100);

/// Process-wide counter set. One instance is created at startup and threaded
/// through every component; all mutation goes through atomics so the query
/// path never takes a lock.
pub struct Stats {
    active: AtomicBool,
    domain_count: AtomicU32,
    domain_normal: AtomicU32,
    domain_blocked: AtomicU32,
    domain_custom: AtomicU32,
    query_count: AtomicU32,
    query_blocked: AtomicU32,
    qps_average: AtomicU32,
    time_started: u64,
    ticker_started: AtomicBool,
    window: Mutex<QpsWindow>,
}

struct QpsWindow {
    samples: VecDeque<u32>,
    last_secs: u64,
    last_count: u32,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub domain_count: u32,
    pub domain_normal: u32,
    pub domain_blocked: u32,
    pub domain_custom: u32,
    pub query_count: u32,
    pub query_blocked: u32,
    pub qps_average: u32,
    pub time_started: u64,
    pub time_last: u64,
    pub last_count: u32,
    pub qps: Vec<u32>,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicBool::new(false),
            domain_count: AtomicU32::new(0),
            domain_normal: AtomicU32::new(0),
            domain_blocked: AtomicU32::new(0),
            domain_custom: AtomicU32::new(0),
            query_count: AtomicU32::new(0),
            query_blocked: AtomicU32::new(0),
            qps_average: AtomicU32::new(0),
            time_started: unix_now(),
            ticker_started: AtomicBool::new(false),
            window: Mutex::new(QpsWindow {
                samples: VecDeque::new(),
                last_secs: 0,
                last_count: 0,
            }),
        })
    }

    /// Start the QPS sampling task. Subsequent calls are no-ops.
    pub fn spawn_qps_ticker(self: &Arc<Self>) {
        if self.ticker_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let stats = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(QPS_TICK);
            loop {
                ticker.tick().await;
                stats.sample_qps();
            }
        });
    }

    pub fn add_query(&self) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_query_blocked(&self) {
        self.query_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_normal_domain(&self) {
        self.domain_normal.fetch_add(1, Ordering::Relaxed);
        self.domain_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_custom_domain(&self) {
        self.domain_custom.fetch_add(1, Ordering::Relaxed);
        self.domain_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_blocked_domain(&self) {
        self.domain_blocked.fetch_add(1, Ordering::Relaxed);
        self.domain_count.fetch_add(1, Ordering::Relaxed);
    }

    /// The filter pipeline (cache + hosts stages) runs only while active.
    pub fn active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn query_count(&self) -> u32 {
        self.query_count.load(Ordering::Relaxed)
    }

    pub fn query_blocked(&self) -> u32 {
        self.query_blocked.load(Ordering::Relaxed)
    }

    pub fn domain_blocked(&self) -> u32 {
        self.domain_blocked.load(Ordering::Relaxed)
    }

    /// Fold the queries observed since the last call into the per-second
    /// ring. Called from the 100ms ticker, so several calls land in the same
    /// wall-clock second and accumulate into one sample.
    fn sample_qps(&self) {
        let now = unix_now();
        let count = self.query_count.load(Ordering::Relaxed);
        let mut window = self.window.lock().unwrap();

        let delta = count.wrapping_sub(window.last_count);
        if window.last_secs == now {
            if let Some(current) = window.samples.back_mut() {
                *current += delta;
            } else {
                window.samples.push_back(delta);
            }
        } else {
            if window.samples.len() >= QPS_WINDOW {
                window.samples.pop_front();
            }
            window.samples.push_back(delta);
        }

        let elapsed = now.saturating_sub(self.time_started);
        let average = if elapsed > 0 {
            count / elapsed as u32
        } else {
            count
        };
        self.qps_average.store(average, Ordering::Relaxed);

        window.last_count = count;
        window.last_secs = now;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let window = self.window.lock().unwrap();
        StatsSnapshot {
            domain_count: self.domain_count.load(Ordering::Relaxed),
            domain_normal: self.domain_normal.load(Ordering::Relaxed),
            domain_blocked: self.domain_blocked.load(Ordering::Relaxed),
            domain_custom: self.domain_custom.load(Ordering::Relaxed),
            query_count: self.query_count.load(Ordering::Relaxed),
            query_blocked: self.query_blocked.load(Ordering::Relaxed),
            qps_average: self.qps_average.load(Ordering::Relaxed),
            time_started: self.time_started,
            time_last: window.last_secs,
            last_count: window.last_count,
            qps: window.samples.iter().copied().collect(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
