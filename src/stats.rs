//! Process-wide relay counters and the periodic report.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Counters bumped by the acceptor and the workers.
///
/// Monitoring-grade only: every update is a relaxed atomic.
#[derive(Debug)]
pub struct Stats {
    total_requests: AtomicU64,
    errors: AtomicU64,
    evictions: AtomicU64,
    rejected: AtomicU64,
    queue_size: AtomicUsize,
    busy_workers: AtomicUsize,
    start_time: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            queue_size: AtomicUsize::new(0),
            busy_workers: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.store(size, Ordering::Relaxed);
    }

    pub(crate) fn worker_busy(&self) {
        self.busy_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_idle(&self) {
        self.busy_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn queue_size(&self) -> usize {
        self.queue_size.load(Ordering::Relaxed)
    }

    pub fn busy_workers(&self) -> usize {
        self.busy_workers.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed = self.start_time.elapsed();
        let total_requests = self.total_requests();

        StatsSnapshot {
            total_requests,
            requests_per_second: requests_per_second(total_requests, elapsed),
            errors: self.errors(),
            queue_size: self.queue_size(),
            evictions: self.evictions(),
            rejected: self.rejected(),
            busy_workers: self.busy_workers(),
        }
    }
}

/// Average rate since startup. Zero when nothing happened yet or no time has passed.
pub fn requests_per_second(total_requests: u64, elapsed: Duration) -> f64 {
    let seconds = elapsed.as_secs_f64();
    if total_requests == 0 || seconds <= 0.0 {
        return 0.0;
    }
    total_requests as f64 / seconds
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub requests_per_second: f64,
    pub errors: u64,
    pub queue_size: usize,
    pub evictions: u64,
    pub rejected: u64,
    pub busy_workers: usize,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Requests: {} | RPS: {:.2} | Errors: {} | Queue: {} | Evicted: {} | Rejected: {} | Busy workers: {}",
            self.total_requests,
            self.requests_per_second,
            self.errors,
            self.queue_size,
            self.evictions,
            self.rejected,
            self.busy_workers,
        )
    }
}

/// Logs a snapshot every `interval` until `shutdown` fires, then logs a final one.
pub async fn report(stats: Arc<Stats>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => info!("{}", stats.snapshot()),
            _ = shutdown.cancelled() => break,
        }
    }

    info!("Final: {}", stats.snapshot());
}
