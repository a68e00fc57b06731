use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

const LATENCY_WINDOW_CAPACITY: usize = 512;

/// Rolling window of flush latencies in microseconds. Fixed capacity; old
/// samples are overwritten in ring order.
#[derive(Debug)]
struct LatencyWindow {
    values: Vec<u64>,
    len: usize,
    cursor: usize,
}

impl LatencyWindow {
    fn new() -> Self {
        Self {
            values: vec![0; LATENCY_WINDOW_CAPACITY],
            len: 0,
            cursor: 0,
        }
    }

    fn push(&mut self, value_us: u64) {
        self.values[self.cursor] = value_us;
        self.cursor = (self.cursor + 1) % LATENCY_WINDOW_CAPACITY;
        if self.len < LATENCY_WINDOW_CAPACITY {
            self.len += 1;
        }
    }

    fn average_and_p95(&self) -> (Option<u64>, Option<u64>) {
        if self.len == 0 {
            return (None, None);
        }
        let mut snapshot: Vec<u64> = self.values[..self.len].to_vec();
        snapshot.sort_unstable();
        let sum: u64 = snapshot.iter().sum();
        let average = sum / self.len as u64;
        let index = (self.len - 1).saturating_mul(95) / 100;
        (Some(average), snapshot.get(index).copied())
    }
}

/// Counters shared between the dispatcher side and the scheduler side.
/// Relaxed ordering everywhere; nothing here synchronizes data.
#[derive(Debug)]
pub struct PipelineMetrics {
    ticks_received: AtomicU64,
    ticks_rejected_stale: AtomicU64,
    ticks_duplicate: AtomicU64,
    gaps_total: AtomicU64,
    updates_flushed: AtomicU64,
    flushes_attempted: AtomicU64,
    flushes_succeeded: AtomicU64,
    flushes_skipped: AtomicU64,
    stale_symbols: AtomicU64,
    instrument_count: AtomicU64,
    retention_evicted_total: AtomicU64,
    producer_restarts: AtomicU64,
    flush_latency: Mutex<LatencyWindow>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self {
            ticks_received: AtomicU64::new(0),
            ticks_rejected_stale: AtomicU64::new(0),
            ticks_duplicate: AtomicU64::new(0),
            gaps_total: AtomicU64::new(0),
            updates_flushed: AtomicU64::new(0),
            flushes_attempted: AtomicU64::new(0),
            flushes_succeeded: AtomicU64::new(0),
            flushes_skipped: AtomicU64::new(0),
            stale_symbols: AtomicU64::new(0),
            instrument_count: AtomicU64::new(0),
            retention_evicted_total: AtomicU64::new(0),
            producer_restarts: AtomicU64::new(0),
            flush_latency: Mutex::new(LatencyWindow::new()),
        }
    }
}

impl PipelineMetrics {
    pub fn inc_ticks_received(&self) {
        self.ticks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ticks_rejected_stale(&self) {
        self.ticks_rejected_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ticks_duplicate(&self) {
        self.ticks_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_gaps(&self) {
        self.gaps_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_updates_flushed(&self, n: u64) {
        if n > 0 {
            self.updates_flushed.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn inc_flushes_attempted(&self) {
        self.flushes_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flushes_succeeded(&self) {
        self.flushes_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flushes_skipped(&self) {
        self.flushes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_stale_symbols(&self, n: u64) {
        self.stale_symbols.store(n, Ordering::Relaxed);
    }

    pub fn set_instrument_count(&self, n: u64) {
        self.instrument_count.store(n, Ordering::Relaxed);
    }

    pub fn add_retention_evicted(&self, n: u64) {
        if n > 0 {
            self.retention_evicted_total.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn inc_producer_restarts(&self) {
        self.producer_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_latency_us(&self, latency_us: u64) {
        self.flush_latency.lock().push(latency_us);
    }

    pub fn ticks_received(&self) -> u64 {
        self.ticks_received.load(Ordering::Relaxed)
    }

    pub fn gaps_total(&self) -> u64 {
        self.gaps_total.load(Ordering::Relaxed)
    }

    pub fn stale_symbols(&self) -> u64 {
        self.stale_symbols.load(Ordering::Relaxed)
    }

    pub fn instrument_count(&self) -> u64 {
        self.instrument_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (average, p95) = self.flush_latency.lock().average_and_p95();
        MetricsSnapshot {
            ticks_received: self.ticks_received.load(Ordering::Relaxed),
            ticks_rejected_stale: self.ticks_rejected_stale.load(Ordering::Relaxed),
            ticks_duplicate: self.ticks_duplicate.load(Ordering::Relaxed),
            gaps_total: self.gaps_total.load(Ordering::Relaxed),
            updates_flushed: self.updates_flushed.load(Ordering::Relaxed),
            flushes_attempted: self.flushes_attempted.load(Ordering::Relaxed),
            flushes_succeeded: self.flushes_succeeded.load(Ordering::Relaxed),
            flushes_skipped: self.flushes_skipped.load(Ordering::Relaxed),
            stale_symbols: self.stale_symbols.load(Ordering::Relaxed),
            instrument_count: self.instrument_count.load(Ordering::Relaxed),
            retention_evicted_total: self.retention_evicted_total.load(Ordering::Relaxed),
            producer_restarts: self.producer_restarts.load(Ordering::Relaxed),
            flush_latency_avg_us: average,
            flush_latency_p95_us: p95,
        }
    }
}

/// Read-only view of the counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ticks_received: u64,
    pub ticks_rejected_stale: u64,
    pub ticks_duplicate: u64,
    pub gaps_total: u64,
    pub updates_flushed: u64,
    pub flushes_attempted: u64,
    pub flushes_succeeded: u64,
    pub flushes_skipped: u64,
    pub stale_symbols: u64,
    pub instrument_count: u64,
    pub retention_evicted_total: u64,
    pub producer_restarts: u64,
    pub flush_latency_avg_us: Option<u64>,
    pub flush_latency_p95_us: Option<u64>,
}
