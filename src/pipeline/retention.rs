use std::collections::{HashMap, VecDeque};

/// One tick's metadata kept for the retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionEntry {
    pub sequence: i64,
    pub event_time_ms: i64,
}

/// What one `on_new_tick` call did to the symbol's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionReport {
    pub evicted_this_call: usize,
    pub current_len: usize,
    pub total_evicted: u64,
    pub last_eviction_at_ms: Option<i64>,
    pub last_eviction_batch: usize,
}

/// Per-symbol bounded FIFO of `(sequence, event_time)` pairs. Both the count
/// bound and the age bound are enforced on every call; either alone evicts.
#[derive(Debug)]
pub struct RetentionStore {
    max_ticks_per_symbol: usize,
    retention_window_ms: i64,
    queues: HashMap<String, VecDeque<RetentionEntry>>,
    total_evicted: u64,
    last_eviction_at_ms: Option<i64>,
    last_eviction_batch: usize,
}

impl RetentionStore {
    pub fn new(max_ticks_per_symbol: usize, retention_window_ms: i64) -> Self {
        Self {
            max_ticks_per_symbol: max_ticks_per_symbol.max(1),
            retention_window_ms: retention_window_ms.max(1),
            queues: HashMap::new(),
            total_evicted: 0,
            last_eviction_at_ms: None,
            last_eviction_batch: 0,
        }
    }

    /// Append the tick, then evict from the head while either bound is
    /// violated. The incoming event time doubles as "now" for the age bound,
    /// which keeps replay deterministic.
    pub fn on_new_tick(&mut self, symbol: &str, sequence: i64, event_time_ms: i64) -> RetentionReport {
        let queue = self.queues.entry(symbol.to_string()).or_default();
        queue.push_back(RetentionEntry {
            sequence,
            event_time_ms,
        });

        let mut evicted = 0usize;
        while let Some(head) = queue.front() {
            let over_count = queue.len() > self.max_ticks_per_symbol;
            let over_age = event_time_ms - head.event_time_ms > self.retention_window_ms;
            if !(over_count || over_age) {
                break;
            }
            queue.pop_front();
            evicted += 1;
        }

        let current_len = queue.len();
        if evicted > 0 {
            self.total_evicted += evicted as u64;
            self.last_eviction_at_ms = Some(event_time_ms);
            self.last_eviction_batch = evicted;
        }

        RetentionReport {
            evicted_this_call: evicted,
            current_len,
            total_evicted: self.total_evicted,
            last_eviction_at_ms: self.last_eviction_at_ms,
            last_eviction_batch: self.last_eviction_batch,
        }
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.queues.get(symbol).map_or(0, VecDeque::len)
    }

    pub fn total_evicted(&self) -> u64 {
        self.total_evicted
    }

    pub fn last_eviction_at_ms(&self) -> Option<i64> {
        self.last_eviction_at_ms
    }

    pub fn last_eviction_batch(&self) -> usize {
        self.last_eviction_batch
    }

    #[cfg(test)]
    fn oldest(&self, symbol: &str) -> Option<RetentionEntry> {
        self.queues.get(symbol).and_then(|q| q.front().copied())
    }
}
