use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Decides when the coalescing buffer should be flushed. Pure state: it never
/// touches the buffer itself. Within one reset cycle every rule is monotone,
/// so once `should_flush` turns true it stays true until `reset`.
#[derive(Debug)]
pub struct BatchPolicy {
    high_watermark: usize,
    max_age: Duration,
    priority_symbols: HashSet<String>,
    accumulated: usize,
    first_pending_at: Option<Instant>,
    priority_hit: bool,
}

impl BatchPolicy {
    pub fn new(high_watermark: usize, max_age: Duration, priority_symbols: &[String]) -> Self {
        Self {
            high_watermark: high_watermark.max(1),
            max_age,
            priority_symbols: priority_symbols.iter().cloned().collect(),
            accumulated: 0,
            first_pending_at: None,
            priority_hit: false,
        }
    }

    /// An accepted quote tick landed in the buffer. Counts toward the high
    /// watermark, starts the age clock, and latches the priority rule.
    pub fn record_quote(&mut self, symbol: &str, now: Instant) {
        self.accumulated += 1;
        self.first_pending_at.get_or_insert(now);
        if self.priority_symbols.contains(symbol) {
            self.priority_hit = true;
        }
    }

    /// A non-quote write (stale flag, heartbeat row) landed in the buffer.
    /// Starts the age clock only, so quiet-feed housekeeping still flushes.
    pub fn note_pending(&mut self, now: Instant) {
        self.first_pending_at.get_or_insert(now);
    }

    pub fn should_flush(&self, now: Instant) -> bool {
        if self.priority_hit {
            return true;
        }
        if self.accumulated >= self.high_watermark {
            return true;
        }
        match self.first_pending_at {
            Some(first) => now.saturating_duration_since(first) >= self.max_age,
            None => false,
        }
    }

    /// Back to the "no quotes since flush" state.
    pub fn reset(&mut self) {
        self.accumulated = 0;
        self.first_pending_at = None;
        self.priority_hit = false;
    }

    pub fn accumulated(&self) -> usize {
        self.accumulated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(watermark: usize, max_age_ms: u64, priority: &[&str]) -> BatchPolicy {
        let symbols: Vec<String> = priority.iter().map(|s| s.to_string()).collect();
        BatchPolicy::new(watermark, Duration::from_millis(max_age_ms), &symbols)
    }

    #[test]
    fn count_rule_fires_at_watermark() {
        let mut policy = policy(3, 60_000, &[]);
        let now = Instant::now();
        policy.record_quote("X", now);
        policy.record_quote("X", now);
        assert!(!policy.should_flush(now));
        policy.record_quote("X", now);
        assert!(policy.should_flush(now));
    }

    #[test]
    fn age_rule_fires_after_max_age() {
        let mut policy = policy(1_000, 1_000, &[]);
        let start = Instant::now();
        policy.record_quote("X", start);
        assert!(!policy.should_flush(start + Duration::from_millis(500)));
        assert!(policy.should_flush(start + Duration::from_millis(1_000)));
    }

    #[test]
    fn priority_symbol_fires_immediately() {
        let mut policy = policy(1_000, 60_000, &["IBEX"]);
        let now = Instant::now();
        policy.record_quote("TEF", now);
        assert!(!policy.should_flush(now));
        policy.record_quote("IBEX", now);
        assert!(policy.should_flush(now));
    }

    #[test]
    fn note_pending_starts_age_clock_without_counting() {
        let mut policy = policy(2, 1_000, &[]);
        let start = Instant::now();
        policy.note_pending(start);
        assert_eq!(policy.accumulated(), 0);
        assert!(!policy.should_flush(start));
        assert!(policy.should_flush(start + Duration::from_millis(1_000)));
    }

    #[test]
    fn once_true_stays_true_until_reset() {
        let mut policy = policy(2, 60_000, &[]);
        let start = Instant::now();
        policy.record_quote("X", start);
        policy.record_quote("X", start);

        for extra_ms in [0u64, 1, 10, 500, 10_000] {
            assert!(policy.should_flush(start + Duration::from_millis(extra_ms)));
        }

        policy.reset();
        assert!(!policy.should_flush(start + Duration::from_secs(3600)));
        assert_eq!(policy.accumulated(), 0);
    }
}
