use std::collections::{BTreeMap, BTreeSet};

/// Tracks the last-observed event time per symbol and the fresh/stale state
/// machine. `observe` is the only fresh edge, draining is the only stale edge;
/// the dispatcher guarantees the two never interleave for one symbol.
///
/// BTree containers keep iteration (and therefore cell-update emission)
/// deterministic.
#[derive(Debug, Default)]
pub struct FreshnessTracker {
    latest_seen_ms: BTreeMap<String, i64>,
    stale: BTreeSet<String>,
    recovered: BTreeSet<String>,
}

impl FreshnessTracker {
    /// Record a fresh observation. A symbol that was flagged stale moves to
    /// the recovered set, to be consumed exactly once by `drain_recovered`.
    pub fn observe(&mut self, symbol: &str, exchange_time_ms: i64) {
        self.latest_seen_ms.insert(symbol.to_string(), exchange_time_ms);
        if self.stale.remove(symbol) {
            self.recovered.insert(symbol.to_string());
        }
    }

    /// Flag every symbol silent for at least `threshold_ms` and return the
    /// symbols that transitioned on this call. The set reflects current state:
    /// a symbol observed since its last silence never reappears here without a
    /// new silence episode.
    pub fn drain_newly_stale(&mut self, now_ms: i64, threshold_ms: i64) -> Vec<String> {
        let mut newly_stale = Vec::new();
        for (symbol, latest) in &self.latest_seen_ms {
            if now_ms - *latest >= threshold_ms && !self.stale.contains(symbol) {
                newly_stale.push(symbol.clone());
            }
        }
        for symbol in &newly_stale {
            self.stale.insert(symbol.clone());
            // A recovery that was never consumed is superseded by the new
            // silence episode.
            self.recovered.remove(symbol);
        }
        newly_stale
    }

    /// Return and clear the symbols that received a fresh observation while
    /// flagged stale since the previous drain.
    pub fn drain_recovered(&mut self) -> Vec<String> {
        let recovered: Vec<String> = self.recovered.iter().cloned().collect();
        self.recovered.clear();
        recovered
    }

    pub fn stale_set(&self) -> Vec<String> {
        self.stale.iter().cloned().collect()
    }

    pub fn stale_count(&self) -> usize {
        self.stale.len()
    }

    pub fn is_stale(&self, symbol: &str) -> bool {
        self.stale.contains(symbol)
    }
}
