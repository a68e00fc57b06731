use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pipeline::dispatcher::TickPipeline;
use crate::schema::quote::Quote;
use crate::util::time::now_ms;

/// Resend the previous sequence every Nth tick per symbol, and skip one
/// sequence every Mth, so downstream duplicate/gap handling is exercised
/// without a live feed.
const DUPLICATE_EVERY: u64 = 53;
const GAP_EVERY: u64 = 97;

struct DemoSymbolState {
    symbol: String,
    price: f64,
    open: f64,
    high: f64,
    low: f64,
    sequence: i64,
    ticks: u64,
    volume: i64,
}

impl DemoSymbolState {
    fn new(symbol: &str, index: usize) -> Self {
        let base = 10.0 + index as f64 * 5.25;
        Self {
            symbol: symbol.to_string(),
            price: base,
            open: base,
            high: base,
            low: base,
            sequence: 0,
            ticks: 0,
            volume: 0,
        }
    }

    /// Deterministic random-walk step; direction and size derive from the
    /// tick counter so runs are reproducible.
    fn next_tick(&mut self) -> (Quote, i64) {
        self.ticks += 1;
        let drift = ((self.ticks % 7) as f64 - 3.0) * 0.01;
        self.price = (self.price + drift).max(0.01);
        self.high = self.high.max(self.price);
        self.low = self.low.min(self.price);
        self.volume += 1 + (self.ticks % 5) as i64;

        let sequence = if self.ticks % DUPLICATE_EVERY == 0 {
            self.sequence
        } else if self.ticks % GAP_EVERY == 0 {
            self.sequence += 2;
            self.sequence
        } else {
            self.sequence += 1;
            self.sequence
        };

        let spread = self.price * 0.001;
        let quote = Quote {
            bid: Some(self.price - spread),
            bid_size: Some(100.0 + (self.ticks % 9) as f64 * 10.0),
            ask: Some(self.price + spread),
            ask_size: Some(100.0 + (self.ticks % 11) as f64 * 10.0),
            last: Some(self.price),
            change: Some(self.price - self.open),
            open: Some(self.open),
            high: Some(self.high),
            low: Some(self.low),
            previous_close: Some(self.open),
            turnover: Some(self.price * self.volume as f64),
            volume: Some(self.volume),
            operations: Some(self.ticks as i64),
            event_time: now_ms(),
        };
        (quote, sequence)
    }
}

/// Spawn the synthetic feed: round-robins the configured symbols at the
/// requested aggregate rate until cancelled.
pub fn spawn_demo_producer(
    symbols: &[String],
    ticks_per_second: u64,
    pipeline: Arc<TickPipeline>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut states: Vec<DemoSymbolState> = symbols
        .iter()
        .enumerate()
        .map(|(i, s)| DemoSymbolState::new(s, i))
        .collect();

    tokio::spawn(async move {
        if states.is_empty() {
            warn!("demo producer: no symbols configured; nothing to do");
            return;
        }
        info!(
            "demo producer: symbols={} ticks_per_second={}",
            states.len(),
            ticks_per_second
        );
        let period = std::time::Duration::from_secs_f64(1.0 / ticks_per_second.max(1) as f64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cursor = 0usize;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let len = states.len();
                    let state = &mut states[cursor];
                    cursor = (cursor + 1) % len;
                    let (quote, sequence) = state.next_tick();
                    if let Err(err) = pipeline.process(&state.symbol, quote, sequence) {
                        warn!("demo tick rejected by dispatcher: {err:#}");
                    }
                }
            }
        }
        info!("demo producer stopped");
    })
}
