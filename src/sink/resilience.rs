use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::schema::cell::CellUpdate;
use crate::sink::Sink;

/// Emit a WARN for every Nth failure past the first few, to keep a long
/// outage from storming the log.
const FAILURE_WARN_EVERY: u64 = 10;

/// Time-window predicate that short-circuits sink calls during an outage.
/// The window doubles per consecutive failure and is clamped to `max_delay`.
#[derive(Debug)]
pub struct BackoffGate {
    base_delay: Duration,
    max_delay: Duration,
    consecutive_failures: u64,
    last_failure_at: Option<Instant>,
}

impl BackoffGate {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            consecutive_failures: 0,
            last_failure_at: None,
        }
    }

    /// Delay after `failures` consecutive failures: `base * 2^(failures-1)`,
    /// clamped to the maximum.
    pub fn delay_after(&self, failures: u64) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(20) as u32;
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(1u64 << exponent);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Whether a sink call is allowed at `now`.
    pub fn is_open(&self, now: Instant) -> bool {
        match self.last_failure_at {
            None => true,
            Some(failed_at) => {
                now.saturating_duration_since(failed_at) >= self.delay_after(self.consecutive_failures)
            }
        }
    }

    pub fn on_failure(&mut self, now: Instant) {
        self.consecutive_failures += 1;
        self.last_failure_at = Some(now);
    }

    /// Clear the failure state; returns how many failures just recovered.
    pub fn on_success(&mut self) -> u64 {
        let recovered = self.consecutive_failures;
        self.consecutive_failures = 0;
        self.last_failure_at = None;
        recovered
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures
    }
}

/// Result of one resilient sink call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCall {
    Written,
    Skipped,
    Failed,
}

/// Wraps a sink that may fail transiently. While the gate is closed, calls
/// return `Skipped` without touching the sink; failures extend the window and
/// are swallowed so the scheduler loop never dies.
pub struct ResilientSink {
    inner: Box<dyn Sink>,
    gate: BackoffGate,
}

impl ResilientSink {
    pub fn new(inner: Box<dyn Sink>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner,
            gate: BackoffGate::new(base_delay, max_delay),
        }
    }

    pub fn gate_open(&self, now: Instant) -> bool {
        self.gate.is_open(now)
    }

    pub fn write_batch(&mut self, now: Instant, batch: &[CellUpdate]) -> SinkCall {
        if !self.gate.is_open(now) {
            return SinkCall::Skipped;
        }

        let result = self
            .inner
            .write_batch(batch)
            .and_then(|()| self.inner.flush());
        match result {
            Ok(()) => {
                let recovered = self.gate.on_success();
                if recovered > 0 {
                    info!("sink recovered after {recovered} failed calls");
                }
                SinkCall::Written
            }
            Err(err) => {
                self.gate.on_failure(now);
                let failures = self.gate.consecutive_failures();
                let next_delay = self.gate.delay_after(failures);
                if failures == 1 {
                    warn!(
                        "sink write failed, backing off {}ms: {err:#}",
                        next_delay.as_millis()
                    );
                } else if failures <= 3 {
                    info!("sink write failed ({failures} consecutive): {err:#}");
                } else if failures % FAILURE_WARN_EVERY == 0 {
                    warn!(
                        "sink still failing ({failures} consecutive, backoff {}ms): {err:#}",
                        next_delay.as_millis()
                    );
                }
                SinkCall::Failed
            }
        }
    }

    pub fn open(&mut self) -> anyhow::Result<()> {
        self.inner.open()
    }

    pub fn close(&mut self) -> anyhow::Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::cell::{CellValue, MARKET_DATA_SHEET};
    use crate::sink::recorder::RecordingSink;

    fn batch() -> Vec<CellUpdate> {
        vec![CellUpdate::new(MARKET_DATA_SHEET, "Last", 2, CellValue::Decimal(1.0))]
    }

    #[test]
    fn delay_doubles_and_clamps() {
        let gate = BackoffGate::new(Duration::from_millis(500), Duration::from_secs(30));
        assert_eq!(gate.delay_after(1), Duration::from_millis(500));
        assert_eq!(gate.delay_after(2), Duration::from_millis(1_000));
        assert_eq!(gate.delay_after(3), Duration::from_millis(2_000));
        assert_eq!(gate.delay_after(7), Duration::from_millis(32_000).min(Duration::from_secs(30)));
        assert_eq!(gate.delay_after(40), Duration::from_secs(30));
    }

    #[test]
    fn gate_opens_no_earlier_than_the_backoff_window() {
        let mut gate = BackoffGate::new(Duration::from_millis(500), Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(gate.is_open(t0));

        for k in 1u64..=6 {
            gate.on_failure(t0);
            assert_eq!(gate.consecutive_failures(), k);
            let window = gate.delay_after(k);
            assert!(!gate.is_open(t0 + window - Duration::from_millis(1)));
            assert!(gate.is_open(t0 + window));
        }

        assert_eq!(gate.on_success(), 6);
        assert!(gate.is_open(t0));
    }

    #[test]
    fn closed_gate_short_circuits_without_calling_the_sink() {
        let recorder = RecordingSink::default();
        let handle = recorder.handle();
        let mut sink = ResilientSink::new(
            Box::new(recorder),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        let t0 = Instant::now();

        handle.fail_next(1);
        assert_eq!(sink.write_batch(t0, &batch()), SinkCall::Failed);
        assert_eq!(sink.write_batch(t0 + Duration::from_secs(1), &batch()), SinkCall::Skipped);
        assert_eq!(handle.write_attempts(), 1);

        // Window elapsed: call goes through and the gate resets.
        assert_eq!(sink.write_batch(t0 + Duration::from_secs(5), &batch()), SinkCall::Written);
        assert_eq!(handle.batches().len(), 1);
        assert!(sink.gate_open(t0 + Duration::from_secs(5)));
    }
}
