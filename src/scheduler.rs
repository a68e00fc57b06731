use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::pipeline::dispatcher::FlushQueue;
use crate::schema::cell::CellUpdate;
use crate::sink::resilience::{ResilientSink, SinkCall};
use crate::util::metrics::PipelineMetrics;

/// What one scheduler cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushCycle {
    /// Nothing pending, or the policy said not yet.
    Idle,
    /// Backoff gate closed; the buffer was left coalescing in place.
    SkippedBackoff,
    /// Batch delivered to the sink.
    Flushed(usize),
    /// Sink call failed; the batch was merged back into the buffer.
    FailedRequeued(usize),
}

/// Periodic drain loop. The only entity that moves data out of the coalescing
/// buffer: consults the batch policy, takes an atomic snapshot via `drain`,
/// hands it to the resilient sink and records the latency. Sink errors never
/// terminate the loop; the next tick retries subject to the backoff gate.
pub struct FlushScheduler {
    queue: Arc<Mutex<FlushQueue>>,
    sink: ResilientSink,
    metrics: Arc<PipelineMetrics>,
}

impl FlushScheduler {
    pub fn new(queue: Arc<Mutex<FlushQueue>>, sink: ResilientSink, metrics: Arc<PipelineMetrics>) -> Self {
        Self { queue, sink, metrics }
    }

    /// One policy-driven cycle.
    pub fn flush_cycle(&mut self, now: Instant) -> FlushCycle {
        let batch = {
            let mut queue = self.queue.lock();
            if queue.buffer.is_empty() || !queue.policy.should_flush(now) {
                return FlushCycle::Idle;
            }
            if !self.sink.gate_open(now) {
                // Gate closed: do not drain at all, so pending writes keep
                // coalescing and quiet symbols keep their last value.
                self.metrics.inc_flushes_skipped();
                return FlushCycle::SkippedBackoff;
            }
            queue.buffer.drain()
        };
        self.deliver(batch, now)
    }

    /// Forced flush, bypassing the policy. Used on shutdown.
    pub fn flush_now(&mut self, now: Instant) -> FlushCycle {
        let batch = {
            let mut queue = self.queue.lock();
            if queue.buffer.is_empty() {
                return FlushCycle::Idle;
            }
            if !self.sink.gate_open(now) {
                self.metrics.inc_flushes_skipped();
                return FlushCycle::SkippedBackoff;
            }
            queue.buffer.drain()
        };
        self.deliver(batch, now)
    }

    fn deliver(&mut self, batch: Vec<CellUpdate>, now: Instant) -> FlushCycle {
        self.metrics.inc_flushes_attempted();
        let started = Instant::now();
        match self.sink.write_batch(now, &batch) {
            SinkCall::Written => {
                let elapsed_us = started.elapsed().as_micros().min(u64::MAX as u128) as u64;
                self.metrics.record_flush_latency_us(elapsed_us);
                self.metrics.add_updates_flushed(batch.len() as u64);
                self.metrics.inc_flushes_succeeded();
                self.queue.lock().policy.reset();
                FlushCycle::Flushed(batch.len())
            }
            SinkCall::Skipped => {
                self.metrics.inc_flushes_skipped();
                self.queue.lock().buffer.restore(batch);
                FlushCycle::SkippedBackoff
            }
            SinkCall::Failed => {
                let size = batch.len();
                self.queue.lock().buffer.restore(batch);
                FlushCycle::FailedRequeued(size)
            }
        }
    }

    /// Blocking loop body for the scheduler thread. Exits on the shutdown
    /// signal after one final forced flush and a sink close.
    fn run(mut self, flush_interval: Duration, shutdown_rx: Receiver<()>) {
        let tick = crossbeam_channel::tick(flush_interval);
        loop {
            crossbeam_channel::select! {
                recv(tick) -> _ => {
                    if let FlushCycle::Flushed(count) = self.flush_cycle(Instant::now()) {
                        debug!("flushed {count} cell updates");
                    }
                }
                recv(shutdown_rx) -> _ => break,
            }
        }

        match self.flush_now(Instant::now()) {
            FlushCycle::Flushed(count) => info!("final flush wrote {count} cell updates"),
            FlushCycle::SkippedBackoff => warn!("final flush skipped: sink still in backoff"),
            FlushCycle::FailedRequeued(count) => {
                warn!("final flush failed; {count} pending updates not delivered")
            }
            FlushCycle::Idle => {}
        }
        if let Err(err) = self.sink.close() {
            warn!("sink close failed: {err:#}");
        }
        info!("flush scheduler exited");
    }
}

/// Running scheduler thread plus its shutdown signal.
pub struct SchedulerHandle {
    thread: std::thread::JoinHandle<()>,
    shutdown_tx: Sender<()>,
}

impl SchedulerHandle {
    /// Signal the loop, wait for the final flush and the sink close.
    pub fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if self.thread.join().is_err() {
            warn!("flush scheduler thread panicked");
        }
    }
}

pub fn spawn(scheduler: FlushScheduler, flush_interval: Duration) -> SchedulerHandle {
    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    let thread = std::thread::Builder::new()
        .name("flush-scheduler".to_string())
        .spawn(move || scheduler.run(flush_interval, shutdown_rx))
        .expect("spawn flush scheduler thread");
    SchedulerHandle { thread, shutdown_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::pipeline::dispatcher::{FlushQueue, TickPipeline};
    use crate::pipeline::policy::BatchPolicy;
    use crate::schema::quote::Quote;
    use crate::sink::recorder::RecordingSink;

    fn fixture(high_watermark: usize) -> (TickPipeline, FlushScheduler, RecordingSink) {
        let cfg = PipelineConfig {
            batch_high_watermark: high_watermark,
            ..PipelineConfig::default()
        };
        let queue = Arc::new(Mutex::new(FlushQueue::new(BatchPolicy::new(
            cfg.batch_high_watermark,
            Duration::from_millis(cfg.batch_max_age_ms),
            &cfg.priority_symbols,
        ))));
        let metrics = Arc::new(PipelineMetrics::default());
        let pipeline = TickPipeline::new(&cfg, queue.clone(), metrics.clone());

        let recorder = RecordingSink::default();
        let handle = recorder.handle();
        let sink = ResilientSink::new(
            Box::new(recorder),
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_max_ms),
        );
        (pipeline, FlushScheduler::new(queue, sink, metrics), handle)
    }

    fn quote(event_time: i64, last: f64) -> Quote {
        Quote {
            last: Some(last),
            event_time,
            ..Quote::default()
        }
    }

    #[test]
    fn idle_when_policy_says_not_yet() {
        let (pipeline, mut scheduler, recorder) = fixture(100);
        pipeline.process("TEF", quote(1_000, 1.0), 1).unwrap();
        assert_eq!(scheduler.flush_cycle(Instant::now()), FlushCycle::Idle);
        assert!(recorder.batches().is_empty());
    }

    #[test]
    fn flushes_once_watermark_reached_and_resets_policy() {
        let (pipeline, mut scheduler, recorder) = fixture(2);
        pipeline.process("TEF", quote(1_000, 1.0), 1).unwrap();
        pipeline.process("TEF", quote(2_000, 2.0), 2).unwrap();

        let outcome = scheduler.flush_cycle(Instant::now());
        assert!(matches!(outcome, FlushCycle::Flushed(n) if n > 0));
        assert_eq!(recorder.batches().len(), 1);
        assert_eq!(recorder.flushes(), 1);

        // Policy was reset: a single further tick is below the watermark.
        pipeline.process("TEF", quote(3_000, 3.0), 3).unwrap();
        assert_eq!(scheduler.flush_cycle(Instant::now()), FlushCycle::Idle);
    }

    #[test]
    fn failed_sink_call_requeues_the_batch() {
        let (pipeline, mut scheduler, recorder) = fixture(1);
        pipeline.process("TEF", quote(1_000, 1.0), 1).unwrap();

        recorder.fail_next(1);
        let now = Instant::now();
        assert!(matches!(scheduler.flush_cycle(now), FlushCycle::FailedRequeued(_)));
        assert!(recorder.batches().is_empty());

        // Past the backoff window the same writes go out.
        let outcome = scheduler.flush_cycle(now + Duration::from_millis(600));
        assert!(matches!(outcome, FlushCycle::Flushed(_)));
        let updates = recorder.all_updates();
        assert!(updates.iter().any(|u| u.address.column == "Last"));
    }

    #[test]
    fn closed_gate_leaves_buffer_coalescing() {
        let (pipeline, mut scheduler, recorder) = fixture(1);
        pipeline.process("TEF", quote(1_000, 1.0), 1).unwrap();

        recorder.fail_next(1);
        let now = Instant::now();
        scheduler.flush_cycle(now);

        // Inside the backoff window nothing is drained or delivered.
        pipeline.process("TEF", quote(2_000, 2.0), 2).unwrap();
        assert_eq!(
            scheduler.flush_cycle(now + Duration::from_millis(100)),
            FlushCycle::SkippedBackoff
        );
        assert_eq!(recorder.write_attempts(), 1);

        // After the window, exactly one value per address arrives: the latest.
        let outcome = scheduler.flush_cycle(now + Duration::from_millis(600));
        assert!(matches!(outcome, FlushCycle::Flushed(_)));
        let last_cells: Vec<_> = recorder
            .all_updates()
            .into_iter()
            .filter(|u| u.address.column == "Last")
            .collect();
        assert_eq!(last_cells.len(), 1);
        assert_eq!(
            last_cells[0].value,
            crate::schema::cell::CellValue::Decimal(2.0)
        );
    }

    #[test]
    fn flush_now_bypasses_policy() {
        let (pipeline, mut scheduler, recorder) = fixture(1_000);
        pipeline.process("TEF", quote(1_000, 1.0), 1).unwrap();

        assert_eq!(scheduler.flush_cycle(Instant::now()), FlushCycle::Idle);
        assert!(matches!(scheduler.flush_now(Instant::now()), FlushCycle::Flushed(_)));
        assert_eq!(recorder.batches().len(), 1);
    }
}
