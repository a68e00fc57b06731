use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::PipelineConfig;
use crate::pipeline::buffer::CoalescingBuffer;
use crate::pipeline::freshness::FreshnessTracker;
use crate::pipeline::instrument::{InstrumentState, UpdateOutcome};
use crate::pipeline::policy::BatchPolicy;
use crate::pipeline::retention::{RetentionReport, RetentionStore};
use crate::pipeline::sequence::SequenceClass;
use crate::schema::cell::{columns, CellUpdate, CellValue, MARKET_DATA_SHEET, METRICS_ROW, METRICS_SHEET};
use crate::schema::quote::Quote;
use crate::util::metrics::PipelineMetrics;

/// First data row on the market-data sheet; row 1 is header space.
const FIRST_INSTRUMENT_ROW: u32 = 2;

/// The coalescing buffer and its flush policy, guarded together so that a
/// drain decision and the state it is based on cannot tear. This pair is the
/// only thing shared between the dispatcher side and the scheduler side.
#[derive(Debug)]
pub struct FlushQueue {
    pub buffer: CoalescingBuffer,
    pub policy: BatchPolicy,
}

impl FlushQueue {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            buffer: CoalescingBuffer::default(),
            policy,
        }
    }
}

/// What the dispatcher did with one producer tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Applied {
        classification: SequenceClass,
        gap_count: u64,
        row_index: u32,
        retention: RetentionReport,
    },
    DuplicateDropped,
    StaleTimestampDropped,
}

struct Registry {
    instruments: HashMap<String, InstrumentState>,
    next_row: u32,
    retention: RetentionStore,
    freshness: FreshnessTracker,
}

impl Registry {
    /// Row assignment is insertion-ordered and permanent; rows are never
    /// reshuffled once handed out.
    fn resolve_or_create(&mut self, symbol: &str) -> (&mut InstrumentState, bool) {
        match self.instruments.entry(symbol.to_string()) {
            Entry::Occupied(entry) => (entry.into_mut(), false),
            Entry::Vacant(entry) => {
                let row = self.next_row;
                self.next_row += 1;
                (entry.insert(InstrumentState::new(symbol, row)), true)
            }
        }
    }
}

/// Entry point from producers. Owns the instrument registry (with retention
/// and freshness riding along) behind one short-held mutex; the whole
/// dispatcher step is atomic with respect to a given symbol. The path is
/// synchronous and never waits on the sink.
pub struct TickPipeline {
    stale_threshold_ms: i64,
    registry: Mutex<Registry>,
    queue: Arc<Mutex<FlushQueue>>,
    metrics: Arc<PipelineMetrics>,
}

impl TickPipeline {
    pub fn new(
        cfg: &PipelineConfig,
        queue: Arc<Mutex<FlushQueue>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            stale_threshold_ms: cfg.stale_threshold_ms as i64,
            registry: Mutex::new(Registry {
                instruments: HashMap::new(),
                next_row: FIRST_INSTRUMENT_ROW,
                retention: RetentionStore::new(
                    cfg.max_ticks_per_symbol,
                    cfg.retention_window_ms as i64,
                ),
                freshness: FreshnessTracker::default(),
            }),
            queue,
            metrics,
        }
    }

    /// Process one tick: update the instrument, freshness and retention, then
    /// enqueue the cell writes. `sequence == -1` means unsequenced.
    pub fn process(&self, symbol: &str, quote: Quote, sequence: i64) -> anyhow::Result<DispatchOutcome> {
        let symbol = symbol.trim();
        if symbol.is_empty() {
            anyhow::bail!("empty symbol on tick (sequence={sequence})");
        }
        self.metrics.inc_ticks_received();

        let (updates, outcome) = {
            let mut registry = self.registry.lock();
            let (instrument, created) = registry.resolve_or_create(symbol);
            let row_index = instrument.row_index();

            let outcome = match instrument.try_update(quote.clone(), sequence) {
                UpdateOutcome::StaleTimestamp => {
                    self.metrics.inc_ticks_rejected_stale();
                    trace!("drop stale-timestamp tick: symbol={symbol} event_time={}", quote.event_time);
                    return Ok(DispatchOutcome::StaleTimestampDropped);
                }
                UpdateOutcome::Duplicate => {
                    self.metrics.inc_ticks_duplicate();
                    debug!("drop duplicate tick: symbol={symbol} sequence={sequence}");
                    return Ok(DispatchOutcome::DuplicateDropped);
                }
                UpdateOutcome::Applied {
                    classification,
                    gap_count,
                } => {
                    if classification == SequenceClass::Gap {
                        self.metrics.inc_gaps();
                        warn!(
                            "sequence gap: symbol={symbol} observed={sequence} gaps_so_far={gap_count}"
                        );
                    }
                    (classification, gap_count)
                }
            };
            let (classification, gap_count) = outcome;

            let updates = market_row_updates(&registry.instruments[symbol]);

            let event_time = registry.instruments[symbol]
                .last_update_ms()
                .unwrap_or_default();
            registry.freshness.observe(symbol, event_time);
            let retention = registry.retention.on_new_tick(symbol, sequence, event_time);
            if retention.evicted_this_call > 0 {
                self.metrics.add_retention_evicted(retention.evicted_this_call as u64);
            }
            if created {
                self.metrics.set_instrument_count(registry.instruments.len() as u64);
            }

            (
                updates,
                DispatchOutcome::Applied {
                    classification,
                    gap_count,
                    row_index,
                    retention,
                },
            )
        };

        {
            let mut queue = self.queue.lock();
            queue.buffer.enqueue_all(updates);
            queue.policy.record_quote(symbol, Instant::now());
        }

        Ok(outcome)
    }

    /// Flip freshness transitions into `IsStale` cell writes. Driven by the
    /// heartbeat loop; takes the registry lock, so it serializes with
    /// `process` like any other dispatcher step.
    pub fn sweep_freshness(&self, now_ms: i64) {
        let updates = {
            let mut registry = self.registry.lock();
            let recovered = registry.freshness.drain_recovered();
            let newly_stale = registry
                .freshness
                .drain_newly_stale(now_ms, self.stale_threshold_ms);

            let mut updates = Vec::with_capacity(recovered.len() + newly_stale.len());
            for symbol in recovered {
                if let Some(instrument) = registry.instruments.get_mut(&symbol) {
                    instrument.set_stale(false);
                    updates.push(is_stale_update(instrument.row_index(), false));
                }
            }
            for symbol in newly_stale {
                if let Some(instrument) = registry.instruments.get_mut(&symbol) {
                    instrument.set_stale(true);
                    warn!("instrument went stale: symbol={symbol}");
                    updates.push(is_stale_update(instrument.row_index(), true));
                }
            }
            self.metrics.set_stale_symbols(registry.freshness.stale_count() as u64);
            updates
        };

        if !updates.is_empty() {
            let mut queue = self.queue.lock();
            queue.buffer.enqueue_all(updates);
            queue.policy.note_pending(Instant::now());
        }
    }

    /// Write the cumulative counters into the well-known heartbeat row on the
    /// metrics sheet.
    pub fn queue_heartbeat(&self, now_ms: i64) {
        let (total_evicted, last_eviction, last_batch, instrument_count) = {
            let registry = self.registry.lock();
            (
                registry.retention.total_evicted(),
                registry.retention.last_eviction_at_ms(),
                registry.retention.last_eviction_batch(),
                registry.instruments.len(),
            )
        };

        let metric_cell = |column: &str, value: CellValue| {
            CellUpdate::new(METRICS_SHEET, column, METRICS_ROW, value)
        };
        let updates = vec![
            metric_cell(columns::TIMESTAMP, CellValue::Instant(now_ms)),
            metric_cell(
                columns::TOTAL_QUOTES,
                CellValue::Integer(self.metrics.ticks_received() as i64),
            ),
            metric_cell(
                columns::TOTAL_GAPS,
                CellValue::Integer(self.metrics.gaps_total() as i64),
            ),
            metric_cell(
                columns::STALE_COUNT,
                CellValue::Integer(self.metrics.stale_symbols() as i64),
            ),
            metric_cell(columns::INSTRUMENT_COUNT, CellValue::Integer(instrument_count as i64)),
            metric_cell(
                columns::RETENTION_TOTAL_EVICTED,
                CellValue::Integer(total_evicted as i64),
            ),
            metric_cell(
                columns::RETENTION_LAST_EVICTION_UTC,
                match last_eviction {
                    Some(ms) => CellValue::Instant(ms),
                    None => CellValue::Absent,
                },
            ),
            metric_cell(
                columns::RETENTION_LAST_BATCH_EVICTED,
                CellValue::Integer(last_batch as i64),
            ),
        ];

        let mut queue = self.queue.lock();
        queue.buffer.enqueue_all(updates);
        queue.policy.note_pending(Instant::now());
    }

    /// Snapshot of one instrument's state, for inspection and tests.
    pub fn instrument(&self, symbol: &str) -> Option<InstrumentState> {
        self.registry.lock().instruments.get(symbol).cloned()
    }

    pub fn instrument_count(&self) -> usize {
        self.registry.lock().instruments.len()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }
}

fn is_stale_update(row: u32, stale: bool) -> CellUpdate {
    CellUpdate::new(MARKET_DATA_SHEET, columns::IS_STALE, row, CellValue::Boolean(stale))
}

/// One update per management column plus one per market-data field present in
/// the stored quote, all addressed at the instrument's row.
fn market_row_updates(instrument: &InstrumentState) -> Vec<CellUpdate> {
    let row = instrument.row_index();
    let cell = |column: &str, value: CellValue| CellUpdate::new(MARKET_DATA_SHEET, column, row, value);

    let mut updates = vec![
        cell(columns::SYMBOL, CellValue::Text(instrument.symbol().to_string())),
        cell(
            columns::LAST_UPDATE,
            match instrument.last_update_ms() {
                Some(ms) => CellValue::Instant(ms),
                None => CellValue::Absent,
            },
        ),
        cell(columns::IS_STALE, CellValue::Boolean(instrument.is_stale())),
        cell(columns::GAP_COUNT, CellValue::Integer(instrument.gap_count() as i64)),
        cell(
            columns::SEQUENCE,
            match instrument.last_sequence() {
                Some(seq) => CellValue::Integer(seq),
                None => CellValue::Absent,
            },
        ),
    ];

    let Some(quote) = instrument.last_quote() else {
        return updates;
    };
    let decimal_fields: [(&str, Option<f64>); 9] = [
        (columns::LAST, quote.last),
        (columns::BID, quote.bid),
        (columns::ASK, quote.ask),
        (columns::BID_SIZE, quote.bid_size),
        (columns::ASK_SIZE, quote.ask_size),
        (columns::CHANGE, quote.change),
        (columns::OPEN, quote.open),
        (columns::HIGH, quote.high),
        (columns::LOW, quote.low),
    ];
    for (column, field) in decimal_fields {
        if let Some(value) = field {
            updates.push(cell(column, CellValue::Decimal(value)));
        }
    }
    if let Some(volume) = quote.volume {
        updates.push(cell(columns::VOLUME, CellValue::Integer(volume)));
    }

    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sequence::NO_SEQUENCE;

    fn pipeline() -> (TickPipeline, Arc<Mutex<FlushQueue>>) {
        let cfg = PipelineConfig::default();
        let queue = Arc::new(Mutex::new(FlushQueue::new(BatchPolicy::new(
            cfg.batch_high_watermark,
            std::time::Duration::from_millis(cfg.batch_max_age_ms),
            &cfg.priority_symbols,
        ))));
        let metrics = Arc::new(PipelineMetrics::default());
        (TickPipeline::new(&cfg, queue.clone(), metrics), queue)
    }

    fn quote(event_time: i64, last: f64) -> Quote {
        Quote {
            last: Some(last),
            event_time,
            ..Quote::default()
        }
    }

    #[test]
    fn rows_are_assigned_in_insertion_order_and_stay_unique() {
        let (pipeline, _queue) = pipeline();
        pipeline.process("TEF", quote(1_000, 1.0), 1).unwrap();
        pipeline.process("SAN", quote(1_000, 2.0), 1).unwrap();
        pipeline.process("BBVA", quote(1_000, 3.0), 1).unwrap();
        // Alphabetically earlier symbol arriving later keeps a later row.
        pipeline.process("ACS", quote(1_000, 4.0), 1).unwrap();

        assert_eq!(pipeline.instrument("TEF").unwrap().row_index(), 2);
        assert_eq!(pipeline.instrument("SAN").unwrap().row_index(), 3);
        assert_eq!(pipeline.instrument("BBVA").unwrap().row_index(), 4);
        assert_eq!(pipeline.instrument("ACS").unwrap().row_index(), 5);

        // Re-observation does not move anything.
        pipeline.process("SAN", quote(2_000, 2.5), 2).unwrap();
        assert_eq!(pipeline.instrument("SAN").unwrap().row_index(), 3);
    }

    #[test]
    fn empty_symbol_is_an_error_that_propagates() {
        let (pipeline, _queue) = pipeline();
        assert!(pipeline.process("  ", quote(1_000, 1.0), 1).is_err());
    }

    #[test]
    fn rejected_ticks_do_not_enqueue() {
        let (pipeline, queue) = pipeline();
        pipeline.process("TEF", quote(10_000, 1.0), 2).unwrap();
        let len_after_first = queue.lock().buffer.len();

        let outcome = pipeline.process("TEF", quote(1_000, 9.0), 3).unwrap();
        assert_eq!(outcome, DispatchOutcome::StaleTimestampDropped);
        let outcome = pipeline.process("TEF", quote(11_000, 9.0), 2).unwrap();
        assert_eq!(outcome, DispatchOutcome::DuplicateDropped);

        assert_eq!(queue.lock().buffer.len(), len_after_first);
    }

    #[test]
    fn unsequenced_ticks_emit_absent_sequence_cell() {
        let (pipeline, queue) = pipeline();
        pipeline.process("TEF", quote(1_000, 1.0), NO_SEQUENCE).unwrap();

        let drained = queue.lock().buffer.drain();
        let sequence_cell = drained
            .iter()
            .find(|u| u.address.column == columns::SEQUENCE)
            .unwrap();
        assert_eq!(sequence_cell.value, CellValue::Absent);
    }

    #[test]
    fn sweep_marks_stale_then_recovery_round_trips() {
        let (pipeline, queue) = pipeline();
        pipeline.process("TEF", quote(1_000, 1.0), 1).unwrap();
        queue.lock().buffer.drain();

        pipeline.sweep_freshness(1_000 + 5_000);
        assert!(pipeline.instrument("TEF").unwrap().is_stale());
        let drained = queue.lock().buffer.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].value, CellValue::Boolean(true));
        assert_eq!(pipeline.metrics().stale_symbols(), 1);

        pipeline.process("TEF", quote(7_000, 1.1), 2).unwrap();
        pipeline.sweep_freshness(7_500);
        assert!(!pipeline.instrument("TEF").unwrap().is_stale());
        let drained = queue.lock().buffer.drain();
        let stale_cell = drained
            .iter()
            .find(|u| u.address.column == columns::IS_STALE)
            .unwrap();
        assert_eq!(stale_cell.value, CellValue::Boolean(false));
        assert_eq!(pipeline.metrics().stale_symbols(), 0);
    }

    #[test]
    fn heartbeat_writes_the_metrics_row() {
        let (pipeline, queue) = pipeline();
        pipeline.process("TEF", quote(1_000, 1.0), 1).unwrap();
        queue.lock().buffer.drain();

        pipeline.queue_heartbeat(2_000);
        let drained = queue.lock().buffer.drain();
        assert_eq!(drained.len(), 8);
        assert!(drained
            .iter()
            .all(|u| u.address.sheet == METRICS_SHEET && u.address.row == METRICS_ROW));

        let quotes = drained
            .iter()
            .find(|u| u.address.column == columns::TOTAL_QUOTES)
            .unwrap();
        assert_eq!(quotes.value, CellValue::Integer(1));
        let eviction = drained
            .iter()
            .find(|u| u.address.column == columns::RETENTION_LAST_EVICTION_UTC)
            .unwrap();
        assert_eq!(eviction.value, CellValue::Absent);
    }
}
