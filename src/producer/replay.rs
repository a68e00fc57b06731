use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pipeline::dispatcher::TickPipeline;
use crate::schema::quote::Quote;
use crate::util::time::normalize_epoch_to_ms;

/// One line of a capture file. `sequence` defaults to the no-sequence
/// sentinel so hand-written fixtures can omit it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayTick {
    pub symbol: String,

    #[serde(default = "default_sequence")]
    pub sequence: i64,

    pub event_time: i64,

    #[serde(default)]
    pub bid: Option<f64>,
    #[serde(default)]
    pub bid_size: Option<f64>,
    #[serde(default)]
    pub ask: Option<f64>,
    #[serde(default)]
    pub ask_size: Option<f64>,
    #[serde(default)]
    pub last: Option<f64>,
    #[serde(default)]
    pub change: Option<f64>,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub previous_close: Option<f64>,
    #[serde(default)]
    pub turnover: Option<f64>,
    #[serde(default)]
    pub volume: Option<i64>,
    #[serde(default)]
    pub operations: Option<i64>,
}

fn default_sequence() -> i64 {
    crate::pipeline::sequence::NO_SEQUENCE
}

impl ReplayTick {
    fn into_parts(self) -> (String, Quote, i64) {
        let quote = Quote {
            bid: self.bid,
            bid_size: self.bid_size,
            ask: self.ask,
            ask_size: self.ask_size,
            last: self.last,
            change: self.change,
            open: self.open,
            high: self.high,
            low: self.low,
            previous_close: self.previous_close,
            turnover: self.turnover,
            volume: self.volume,
            operations: self.operations,
            event_time: normalize_epoch_to_ms(self.event_time),
        };
        (self.symbol, quote, self.sequence)
    }
}

fn read_ticks(path: &Path) -> anyhow::Result<Vec<ReplayTick>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open replay file {}", path.display()))?;
    let mut ticks = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {} line {}", path.display(), line_no + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ReplayTick>(&line) {
            Ok(tick) => ticks.push(tick),
            Err(err) => warn!(
                "skip malformed replay line {}:{}: {err:#}",
                path.display(),
                line_no + 1
            ),
        }
    }
    Ok(ticks)
}

/// Spawn a task that replays a JSONL tick file at the configured pace.
/// With `loop_file` the replay restarts from the top (re-reading the file, so
/// it can be appended to between passes); each restart counts as a producer
/// restart in the metrics. Fails fast if the file cannot be read at all.
pub fn spawn_replay_producer(
    path: impl AsRef<Path>,
    ticks_per_second: u64,
    loop_file: bool,
    pipeline: Arc<TickPipeline>,
    shutdown: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let first_pass = read_ticks(&path)?;
    if first_pass.is_empty() {
        anyhow::bail!("replay file {} contains no ticks", path.display());
    }

    Ok(tokio::spawn(async move {
        info!(
            "replay producer: file={} ticks={} ticks_per_second={} loop={}",
            path.display(),
            first_pass.len(),
            ticks_per_second,
            loop_file
        );
        let period = std::time::Duration::from_secs_f64(1.0 / ticks_per_second.max(1) as f64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut ticks = first_pass;
        'outer: loop {
            for tick in ticks.drain(..) {
                tokio::select! {
                    _ = shutdown.cancelled() => break 'outer,
                    _ = ticker.tick() => {
                        let (symbol, quote, sequence) = tick.into_parts();
                        if let Err(err) = pipeline.process(&symbol, quote, sequence) {
                            warn!("replay tick rejected by dispatcher: {err:#}");
                        }
                    }
                }
            }

            if !loop_file {
                break;
            }
            pipeline.metrics().inc_producer_restarts();
            match read_ticks(&path) {
                Ok(next) if !next.is_empty() => ticks = next,
                Ok(_) => {
                    warn!("replay file {} emptied; stopping", path.display());
                    break;
                }
                Err(err) => {
                    warn!("replay re-read failed: {err:#}");
                    break;
                }
            }
        }
        info!("replay producer stopped");
    }))
}
