use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ticksheet::config::{Config, SinkKind, SourceKind};
use ticksheet::pipeline::dispatcher::{FlushQueue, TickPipeline};
use ticksheet::pipeline::policy::BatchPolicy;
use ticksheet::producer;
use ticksheet::scheduler::{self, FlushScheduler};
use ticksheet::sink::jsonl::JsonlSink;
use ticksheet::sink::resilience::ResilientSink;
use ticksheet::sink::stdout::StdoutSink;
use ticksheet::sink::Sink;
use ticksheet::util::metrics::PipelineMetrics;
use ticksheet::util::time::now_ms;

/// Cadence for the metrics snapshot in the log, on top of the per-interval
/// heartbeat row.
const STATS_REPORT_EVERY: Duration = Duration::from_secs(30);

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let cfg = match Config::from_path(&config_path).and_then(|cfg| {
        cfg.validate()?;
        Ok(cfg)
    }) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("configuration error ({config_path}): {err:#}");
            return ExitCode::from(2);
        }
    };

    match run(cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err:#}");
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run(cfg: Config) -> anyhow::Result<()> {
    log_config_summary(&cfg);

    let metrics = Arc::new(PipelineMetrics::default());
    let queue = Arc::new(Mutex::new(FlushQueue::new(BatchPolicy::new(
        cfg.pipeline.batch_high_watermark,
        Duration::from_millis(cfg.pipeline.batch_max_age_ms),
        &cfg.pipeline.priority_symbols,
    ))));
    let pipeline = Arc::new(TickPipeline::new(&cfg.pipeline, queue.clone(), metrics.clone()));

    // A sink that cannot even open is fatal; there is nothing to run without
    // one. Transient failures later are the resilience wrapper's problem.
    let inner: Box<dyn Sink> = match cfg.sink.kind {
        SinkKind::Stdout => Box::new(StdoutSink),
        SinkKind::Jsonl => Box::new(JsonlSink::new(&cfg.sink.path)),
    };
    let mut sink = ResilientSink::new(
        inner,
        Duration::from_millis(cfg.pipeline.backoff_base_ms),
        Duration::from_millis(cfg.pipeline.backoff_max_ms),
    );
    sink.open().context("open sink document")?;

    let scheduler_handle = scheduler::spawn(
        FlushScheduler::new(queue.clone(), sink, metrics.clone()),
        Duration::from_millis(cfg.pipeline.flush_interval_ms),
    );

    let shutdown = CancellationToken::new();
    let mut producer_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    match cfg.source.kind {
        SourceKind::Demo => {
            producer_tasks.push(producer::demo::spawn_demo_producer(
                &cfg.source.symbols,
                cfg.source.ticks_per_second,
                pipeline.clone(),
                shutdown.clone(),
            ));
        }
        SourceKind::Replay => {
            let path = cfg.source.path.clone().unwrap_or_default();
            let handle = producer::replay::spawn_replay_producer(
                &path,
                cfg.source.ticks_per_second,
                cfg.source.loop_file,
                pipeline.clone(),
                shutdown.clone(),
            )
            .context("start replay producer")?;
            producer_tasks.push(handle);
        }
    }

    let heartbeat_task = spawn_heartbeat(
        pipeline.clone(),
        Duration::from_millis(cfg.pipeline.heartbeat_interval_ms),
        shutdown.clone(),
    );

    wait_for_shutdown().await?;
    info!("shutdown: stopping producer and heartbeat tasks");

    // Producers stop before the scheduler so the final flush sees a quiesced
    // buffer.
    shutdown.cancel();
    futures_util::future::join_all(producer_tasks).await;
    let _ = heartbeat_task.await;

    scheduler_handle.shutdown();

    let snapshot = pipeline.metrics().snapshot();
    info!(
        "final stats: ticks={} flushed_updates={} flushes_ok={}/{} skipped={} gaps={} stale={} evicted={}",
        snapshot.ticks_received,
        snapshot.updates_flushed,
        snapshot.flushes_succeeded,
        snapshot.flushes_attempted,
        snapshot.flushes_skipped,
        snapshot.gaps_total,
        snapshot.stale_symbols,
        snapshot.retention_evicted_total
    );

    Ok(())
}

fn spawn_heartbeat(
    pipeline: Arc<TickPipeline>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_report = std::time::Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = now_ms();
                    pipeline.sweep_freshness(now);
                    pipeline.queue_heartbeat(now);

                    if last_report.elapsed() >= STATS_REPORT_EVERY {
                        last_report = std::time::Instant::now();
                        let snap = pipeline.metrics().snapshot();
                        info!(
                            "pipeline stats: ticks={} instruments={} stale={} flushes_ok={}/{} p95_flush_us={:?}",
                            snap.ticks_received,
                            snap.instrument_count,
                            snap.stale_symbols,
                            snap.flushes_succeeded,
                            snap.flushes_attempted,
                            snap.flush_latency_p95_us
                        );
                    }
                }
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn log_config_summary(cfg: &Config) {
    info!(
        "pipeline: stale_threshold_ms={} high_watermark={} max_age_ms={} flush_interval_ms={} heartbeat_interval_ms={} retention={}x{}ms backoff={}..{}ms priority_symbols={}",
        cfg.pipeline.stale_threshold_ms,
        cfg.pipeline.batch_high_watermark,
        cfg.pipeline.batch_max_age_ms,
        cfg.pipeline.flush_interval_ms,
        cfg.pipeline.heartbeat_interval_ms,
        cfg.pipeline.max_ticks_per_symbol,
        cfg.pipeline.retention_window_ms,
        cfg.pipeline.backoff_base_ms,
        cfg.pipeline.backoff_max_ms,
        cfg.pipeline.priority_symbols.len()
    );
    match cfg.source.kind {
        SourceKind::Demo => info!(
            "source: demo symbols={} ticks_per_second={}",
            cfg.source.symbols.len(),
            cfg.source.ticks_per_second
        ),
        SourceKind::Replay => info!(
            "source: replay path={} ticks_per_second={} loop={}",
            cfg.source.path.as_deref().unwrap_or("<unset>"),
            cfg.source.ticks_per_second,
            cfg.source.loop_file
        ),
    }
    match cfg.sink.kind {
        SinkKind::Stdout => info!("sink: stdout"),
        SinkKind::Jsonl => info!("sink: jsonl path={}", cfg.sink.path),
    }
}
