use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub sink: SinkConfig,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        toml::from_str(&raw).context("parse config.toml")
    }

    /// Enforce the documented option ranges. A failure here is a
    /// configuration error and the process must refuse to start.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.pipeline.validate()?;
        self.source.validate()?;
        self.sink.validate()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Silence after which an instrument is flagged stale.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,

    /// Flush once this many quotes accumulated since the last flush.
    #[serde(default = "default_batch_high_watermark")]
    pub batch_high_watermark: usize,

    /// Flush once the oldest pending write is this old. Must stay below the
    /// stale threshold so a flush always lands before staleness is judged.
    #[serde(default = "default_batch_max_age_ms")]
    pub batch_max_age_ms: u64,

    #[serde(default = "default_max_ticks_per_symbol")]
    pub max_ticks_per_symbol: usize,

    #[serde(default = "default_retention_window_ms")]
    pub retention_window_ms: u64,

    /// Updates for these symbols flush immediately.
    #[serde(default)]
    pub priority_symbols: Vec<String>,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: default_stale_threshold_ms(),
            batch_high_watermark: default_batch_high_watermark(),
            batch_max_age_ms: default_batch_max_age_ms(),
            max_ticks_per_symbol: default_max_ticks_per_symbol(),
            retention_window_ms: default_retention_window_ms(),
            priority_symbols: vec![],
            flush_interval_ms: default_flush_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1_000..=300_000).contains(&self.stale_threshold_ms) {
            anyhow::bail!(
                "pipeline.stale_threshold_ms={} out of range 1000..=300000",
                self.stale_threshold_ms
            );
        }
        if !(1..=10_000).contains(&self.batch_high_watermark) {
            anyhow::bail!(
                "pipeline.batch_high_watermark={} out of range 1..=10000",
                self.batch_high_watermark
            );
        }
        if !(10..=60_000).contains(&self.batch_max_age_ms) {
            anyhow::bail!(
                "pipeline.batch_max_age_ms={} out of range 10..=60000",
                self.batch_max_age_ms
            );
        }
        if self.batch_max_age_ms >= self.stale_threshold_ms {
            anyhow::bail!(
                "pipeline.batch_max_age_ms={} must be strictly less than stale_threshold_ms={}",
                self.batch_max_age_ms,
                self.stale_threshold_ms
            );
        }
        if !(1..=1_000).contains(&self.max_ticks_per_symbol) {
            anyhow::bail!(
                "pipeline.max_ticks_per_symbol={} out of range 1..=1000",
                self.max_ticks_per_symbol
            );
        }
        if !(60_000..=36_000_000).contains(&self.retention_window_ms) {
            anyhow::bail!(
                "pipeline.retention_window_ms={} out of range 60000..=36000000",
                self.retention_window_ms
            );
        }
        if self.flush_interval_ms == 0 {
            anyhow::bail!("pipeline.flush_interval_ms must be > 0");
        }
        if self.heartbeat_interval_ms < 100 {
            anyhow::bail!(
                "pipeline.heartbeat_interval_ms={} must be >= 100",
                self.heartbeat_interval_ms
            );
        }
        if self.backoff_base_ms == 0 {
            anyhow::bail!("pipeline.backoff_base_ms must be > 0");
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            anyhow::bail!(
                "pipeline.backoff_max_ms={} must be >= backoff_base_ms={}",
                self.backoff_max_ms,
                self.backoff_base_ms
            );
        }
        Ok(())
    }
}

fn default_stale_threshold_ms() -> u64 {
    5_000
}

fn default_batch_high_watermark() -> usize {
    100
}

fn default_batch_max_age_ms() -> u64 {
    1_000
}

fn default_max_ticks_per_symbol() -> usize {
    100
}

fn default_retention_window_ms() -> u64 {
    300_000
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_heartbeat_interval_ms() -> u64 {
    1_000
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Demo,
    Replay,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,

    /// Symbols the demo feed generates.
    #[serde(default)]
    pub symbols: Vec<String>,

    /// Target tick rate across all symbols.
    #[serde(default = "default_source_ticks_per_second")]
    pub ticks_per_second: u64,

    /// Replay: path to a JSONL tick file.
    #[serde(default)]
    pub path: Option<String>,

    /// Replay: restart from the top when the file ends.
    #[serde(default)]
    pub loop_file: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            symbols: vec![],
            ticks_per_second: default_source_ticks_per_second(),
            path: None,
            loop_file: false,
        }
    }
}

impl SourceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ticks_per_second == 0 {
            anyhow::bail!("source.ticks_per_second must be > 0");
        }
        match self.kind {
            SourceKind::Demo => {
                if self.symbols.is_empty() {
                    anyhow::bail!("source.kind=demo requires a non-empty source.symbols list");
                }
            }
            SourceKind::Replay => {
                if self.path.as_deref().map_or(true, |p| p.trim().is_empty()) {
                    anyhow::bail!("source.kind=replay requires source.path");
                }
            }
        }
        Ok(())
    }
}

fn default_source_kind() -> SourceKind {
    SourceKind::Demo
}

fn default_source_ticks_per_second() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Stdout,
    Jsonl,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_sink_kind")]
    pub kind: SinkKind,

    /// Backing document for the jsonl sink.
    #[serde(default = "default_sink_path")]
    pub path: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: default_sink_kind(),
            path: default_sink_path(),
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if matches!(self.kind, SinkKind::Jsonl) && self.path.trim().is_empty() {
            anyhow::bail!("sink.kind=jsonl requires a non-empty sink.path");
        }
        Ok(())
    }
}

fn default_sink_kind() -> SinkKind {
    SinkKind::Stdout
}

fn default_sink_path() -> String {
    "cells.jsonl".to_string()
}
