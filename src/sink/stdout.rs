use std::io::Write;

use anyhow::Context;

use crate::schema::cell::CellUpdate;
use crate::sink::Sink;

/// Recorder sink that prints one JSON object per cell update to stdout.
/// Useful for piping the coalesced stream into other tooling and for eyeball
/// debugging of what a spreadsheet-native sink would receive.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl Sink for StdoutSink {
    fn open(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn write_batch(&mut self, batch: &[CellUpdate]) -> anyhow::Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for update in batch {
            let line = serde_json::to_string(update).context("serialize cell update")?;
            out.write_all(line.as_bytes()).context("write stdout")?;
            out.write_all(b"\n").context("write newline")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        std::io::stdout().flush().context("flush stdout")
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.flush()
    }
}
