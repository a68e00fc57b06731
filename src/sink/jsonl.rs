use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;

use crate::schema::cell::{CellUpdate, CellValue};
use crate::sink::Sink;
use crate::util::time::format_utc_ms;

/// One emitted row: the cell coordinates plus the value rendered the way a
/// spreadsheet would display it.
#[derive(Debug, Serialize)]
struct JsonlRow<'a> {
    sheet: &'a str,
    column: &'a str,
    row: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

/// File-backed document sink: appends cell writes as JSON lines. `open`
/// creates the file (and parent directory) if needed; an existing file is
/// appended to, matching how a long-lived workbook accumulates sessions.
pub struct JsonlSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
        }
    }

    fn writer(&mut self) -> anyhow::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("jsonl sink not opened: {}", self.path.display()))
    }
}

fn render_value(value: &CellValue) -> Option<String> {
    match value {
        CellValue::Text(text) => Some(text.clone()),
        CellValue::Integer(n) => Some(n.to_string()),
        CellValue::Decimal(d) => Some(d.to_string()),
        CellValue::Boolean(b) => Some(b.to_string()),
        CellValue::Instant(ms) => Some(format_utc_ms(*ms)),
        CellValue::Absent => None,
    }
}

impl Sink for JsonlSink {
    fn open(&mut self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create sink dir {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open sink document {}", self.path.display()))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn write_batch(&mut self, batch: &[CellUpdate]) -> anyhow::Result<()> {
        let writer = self.writer()?;
        for update in batch {
            let row = JsonlRow {
                sheet: &update.address.sheet,
                column: &update.address.column,
                row: update.address.row,
                value: render_value(&update.value),
            };
            let line = serde_json::to_string(&row).context("serialize cell row")?;
            writer.write_all(line.as_bytes()).context("write jsonl row")?;
            writer.write_all(b"\n").context("write newline")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.writer()?.flush().context("flush sink document")
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().context("final flush of sink document")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::cell::{columns, MARKET_DATA_SHEET};

    #[test]
    fn writes_rendered_rows_and_flushes_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cells.jsonl");
        let mut sink = JsonlSink::new(&path);
        sink.open().unwrap();

        let batch = vec![
            CellUpdate::new(MARKET_DATA_SHEET, columns::LAST, 2, CellValue::Decimal(101.0)),
            CellUpdate::new(
                MARKET_DATA_SHEET,
                columns::LAST_UPDATE,
                2,
                CellValue::Instant(1_705_314_600_000),
            ),
            CellUpdate::new(MARKET_DATA_SHEET, columns::SEQUENCE, 2, CellValue::Absent),
        ];
        sink.write_batch(&batch).unwrap();
        sink.close().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("\"value\":\"101\""));
        assert!(lines[1].contains("2024-01-15 10:30:00.000"));
        // Absent clears the cell: no value field at all.
        assert!(!lines[2].contains("\"value\""));
    }

    #[test]
    fn write_before_open_is_an_error() {
        let mut sink = JsonlSink::new("never-created.jsonl");
        assert!(sink.write_batch(&[]).is_err());
    }
}
