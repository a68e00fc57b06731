pub mod jsonl;
pub mod recorder;
pub mod resilience;
pub mod stdout;

use crate::schema::cell::CellUpdate;

/// A destination for coalesced cell writes. Implementations may block on I/O
/// and may fail transiently; the scheduler isolates both from the producer.
///
/// Sinks resolve column names to physical columns themselves and must create
/// columns they have not seen before rather than reject them.
pub trait Sink: Send {
    /// Open or create the backing document. A failure here is fatal to the
    /// process; the pipeline cannot run without a sink.
    fn open(&mut self) -> anyhow::Result<()>;

    /// Accept a batch of cell writes. Returns once the batch is durably
    /// accepted by the document layer.
    fn write_batch(&mut self, batch: &[CellUpdate]) -> anyhow::Result<()>;

    /// Persist previously accepted writes.
    fn flush(&mut self) -> anyhow::Result<()>;

    /// Release the backing document.
    fn close(&mut self) -> anyhow::Result<()>;
}
