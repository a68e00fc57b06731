use std::sync::Arc;

use parking_lot::Mutex;

use crate::schema::cell::CellUpdate;
use crate::sink::Sink;

#[derive(Debug, Default)]
struct RecorderState {
    opened: bool,
    closed: bool,
    batches: Vec<Vec<CellUpdate>>,
    write_attempts: u64,
    flushes: u64,
    fail_remaining: u32,
}

/// In-memory sink: records every accepted batch and can be scripted to fail
/// the next N write calls. Cloning yields a handle onto the same recording,
/// which is how tests keep visibility after the sink moves into the
/// scheduler.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    state: Arc<Mutex<RecorderState>>,
}

impl RecordingSink {
    pub fn handle(&self) -> RecordingSink {
        self.clone()
    }

    /// Make the next `n` write calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_remaining = n;
    }

    pub fn batches(&self) -> Vec<Vec<CellUpdate>> {
        self.state.lock().batches.clone()
    }

    pub fn all_updates(&self) -> Vec<CellUpdate> {
        self.state.lock().batches.iter().flatten().cloned().collect()
    }

    pub fn write_attempts(&self) -> u64 {
        self.state.lock().write_attempts
    }

    pub fn flushes(&self) -> u64 {
        self.state.lock().flushes
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        state.opened && !state.closed
    }
}

impl Sink for RecordingSink {
    fn open(&mut self) -> anyhow::Result<()> {
        self.state.lock().opened = true;
        Ok(())
    }

    fn write_batch(&mut self, batch: &[CellUpdate]) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.write_attempts += 1;
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            anyhow::bail!("recorder scripted failure");
        }
        state.batches.push(batch.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}
