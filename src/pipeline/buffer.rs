use std::collections::HashMap;
use std::time::Instant;

use crate::schema::cell::{CellAddress, CellUpdate};

/// Keyed pending-write store with last-write-wins semantics: at most one
/// pending update per cell address, always the latest value. This is the
/// single interchange between the dispatcher and the flush scheduler, and the
/// mechanism that decouples producer rate from sink throughput.
#[derive(Debug, Default)]
pub struct CoalescingBuffer {
    pending: HashMap<CellAddress, CellUpdate>,
    oldest_enqueued_at: Option<Instant>,
}

impl CoalescingBuffer {
    /// Insert or replace the pending value at the update's address.
    pub fn enqueue(&mut self, update: CellUpdate) {
        if self.oldest_enqueued_at.is_none() {
            self.oldest_enqueued_at = Some(Instant::now());
        }
        self.pending.insert(update.address.clone(), update);
    }

    pub fn enqueue_all(&mut self, updates: impl IntoIterator<Item = CellUpdate>) {
        for update in updates {
            self.enqueue(update);
        }
    }

    /// Take everything currently pending and clear the store. Order is
    /// unspecified.
    pub fn drain(&mut self) -> Vec<CellUpdate> {
        self.oldest_enqueued_at = None;
        let mut taken = HashMap::new();
        std::mem::swap(&mut taken, &mut self.pending);
        taken.into_values().collect()
    }

    /// Put a previously drained batch back after a failed sink call, without
    /// clobbering addresses the producer has refreshed since the drain.
    pub fn restore(&mut self, batch: Vec<CellUpdate>) {
        if batch.is_empty() {
            return;
        }
        if self.oldest_enqueued_at.is_none() {
            self.oldest_enqueued_at = Some(Instant::now());
        }
        for update in batch {
            self.pending.entry(update.address.clone()).or_insert(update);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn oldest_enqueued_at(&self) -> Option<Instant> {
        self.oldest_enqueued_at
    }
}
