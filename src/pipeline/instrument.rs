use crate::pipeline::sequence::{classify, SequenceClass};
use crate::schema::quote::{Quote, VariantTag};

/// What `try_update` did with a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Quote stored; cell writes should be emitted.
    Applied {
        classification: SequenceClass,
        gap_count: u64,
    },
    /// Same sequence seen again. Nothing mutated, nothing to emit.
    Duplicate,
    /// Event time older than the last accepted one. Nothing mutated.
    StaleTimestamp,
}

/// Per-symbol mutable aggregate. Created on first observation, mutated only
/// through the dispatcher, never deleted (silence flags it stale instead).
#[derive(Debug, Clone)]
pub struct InstrumentState {
    symbol: String,
    variant: VariantTag,
    last_quote: Option<Quote>,
    last_update_ms: Option<i64>,
    last_sequence: Option<i64>,
    gap_count: u64,
    stale: bool,
    row_index: u32,
}

impl InstrumentState {
    pub fn new(symbol: &str, row_index: u32) -> Self {
        debug_assert!(row_index >= 2);
        Self {
            symbol: symbol.to_string(),
            variant: VariantTag::from_symbol(symbol),
            last_quote: None,
            last_update_ms: None,
            last_sequence: None,
            gap_count: 0,
            stale: false,
            row_index,
        }
    }

    /// Apply one tick. The event-time check comes first and is the only
    /// rejection; duplicates are dropped without mutating anything; gaps are
    /// counted and then applied like in-order ticks.
    pub fn try_update(&mut self, mut quote: Quote, sequence: i64) -> UpdateOutcome {
        if let Some(last_ms) = self.last_update_ms {
            if quote.event_time < last_ms {
                return UpdateOutcome::StaleTimestamp;
            }
        }

        let classification = classify(self.last_sequence, sequence);
        match classification {
            SequenceClass::Duplicate => return UpdateOutcome::Duplicate,
            SequenceClass::Gap => self.gap_count += 1,
            SequenceClass::First | SequenceClass::InOrder | SequenceClass::NoSequence => {}
        }

        quote.sanitize();
        self.last_update_ms = Some(quote.event_time);
        if classification != SequenceClass::NoSequence {
            self.last_sequence = Some(sequence);
        }
        self.last_quote = Some(quote);

        UpdateOutcome::Applied {
            classification,
            gap_count: self.gap_count,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn variant(&self) -> VariantTag {
        self.variant
    }

    pub fn last_quote(&self) -> Option<&Quote> {
        self.last_quote.as_ref()
    }

    pub fn last_update_ms(&self) -> Option<i64> {
        self.last_update_ms
    }

    pub fn last_sequence(&self) -> Option<i64> {
        self.last_sequence
    }

    pub fn gap_count(&self) -> u64 {
        self.gap_count
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn set_stale(&mut self, stale: bool) {
        self.stale = stale;
    }

    pub fn row_index(&self) -> u32 {
        self.row_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sequence::NO_SEQUENCE;

    fn quote_at(event_time: i64, last: f64) -> Quote {
        Quote {
            last: Some(last),
            event_time,
            ..Quote::default()
        }
    }

    #[test]
    fn first_update_stores_quote_and_cursor() {
        let mut state = InstrumentState::new("TEF", 2);
        let outcome = state.try_update(quote_at(1_000, 10.0), 1);
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                classification: SequenceClass::First,
                gap_count: 0
            }
        );
        assert_eq!(state.last_update_ms(), Some(1_000));
        assert_eq!(state.last_sequence(), Some(1));
        assert_eq!(state.last_quote().unwrap().last, Some(10.0));
    }

    #[test]
    fn older_event_time_is_rejected_without_mutation() {
        let mut state = InstrumentState::new("TEF", 2);
        state.try_update(quote_at(10_000, 10.0), 2);

        let outcome = state.try_update(quote_at(1_000, 99.0), 3);
        assert_eq!(outcome, UpdateOutcome::StaleTimestamp);
        assert_eq!(state.last_update_ms(), Some(10_000));
        assert_eq!(state.last_sequence(), Some(2));
        assert_eq!(state.last_quote().unwrap().last, Some(10.0));
        assert_eq!(state.gap_count(), 0);
    }

    #[test]
    fn equal_event_times_are_accepted() {
        let mut state = InstrumentState::new("TEF", 2);
        state.try_update(quote_at(1_000, 10.0), 1);
        let outcome = state.try_update(quote_at(1_000, 11.0), 2);
        assert!(matches!(outcome, UpdateOutcome::Applied { .. }));
        assert_eq!(state.last_quote().unwrap().last, Some(11.0));
    }

    #[test]
    fn duplicate_sequence_mutates_nothing() {
        let mut state = InstrumentState::new("TEF", 2);
        state.try_update(quote_at(1_000, 10.0), 3);
        let outcome = state.try_update(quote_at(2_000, 50.0), 3);
        assert_eq!(outcome, UpdateOutcome::Duplicate);
        assert_eq!(state.last_update_ms(), Some(1_000));
        assert_eq!(state.last_quote().unwrap().last, Some(10.0));
        assert_eq!(state.last_sequence(), Some(3));
    }

    #[test]
    fn gap_increments_count_and_moves_cursor_to_observed() {
        let mut state = InstrumentState::new("TEF", 2);
        state.try_update(quote_at(1_000, 10.0), 5);
        let outcome = state.try_update(quote_at(2_000, 11.0), 10);
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                classification: SequenceClass::Gap,
                gap_count: 1
            }
        );
        assert_eq!(state.last_sequence(), Some(10));

        // Backward jump is also a gap and also lands on the observed value.
        let outcome = state.try_update(quote_at(3_000, 12.0), 4);
        assert_eq!(
            outcome,
            UpdateOutcome::Applied {
                classification: SequenceClass::Gap,
                gap_count: 2
            }
        );
        assert_eq!(state.last_sequence(), Some(4));
    }

    #[test]
    fn no_sequence_ticks_leave_cursor_untouched() {
        let mut state = InstrumentState::new("TEF", 2);
        let outcome = state.try_update(quote_at(1_000, 10.0), NO_SEQUENCE);
        assert!(matches!(
            outcome,
            UpdateOutcome::Applied {
                classification: SequenceClass::NoSequence,
                ..
            }
        ));
        assert_eq!(state.last_sequence(), None);

        state.try_update(quote_at(2_000, 11.0), 9);
        assert_eq!(state.last_sequence(), Some(9));
        state.try_update(quote_at(3_000, 12.0), NO_SEQUENCE);
        assert_eq!(state.last_sequence(), Some(9));
        assert_eq!(state.gap_count(), 0);
    }

    #[test]
    fn stored_quote_is_sanitized() {
        let mut state = InstrumentState::new("TEF", 2);
        let quote = Quote {
            bid: Some(-5.0),
            last: Some(10.0),
            event_time: 1_000,
            ..Quote::default()
        };
        state.try_update(quote, 1);
        assert_eq!(state.last_quote().unwrap().bid, None);
    }

    #[test]
    fn timestamps_are_monotone_over_any_replay() {
        let mut state = InstrumentState::new("TEF", 2);
        let times = [5_i64, 3, 8, 8, 2, 12, 1, 12, 20];
        let mut watermark = i64::MIN;
        for (i, t) in times.iter().enumerate() {
            state.try_update(quote_at(*t, 1.0), i as i64 + 1);
            if let Some(ms) = state.last_update_ms() {
                assert!(ms >= watermark);
                watermark = ms;
            }
        }
        assert_eq!(state.last_update_ms(), Some(20));
    }
}
