use serde::{Deserialize, Serialize};

/// Instrument class derived from the symbol convention. Assigned once when the
/// instrument is first observed and never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariantTag {
    #[serde(rename = "spot")]
    Spot,
    #[serde(rename = "settlement_24h")]
    Settlement24h,
    #[serde(rename = "other")]
    Other,
}

impl VariantTag {
    /// Symbols carrying a `-24H` / `.24H` suffix trade on the 24-hour
    /// settlement segment; plain alphanumeric symbols are spot.
    pub fn from_symbol(symbol: &str) -> Self {
        let upper = symbol.trim().to_ascii_uppercase();
        if upper.ends_with("-24H") || upper.ends_with(".24H") {
            VariantTag::Settlement24h
        } else if !upper.is_empty() && upper.chars().all(|c| c.is_ascii_alphanumeric()) {
            VariantTag::Spot
        } else {
            VariantTag::Other
        }
    }
}

/// One immutable snapshot of an instrument's market-data fields at an event
/// time. Price-like fields may each be absent independently; `event_time` is
/// wall-clock epoch milliseconds assigned by the producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Option<f64>,
    pub bid_size: Option<f64>,
    pub ask: Option<f64>,
    pub ask_size: Option<f64>,
    pub last: Option<f64>,
    pub change: Option<f64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub previous_close: Option<f64>,
    pub turnover: Option<f64>,
    pub volume: Option<i64>,
    pub operations: Option<i64>,
    pub event_time: i64,
}

impl Quote {
    /// Coerce negative values to absent. `change` is the one field that is
    /// legitimately signed; everything else negative is feed garbage.
    pub fn sanitize(&mut self) {
        fn scrub(field: &mut Option<f64>) {
            if matches!(field, Some(v) if *v < 0.0) {
                *field = None;
            }
        }
        scrub(&mut self.bid);
        scrub(&mut self.bid_size);
        scrub(&mut self.ask);
        scrub(&mut self.ask_size);
        scrub(&mut self.last);
        scrub(&mut self.open);
        scrub(&mut self.high);
        scrub(&mut self.low);
        scrub(&mut self.previous_close);
        scrub(&mut self.turnover);
        if matches!(self.volume, Some(v) if v < 0) {
            self.volume = None;
        }
        if matches!(self.operations, Some(v) if v < 0) {
            self.operations = None;
        }
    }
}
