use serde::{Deserialize, Serialize};

/// Sheet names the dispatcher writes to.
pub const MARKET_DATA_SHEET: &str = "MarketData";
pub const METRICS_SHEET: &str = "Metrics";

/// Row the heartbeat occupies on the metrics sheet.
pub const METRICS_ROW: u32 = 2;

/// Column vocabulary. Columns are addressed by these human-readable names,
/// case-sensitive; sinks resolve name -> physical column and create columns
/// they have not seen before. Never spreadsheet-letter coordinates.
pub mod columns {
    pub const SYMBOL: &str = "Symbol";
    pub const LAST_UPDATE: &str = "LastUpdate";
    pub const IS_STALE: &str = "IsStale";
    pub const GAP_COUNT: &str = "GapCount";
    pub const SEQUENCE: &str = "Sequence";
    pub const LAST: &str = "Last";
    pub const BID: &str = "Bid";
    pub const ASK: &str = "Ask";
    pub const BID_SIZE: &str = "BidSize";
    pub const ASK_SIZE: &str = "AskSize";
    pub const VOLUME: &str = "Volume";
    pub const CHANGE: &str = "Change";
    pub const OPEN: &str = "Open";
    pub const HIGH: &str = "High";
    pub const LOW: &str = "Low";
    pub const TIMESTAMP: &str = "Timestamp";
    pub const TOTAL_QUOTES: &str = "TotalQuotes";
    pub const TOTAL_GAPS: &str = "TotalGaps";
    pub const STALE_COUNT: &str = "StaleCount";
    pub const INSTRUMENT_COUNT: &str = "InstrumentCount";
    pub const RETENTION_TOTAL_EVICTED: &str = "RetentionTotalEvicted";
    pub const RETENTION_LAST_EVICTION_UTC: &str = "RetentionLastEvictionUtc";
    pub const RETENTION_LAST_BATCH_EVICTED: &str = "RetentionLastBatchEvicted";
}

/// `(sheet, column-name, row)` triple; rows below 2 are header space and are
/// never addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellAddress {
    pub sheet: String,
    pub column: String,
    pub row: u32,
}

impl CellAddress {
    pub fn new(sheet: &str, column: &str, row: u32) -> Self {
        Self {
            sheet: sheet.to_string(),
            column: column.to_string(),
            row,
        }
    }
}

/// Typed cell payload. `Absent` clears the cell; `Instant` carries epoch
/// milliseconds and is formatted by the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Instant(i64),
    Absent,
}

/// A pending write of one value to one cell address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellUpdate {
    #[serde(flatten)]
    pub address: CellAddress,
    pub value: CellValue,
}

impl CellUpdate {
    pub fn new(sheet: &str, column: &str, row: u32, value: CellValue) -> Self {
        Self {
            address: CellAddress::new(sheet, column, row),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_with_same_coordinates_are_equal_keys() {
        let a = CellAddress::new(MARKET_DATA_SHEET, columns::LAST, 2);
        let b = CellAddress::new(MARKET_DATA_SHEET, columns::LAST, 2);
        assert_eq!(a, b);

        let c = CellAddress::new(MARKET_DATA_SHEET, columns::LAST, 3);
        assert_ne!(a, c);
    }

    #[test]
    fn cell_update_serializes_with_tagged_value() {
        let update = CellUpdate::new(METRICS_SHEET, columns::TOTAL_QUOTES, METRICS_ROW, CellValue::Integer(42));
        let json = serde_json::to_string(&update).unwrap();
        assert!(json.contains("\"sheet\":\"Metrics\""));
        assert!(json.contains("\"type\":\"integer\""));

        let back: CellUpdate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, update);
    }
}
