use chrono::TimeZone;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Normalize an epoch timestamp to milliseconds.
///
/// Replay files collected from mixed feeds carry mixed units:
/// - seconds:  1_766_000_000
/// - millis:   1_766_000_000_000
/// - micros:   1_766_000_000_000_000
/// - nanos:    1_766_000_000_000_000_000
pub fn normalize_epoch_to_ms(ts: i64) -> i64 {
    if ts <= 0 {
        return ts;
    }
    if ts >= 1_000_000_000_000_000_000 {
        return ts / 1_000_000;
    }
    if ts >= 1_000_000_000_000_000 {
        return ts / 1_000;
    }
    if ts >= 1_000_000_000_000 {
        return ts;
    }
    if ts >= 1_000_000_000 {
        return ts.saturating_mul(1_000);
    }
    ts
}

/// Example: 2024-01-15 10:30:00.000
pub fn format_utc_ms(epoch_ms: i64) -> String {
    match chrono::Utc.timestamp_millis_opt(epoch_ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => epoch_ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_each_epoch_unit_to_millis() {
        assert_eq!(normalize_epoch_to_ms(1_766_000_000), 1_766_000_000_000);
        assert_eq!(normalize_epoch_to_ms(1_766_000_000_000), 1_766_000_000_000);
        assert_eq!(normalize_epoch_to_ms(1_766_000_000_000_000), 1_766_000_000_000);
        assert_eq!(
            normalize_epoch_to_ms(1_766_000_000_000_000_000),
            1_766_000_000_000
        );
        assert_eq!(normalize_epoch_to_ms(0), 0);
    }

    #[test]
    fn formats_epoch_ms_as_utc() {
        assert_eq!(format_utc_ms(1_705_314_600_000), "2024-01-15 10:30:00.000");
    }
}
