use chrono::TimeZone;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn format_time_str_ms(ts_ms: i64) -> String {
    // Example: 2025-12-16 05:24:47.713
    chrono::Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| format!("{ts_ms}ms"))
}

/// Age of an exchange timestamp relative to the local clock, clamped at zero.
pub fn lag_ms(ts_ms: i64) -> i64 {
    now_ms().saturating_sub(ts_ms).max(0)
}
