//! Timestamp utilities

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// End of a billing period that starts at `start` and lasts `days` days
pub fn period_end(start: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    start + ChronoDuration::days(i64::from(days))
}
