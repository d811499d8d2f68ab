//! Wall-clock formatting for persisted timestamps.

use chrono::{SecondsFormat, Utc};

/// Current UTC time as RFC 3339 with second precision (`2026-01-02T03:04:05Z`).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Current UTC time of day used as the log line prefix.
pub fn now_hms() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
