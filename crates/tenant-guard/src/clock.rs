//! Timestamp helpers.
//!
//! All timestamps are truncated to microseconds and stored as fixed-width
//! RFC 3339 strings in UTC, so stored values sort lexicographically and
//! compare equal after a round trip.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

/// Returns the current time at storage precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Formats a timestamp for storage.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a stored timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|ts| ts.with_timezone(&Utc))
}
