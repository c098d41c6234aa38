use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

/// Fixed-width RFC3339 with millisecond precision and a `Z` suffix, so stored
/// instants compare correctly as plain strings in SQL.
pub fn format_instant(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// 00:00 UTC of a calendar date.
pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}
