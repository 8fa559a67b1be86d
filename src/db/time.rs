use chrono::{DateTime, SecondsFormat, Utc};

/// Timestamps are stored as RFC 3339 text with millisecond precision and a
/// `Z` suffix. The fixed width keeps lexicographic ordering equal to
/// chronological ordering, which the due-date and latest-session queries
/// rely on.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

pub fn parse_timestamp_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(parse_timestamp)
}
