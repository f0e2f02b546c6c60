//! Time helpers.

use chrono::{DateTime, Local, TimeZone, Utc};

/// Current time as whole seconds since the Unix epoch.
pub fn epoch_secs() -> i64 {
    Utc::now().timestamp()
}

/// Formats the current local time as an ISO-8601 timestamp, the format used
/// for durable statistics like the all-time peak transfer rate.
pub fn iso_now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Formats an epoch-second timestamp for display, or an empty string when
/// the value is unset (zero).
pub fn display_epoch(secs: i64) -> String {
    if secs <= 0 {
        return String::new();
    }
    match Local.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => String::new(),
    }
}

/// Parses an RFC 3339 timestamp, used by cookie cache entries.
pub fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_epoch_zero_is_empty() {
        assert_eq!(display_epoch(0), "");
    }

    #[test]
    fn display_epoch_formats() {
        assert!(!display_epoch(1_600_000_000).is_empty());
    }

    #[test]
    fn rfc3339_round_trip() {
        let now = Utc::now();
        let parsed = parse_rfc3339(&now.to_rfc3339()).unwrap();
        assert_eq!(parsed.timestamp(), now.timestamp());
    }
}
