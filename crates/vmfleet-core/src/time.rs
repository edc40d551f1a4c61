use std::time::Duration;

use chrono::{DateTime, Utc};

/// Agent-log stamp for `at`, to the millisecond.
pub fn log_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// How long a node has been idle at `now`. Clock skew into the future reads as zero.
pub fn idle_for(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_stamp_format() {
        let at = DateTime::parse_from_rfc3339("2026-01-01T09:05:03.25Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(log_stamp(at), "2026-01-01 09:05:03.250");
    }

    #[test]
    fn test_idle_for_past() {
        let now = Utc::now();
        let since = now - chrono::Duration::minutes(61);
        assert_eq!(idle_for(since, now), Duration::from_secs(61 * 60));
    }

    #[test]
    fn test_idle_for_future_is_zero() {
        let now = Utc::now();
        let since = now + chrono::Duration::seconds(30);
        assert_eq!(idle_for(since, now), Duration::ZERO);
    }
}
