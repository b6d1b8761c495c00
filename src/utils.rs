use chrono::{DateTime, Utc};

pub fn get_current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Seconds elapsed between `since` and `now`, clamped at zero.
pub fn elapsed_seconds(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_seconds().max(0)
}

pub fn format_store_key(prefix: &str, key: &str) -> String {
    format!("{}:{}", prefix, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_elapsed_seconds_never_negative() {
        let now = Utc::now();
        assert_eq!(elapsed_seconds(now + Duration::seconds(5), now), 0);
        assert_eq!(elapsed_seconds(now - Duration::seconds(5), now), 5);
    }

    #[test]
    fn test_format_store_key() {
        assert_eq!(format_store_key("dots:scope", "42"), "dots:scope:42");
    }
}
