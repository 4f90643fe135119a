//! Topic names and topic filters
//!
//! Validation rules shared by PUBLISH (names) and SUBSCRIBE/UNSUBSCRIBE
//! (filters), and a direct matcher used where a trie walk is not available,
//! such as scanning the retained store for a new subscription.

use crate::error::BrokerError;

pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

const MAX_TOPIC_LENGTH: usize = u16::MAX as usize;

/// Topic names must be non-empty, free of wildcards and of U+0000.
pub fn validate_topic_name(name: &str) -> Result<(), BrokerError> {
    let invalid = || BrokerError::InvalidTopicName {
        topic: name.to_owned(),
    };
    if name.is_empty() || name.len() > MAX_TOPIC_LENGTH {
        return Err(invalid());
    }
    if name.contains(['+', '#', '\0']) {
        return Err(invalid());
    }
    Ok(())
}

/// Topic filters may use `+` as a whole level and `#` as the whole last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), BrokerError> {
    let invalid = || BrokerError::InvalidTopicFilter {
        filter: filter.to_owned(),
    };
    if filter.is_empty() || filter.len() > MAX_TOPIC_LENGTH || filter.contains('\0') {
        return Err(invalid());
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let is_last = levels.peek().is_none();
        match level {
            MULTI_LEVEL_WILDCARD if !is_last => return Err(invalid()),
            MULTI_LEVEL_WILDCARD | SINGLE_LEVEL_WILDCARD => {}
            _ if level.contains(['+', '#']) => return Err(invalid()),
            _ => {}
        }
    }
    Ok(())
}

/// Whether `filter` matches the concrete topic `name`.
///
/// Topics starting with `$` are never matched by a leading wildcard.
pub fn topic_matches(name: &str, filter: &str) -> bool {
    if name.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut name_levels = name.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), name_levels.next()) {
            // '#' also covers the parent level, so it matches with or without a remaining level
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(f), Some(n)) if f == n => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== NAME VALIDATION =====

    #[test]
    fn test_valid_topic_names() {
        for name in ["a", "sensors/temp", "/leading", "trailing/", "a//b", "$SYS/uptime", "sensor/温度"] {
            assert!(validate_topic_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_topic_names() {
        for name in ["", "a/+", "a/#", "a+b", "a\0b"] {
            assert!(validate_topic_name(name).is_err(), "{:?} should be invalid", name);
        }
    }

    // ===== FILTER VALIDATION =====

    #[test]
    fn test_valid_filters() {
        for filter in ["#", "+", "sensors/#", "sensors/+/humidity", "+/+/#", "/#", "a//b", "+/"] {
            assert!(validate_topic_filter(filter).is_ok(), "{} should be valid", filter);
        }
    }

    #[test]
    fn test_hash_not_last_rejected() {
        assert!(validate_topic_filter("sensors/#/temp").is_err());
        assert!(validate_topic_filter("#/").is_err());
    }

    #[test]
    fn test_fused_wildcards_rejected() {
        for filter in ["sensors#", "sensors/temp+", "a/+b/c", "a/#b", "++", "##"] {
            assert!(validate_topic_filter(filter).is_err(), "{} should be invalid", filter);
        }
    }

    #[test]
    fn test_empty_filter_rejected() {
        assert!(validate_topic_filter("").is_err());
    }

    // ===== MATCHING =====

    #[test]
    fn test_exact_match() {
        assert!(topic_matches("sensors/temp", "sensors/temp"));
        assert!(!topic_matches("sensors/temp", "sensors/humidity"));
        assert!(!topic_matches("sensors/temp", "sensors"));
        assert!(!topic_matches("sensors", "sensors/temp"));
    }

    #[test]
    fn test_plus_wildcard() {
        assert!(topic_matches("sensors/device1/humidity", "sensors/+/humidity"));
        assert!(!topic_matches("sensors/device1/room1/humidity", "sensors/+/humidity"));
        assert!(topic_matches("sensors/", "sensors/+"));
        assert!(!topic_matches("sensors", "sensors/+"));
    }

    #[test]
    fn test_hash_wildcard() {
        for name in ["sensors", "sensors/temperature", "sensors/a/b", "sensors/a/b/c/d/e/f"] {
            assert!(topic_matches(name, "sensors/#"), "should match {}", name);
        }
        assert!(!topic_matches("other/x", "sensors/#"));
        assert!(topic_matches("anything/at/all", "#"));
    }

    #[test]
    fn test_plus_and_hash_combined() {
        assert!(topic_matches("sensors/temp", "sensors/+/#"));
        assert!(topic_matches("sensors/temp/room1", "sensors/+/#"));
        assert!(topic_matches("sensors/room1/temp", "sensors/+/temp/#"));
    }

    #[test]
    fn test_dollar_topics_excluded_from_leading_wildcards() {
        assert!(!topic_matches("$SYS/uptime", "#"));
        assert!(!topic_matches("$SYS/uptime", "+/uptime"));
        assert!(topic_matches("$SYS/uptime", "$SYS/#"));
    }

    #[test]
    fn test_empty_levels_and_case() {
        assert!(topic_matches("sensors//temp", "sensors//temp"));
        assert!(topic_matches("/temp", "+/temp"));
        assert!(!topic_matches("sensors/temp", "Sensors/Temp"));
    }

    #[test]
    fn test_long_topics() {
        let long_topic = "a/b/c/d/e/f/g/h/i/j/k/l/m/n/o/p/q/r/s/t/u/v/w/x/y/z";
        assert!(topic_matches(long_topic, "+/+/+/+/+/+/+/+/+/+/+/+/+/+/#"));
    }
}
