//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must occupy the final level
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are system topics and never match a leading
//!   + or # wildcard
//! - Empty levels (adjacent //) are distinct literal levels, not skipped

use crate::broker::BrokerError;

/// Maximum encoded topic length, from the wire protocol's u16 length prefix.
const MAX_TOPIC_LEN: usize = 65535;

/// Validate a topic name (used in PUBLISH).
pub fn validate_topic_name(topic: &str) -> Result<(), BrokerError> {
    if topic.is_empty() {
        return Err(BrokerError::InvalidTopic("topic name cannot be empty"));
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(BrokerError::InvalidTopic("topic name exceeds maximum length"));
    }
    if topic.contains('\0') {
        return Err(BrokerError::InvalidTopic("topic name cannot contain null character"));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(BrokerError::InvalidTopic("topic name cannot contain wildcards"));
    }
    Ok(())
}

/// Validate a topic filter (used in SUBSCRIBE/UNSUBSCRIBE).
pub fn validate_topic_filter(filter: &str) -> Result<(), BrokerError> {
    if filter.is_empty() {
        return Err(BrokerError::InvalidFilter("topic filter cannot be empty"));
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(BrokerError::InvalidFilter("topic filter exceeds maximum length"));
    }
    if filter.contains('\0') {
        return Err(BrokerError::InvalidFilter("topic filter cannot contain null character"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            // # must be the entire level and the last level
            if *level != "#" {
                return Err(BrokerError::InvalidFilter(
                    "multi-level wildcard must occupy entire level",
                ));
            }
            if i != levels.len() - 1 {
                return Err(BrokerError::InvalidFilter(
                    "multi-level wildcard must be last level",
                ));
            }
        }
        if level.contains('+') && *level != "+" {
            return Err(BrokerError::InvalidFilter(
                "single-level wildcard must occupy entire level",
            ));
        }
    }

    Ok(())
}

/// Check if a topic filter matches a topic name.
///
/// Pure and deterministic; this is the reference matching rule the tree
/// implements structurally.
///
/// - / is the level separator
/// - + matches exactly one level (which may be empty)
/// - # matches zero or more remaining levels (must be last)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let topic_levels: Vec<&str> = topic.split('/').collect();
    let filter_levels: Vec<&str> = filter.split('/').collect();

    let mut ti = 0;
    let mut fi = 0;

    while fi < filter_levels.len() {
        let filter_level = filter_levels[fi];

        if filter_level == "#" {
            // # matches everything remaining, including nothing
            return true;
        }

        if ti >= topic_levels.len() {
            return false;
        }

        if filter_level == "+" || filter_level == topic_levels[ti] {
            ti += 1;
            fi += 1;
        } else {
            return false;
        }
    }

    // Both must be exhausted for a match
    ti == topic_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());
        assert!(validate_topic_name("ros/domain1/node2/cmd_vel").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test#topic").is_err());
        assert!(validate_topic_name("test/+/topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
        assert!(validate_topic_name("te\0st").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("test").is_ok());
        assert!(validate_topic_filter("test/topic").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("test/+").is_ok());
        assert!(validate_topic_filter("test/#").is_ok());
        assert!(validate_topic_filter("+/test").is_ok());
        assert!(validate_topic_filter("+/+/+").is_ok());
        assert!(validate_topic_filter("test/+/topic").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("test+").is_err());
        assert!(validate_topic_filter("test#").is_err());
        assert!(validate_topic_filter("test/#/more").is_err());
        assert!(validate_topic_filter("a/#/b").is_err());
        assert!(validate_topic_filter("+test").is_err());
    }

    #[test_case("a/b/c", "a/+/c", true; "plus matches middle level")]
    #[test_case("a/b/x/c", "a/+/c", false; "plus cannot cross levels")]
    #[test_case("a/b/c", "a/#", true; "hash matches subtree")]
    #[test_case("a", "a/#", true; "hash matches zero levels")]
    #[test_case("/finance", "+/+", true; "empty first level is a level")]
    #[test_case("$sys/x", "#", false; "system topic hidden from bare hash")]
    #[test_case("$sys/x", "+/x", false; "system topic hidden from leading plus")]
    #[test_case("$sys/x", "$sys/+", true; "explicit system prefix matches")]
    fn test_spec_match_vectors(topic: &str, filter: &str, expected: bool) {
        assert_eq!(topic_matches_filter(topic, filter), expected);
    }

    #[test]
    fn test_topic_matches() {
        // Exact matches
        assert!(topic_matches_filter("test", "test"));
        assert!(topic_matches_filter("test/topic", "test/topic"));
        assert!(!topic_matches_filter("test", "test/topic"));
        assert!(!topic_matches_filter("test/topic", "test"));

        // Case-sensitive
        assert!(!topic_matches_filter("Test", "test"));

        // Single-level wildcard
        assert!(topic_matches_filter("test/topic", "test/+"));
        assert!(topic_matches_filter("test/topic", "+/topic"));
        assert!(!topic_matches_filter("test", "+/+"));
        assert!(!topic_matches_filter("test/topic/extra", "test/+"));

        // Empty levels are distinct literals
        assert!(topic_matches_filter("a//c", "a/+/c"));
        assert!(topic_matches_filter("a//c", "a//c"));
        assert!(!topic_matches_filter("a/c", "a//c"));

        // Multi-level wildcard
        assert!(topic_matches_filter("test", "#"));
        assert!(topic_matches_filter("test/topic/more", "test/#"));
        assert!(!topic_matches_filter("other/topic", "test/#"));
    }
}
