//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Topic filters MAY contain wildcards
//! - Multi-level wildcard (#) must occupy the final level entirely
//! - Single-level wildcard (+) must occupy an entire level
//! - Topics starting with $ are system topics: root-level wildcards do
//!   not match them

/// Maximum size in bytes of a single topic level (names) or of a whole
/// filter.
const MAX_BYTES: usize = 65_535;

/// Validate a topic name (used for publishes)
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not contain wildcards (+ or #)
/// - Must not contain the null character
/// - No level may exceed 65535 bytes
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    if topic.split('/').any(|level| level.len() > MAX_BYTES) {
        return Err("topic level exceeds maximum length");
    }

    Ok(())
}

/// Validate a topic filter (used for subscriptions)
///
/// Topic filters:
/// - Must be at least 1 character and at most 65535 bytes
/// - Must not contain the null character
/// - Multi-level wildcard (#) must occupy the entire final level
/// - Single-level wildcard (+) must occupy an entire level
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > MAX_BYTES {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let levels: Vec<&str> = filter.split('/').collect();

    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') {
            if *level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if i != levels.len() - 1 {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && *level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

/// Check whether a topic filter matches a topic name
///
/// Matching rules:
/// - / is the level separator; empty levels are significant
/// - + matches exactly one level of any content
/// - # matches zero or more remaining levels (must be last)
/// - $-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    // "a/#" matches "a" because # is consumed before the topic runs out
    // and covers the empty suffix.
    loop {
        match filter_levels.next() {
            Some("#") => return true,
            Some(filter_level) => match topic_levels.next() {
                Some(topic_level) => {
                    if filter_level != "+" && filter_level != topic_level {
                        return false;
                    }
                }
                None => return false,
            },
            None => return topic_levels.next().is_none(),
        }
    }
}
