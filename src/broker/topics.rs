//! Topic name/filter validation and MQTT wildcard matching.

use anyhow::{bail, Result};

/// Validate a topic name used in PUBLISH: non-empty, no wildcards, no NUL.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.is_empty() {
        bail!("empty topic name");
    }
    if topic.contains(['+', '#']) {
        bail!("wildcard in topic name {topic}");
    }
    if topic.contains('\0') {
        bail!("NUL character in topic name");
    }
    Ok(())
}

/// Validate a topic filter used in SUBSCRIBE.
/// - `+` must occupy a whole level
/// - `#` must occupy a whole level and be the last one
pub fn validate_topic_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        bail!("empty topic filter");
    }
    if filter.contains('\0') {
        bail!("NUL character in topic filter");
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (idx, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || idx + 1 != levels.len()) {
            bail!("misplaced multi-level wildcard in {filter}");
        }
        if level.contains('+') && *level != "+" {
            bail!("misplaced single-level wildcard in {filter}");
        }
    }
    Ok(())
}

/// Check if an MQTT topic filter matches a topic.
/// - `+` matches a single level
/// - `#` matches zero or more levels (must be last)
/// - wildcards at the first level never match topics starting with `$`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let filter_parts: Vec<&str> = filter.split('/').collect();
    let topic_parts: Vec<&str> = topic.split('/').collect();

    let mut fi = 0;
    let mut ti = 0;

    while fi < filter_parts.len() {
        let fp = filter_parts[fi];

        if fp == "#" {
            return true;
        }

        if ti >= topic_parts.len() {
            return false;
        }

        if fp != "+" && fp != topic_parts[ti] {
            return false;
        }

        fi += 1;
        ti += 1;
    }

    ti == topic_parts.len()
}
