/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing topic name and topic filter validation and matching support.
 */

/// Maximum encoded length of a topic, per the MQTT specification
pub(crate) const MAXIMUM_TOPIC_LENGTH: usize = 65_535;

/// Checks whether a string is a valid MQTT topic name: non-empty, within the length bound,
/// and free of wildcard characters.
pub fn is_valid_topic_name(topic: &str) -> bool {
    if topic.is_empty() || topic.len() > MAXIMUM_TOPIC_LENGTH {
        return false;
    }

    !topic.contains(['#', '+', '\0'])
}

/// Checks whether a string is a valid MQTT topic filter.  `+` must occupy a whole level and
/// `#` must occupy the whole final level.
pub fn is_valid_topic_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.len() > MAXIMUM_TOPIC_LENGTH || filter.contains('\0') {
        return false;
    }

    let mut seen_multi_level_wildcard = false;
    for level in filter.split('/') {
        if seen_multi_level_wildcard {
            return false;
        }

        match level {
            "#" => { seen_multi_level_wildcard = true; }
            "+" => {}
            _ => {
                if level.contains(['#', '+']) {
                    return false;
                }
            }
        }
    }

    true
}

/// Matches a topic name against a topic filter per the MQTT 3.1.1 rules.
///
/// `+` matches exactly one level, `#` matches the remainder of the topic including its own
/// parent level, and filters starting with a wildcard never match topics starting with `$`.
pub fn matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('#') || filter.starts_with('+')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => {
                return true;
            }
            (Some("+"), Some(_)) => {}
            (Some(filter_level), Some(topic_level)) => {
                if filter_level != topic_level {
                    return false;
                }
            }
            (Some(_), None) => {
                return false;
            }
            (None, Some(_)) => {
                return false;
            }
            (None, None) => {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_name_validation() {
        assert!(is_valid_topic_name("a"));
        assert!(is_valid_topic_name("sport/tennis/player1"));
        assert!(is_valid_topic_name("/"));
        assert!(is_valid_topic_name("$SYS/broker/load"));

        assert!(!is_valid_topic_name(""));
        assert!(!is_valid_topic_name("sport/+"));
        assert!(!is_valid_topic_name("sport/#"));
        assert!(!is_valid_topic_name("sp\0ort"));
    }

    #[test]
    fn topic_filter_validation() {
        assert!(is_valid_topic_filter("a"));
        assert!(is_valid_topic_filter("#"));
        assert!(is_valid_topic_filter("+"));
        assert!(is_valid_topic_filter("sport/#"));
        assert!(is_valid_topic_filter("sport/+/player1"));
        assert!(is_valid_topic_filter("+/+/+"));
        assert!(is_valid_topic_filter("/finance"));

        assert!(!is_valid_topic_filter(""));
        assert!(!is_valid_topic_filter("sport/#/tennis"));
        assert!(!is_valid_topic_filter("sport+"));
        assert!(!is_valid_topic_filter("sport/ten+nis"));
        assert!(!is_valid_topic_filter("#/tail"));
    }

    #[test]
    fn exact_matching() {
        assert!(matches_filter("sport/tennis", "sport/tennis"));
        assert!(!matches_filter("sport/tennis", "sport/hockey"));
        assert!(!matches_filter("sport", "sport/tennis"));
        assert!(!matches_filter("sport/tennis", "sport"));
    }

    #[test]
    fn single_level_wildcard_matching() {
        assert!(matches_filter("sport/tennis", "sport/+"));
        assert!(matches_filter("sport/", "sport/+"));
        assert!(!matches_filter("sport", "sport/+"));
        assert!(!matches_filter("sport/tennis/player1", "sport/+"));
        assert!(matches_filter("sport/tennis/player1", "sport/+/player1"));
        assert!(matches_filter("/finance", "+/+"));
        assert!(!matches_filter("/finance", "+"));
    }

    #[test]
    fn multi_level_wildcard_matching() {
        assert!(matches_filter("sport", "#"));
        assert!(matches_filter("sport/tennis/player1", "#"));
        assert!(matches_filter("sport/tennis", "sport/#"));
        assert!(matches_filter("sport/tennis/player1", "sport/#"));

        // the multi level wildcard also matches its parent level
        assert!(matches_filter("sport", "sport/#"));
    }

    #[test]
    fn dollar_topics_do_not_match_leading_wildcards() {
        assert!(!matches_filter("$SYS/broker/load", "#"));
        assert!(!matches_filter("$SYS/broker/load", "+/broker/load"));
        assert!(matches_filter("$SYS/broker/load", "$SYS/#"));
        assert!(matches_filter("$SYS/broker/load", "$SYS/broker/+"));
    }
}
