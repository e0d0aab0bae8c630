// Copyright (c) 2025 - Cowboy AI, Inc.

//! Topic grammar and NATS subject translation
//!
//! Services address messages with hierarchical topics:
//!
//! ```text
//! cim/core-command/request/{device}/{command}/{method}
//! ```
//!
//! - `/` separates levels
//! - `+` matches exactly one level
//! - `#` matches any number of trailing levels
//!
//! NATS spells the same thing `cim.core-command.request.*.>`. The translation
//! is plain character substitution, so topics containing a literal `.`, `*`
//! or `>` inside a segment do not survive a round trip.
//!
//! # Examples
//!
//! ```rust
//! use cim_messagebus::topics::{topic_to_subject, subject_to_topic, TopicBuilder};
//!
//! assert_eq!(topic_to_subject("cim/events/+/#"), "cim.events.*.>");
//! assert_eq!(subject_to_topic("cim.events.*.>"), "cim/events/+/#");
//!
//! let topic = TopicBuilder::new("cim/")
//!     .segment("core-command")
//!     .escaped("pump 7")
//!     .build();
//! assert_eq!(topic, "cim/core-command/pump%207");
//! ```

/// Topic level separator
pub const TOPIC_SEPARATOR: char = '/';
/// Single-level topic wildcard
pub const TOPIC_WILDCARD_ONE: char = '+';
/// Multi-level topic wildcard
pub const TOPIC_WILDCARD_ALL: char = '#';

/// NATS subject level separator
pub const SUBJECT_SEPARATOR: char = '.';
/// Single-level subject wildcard
pub const SUBJECT_WILDCARD_ONE: char = '*';
/// Multi-level subject wildcard
pub const SUBJECT_WILDCARD_ALL: char = '>';

/// Filler used when deriving JetStream stream names from subjects
const STREAM_NAME_FILLER: char = '_';

/// Convert a platform topic to a NATS subject
pub fn topic_to_subject(topic: &str) -> String {
    topic
        .chars()
        .map(|c| match c {
            TOPIC_SEPARATOR => SUBJECT_SEPARATOR,
            TOPIC_WILDCARD_ONE => SUBJECT_WILDCARD_ONE,
            TOPIC_WILDCARD_ALL => SUBJECT_WILDCARD_ALL,
            other => other,
        })
        .collect()
}

/// Convert a NATS subject back to a platform topic
pub fn subject_to_topic(subject: &str) -> String {
    subject
        .chars()
        .map(|c| match c {
            SUBJECT_SEPARATOR => TOPIC_SEPARATOR,
            SUBJECT_WILDCARD_ONE => TOPIC_WILDCARD_ONE,
            SUBJECT_WILDCARD_ALL => TOPIC_WILDCARD_ALL,
            other => other,
        })
        .collect()
}

/// Join topic levels with exactly one separator between each pair
///
/// Separators already present at the joins are collapsed, so
/// `build_topic(&["a/", "/b"])` is `a/b`. A leading separator on the first
/// level is kept.
pub fn build_topic<S: AsRef<str>>(levels: &[S]) -> String {
    let mut topic = String::new();
    for (index, level) in levels.iter().enumerate() {
        let level = level.as_ref();
        if index == 0 {
            topic.push_str(level.trim_end_matches(TOPIC_SEPARATOR));
            continue;
        }
        let level = level.trim_matches(TOPIC_SEPARATOR);
        if level.is_empty() {
            continue;
        }
        if !topic.is_empty() {
            topic.push(TOPIC_SEPARATOR);
        }
        topic.push_str(level);
    }
    topic
}

/// Response topic for one in-flight request: `<prefix>/<request_id>`
pub fn response_topic(prefix: &str, request_id: &str) -> String {
    build_topic(&[prefix, request_id])
}

/// True when `topic` is matched by the subscription `filter`
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split(TOPIC_SEPARATOR);
    let mut topic_levels = topic.split(TOPIC_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Percent-encode a name so it cannot be mistaken for topic structure
pub fn escape_segment(name: &str) -> String {
    urlencoding::encode(name).into_owned()
}

/// Derive a JetStream stream name from a subject
///
/// Trailing separators and wildcards are trimmed and the rest are replaced
/// by `_`: `cim.events.>` becomes `cim_events`. Distinct subjects can map to
/// the same name (`a.b` and `a_b`).
pub fn subject_to_stream_name(subject: &str) -> String {
    subject
        .trim_end_matches(|c| {
            c == SUBJECT_SEPARATOR || c == SUBJECT_WILDCARD_ONE || c == SUBJECT_WILDCARD_ALL
        })
        .chars()
        .map(|c| match c {
            SUBJECT_SEPARATOR | SUBJECT_WILDCARD_ONE | SUBJECT_WILDCARD_ALL => STREAM_NAME_FILLER,
            other => other,
        })
        .collect()
}

/// Builder for hierarchical topics
///
/// Levels added with [`TopicBuilder::escaped`] are percent-encoded when
/// escaping is enabled; levels added with [`TopicBuilder::segment`] are
/// taken verbatim.
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    levels: Vec<String>,
    escape: bool,
}

impl TopicBuilder {
    /// Start a topic under `base`
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            levels: vec![base.into()],
            escape: true,
        }
    }

    /// Enable or disable escaping of name levels
    pub fn escape_names(mut self, escape: bool) -> Self {
        self.escape = escape;
        self
    }

    /// Append a structural level verbatim
    pub fn segment(mut self, level: impl Into<String>) -> Self {
        self.levels.push(level.into());
        self
    }

    /// Append a user-supplied name level
    pub fn escaped(mut self, name: &str) -> Self {
        let level = if self.escape {
            escape_segment(name)
        } else {
            name.to_string()
        };
        self.levels.push(level);
        self
    }

    /// Build the topic string
    pub fn build(self) -> String {
        build_topic(&self.levels)
    }

    /// Build a filter matching everything below this topic
    pub fn build_wildcard(self) -> String {
        let mut levels = self.levels;
        levels.push(TOPIC_WILDCARD_ALL.to_string());
        build_topic(&levels)
    }
}
