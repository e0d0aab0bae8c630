// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for Topic Translation
//!
//! The translator is a pure character substitution, so within the platform
//! alphabet it must be a bijection between topics and subjects.

use cim_messagebus::topics::{
    build_topic, response_topic, subject_to_stream_name, subject_to_topic, topic_matches, topic_to_subject,
};
use proptest::prelude::*;

// ============================================================================
// Strategies
// ============================================================================

/// Topics drawn from the platform alphabet
fn topic() -> impl Strategy<Value = String> {
    "[A-Za-z0-9/+#]{0,48}"
}

/// Subjects drawn from the NATS alphabet
fn subject() -> impl Strategy<Value = String> {
    "[A-Za-z0-9.*>]{0,48}"
}

/// Concrete topics: no wildcards, no empty levels
fn concrete_topic() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9-]{1,8}", 1..6).prop_map(|levels| levels.join("/"))
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// Property: topic -> subject -> topic is the identity
    #[test]
    fn prop_topic_round_trip(topic in topic()) {
        prop_assert_eq!(subject_to_topic(&topic_to_subject(&topic)), topic);
    }

    /// Property: subject -> topic -> subject is the identity
    #[test]
    fn prop_subject_round_trip(subject in subject()) {
        prop_assert_eq!(topic_to_subject(&subject_to_topic(&subject)), subject);
    }

    /// Property: a translated subject carries no topic grammar
    #[test]
    fn prop_subject_has_no_topic_characters(topic in topic()) {
        let subject = topic_to_subject(&topic);
        prop_assert!(!subject.contains(['/', '+', '#']));
        prop_assert_eq!(subject.len(), topic.len());
    }

    /// Property: exactly one separator joins prefix and request id
    #[test]
    fn prop_response_topic_single_separator(
        prefix in concrete_topic(),
        trailing in any::<bool>(),
        id in "[a-f0-9-]{1,36}",
    ) {
        let raw_prefix = if trailing { format!("{}/", prefix) } else { prefix.clone() };
        prop_assert_eq!(response_topic(&raw_prefix, &id), format!("{}/{}", prefix, id));
    }

    /// Property: joined levels never produce an empty level
    #[test]
    fn prop_build_topic_has_no_double_separator(
        first in "[a-z]{1,6}/?",
        rest in prop::collection::vec("/?[a-z]{0,6}/?", 0..6),
    ) {
        let mut levels = vec![first];
        levels.extend(rest);
        let topic = build_topic(&levels);
        prop_assert!(!topic.contains("//"));
        prop_assert!(!topic.ends_with('/'));
    }

    /// Property: a concrete topic matches itself, `#`, and its parent with `#`
    #[test]
    fn prop_filter_matches(topic in concrete_topic()) {
        prop_assert!(topic_matches(&topic, &topic));
        prop_assert!(topic_matches("#", &topic));

        let levels: Vec<&str> = topic.split('/').collect();
        let parent_wildcard = format!("{}/#", levels[0]);
        prop_assert!(topic_matches(&parent_wildcard, &topic));

        let single_level = vec!["+"; levels.len()].join("/");
        prop_assert!(topic_matches(&single_level, &topic));
    }

    /// Property: a single-level wildcard never spans levels
    #[test]
    fn prop_single_level_wildcard_is_one_level(topic in concrete_topic()) {
        let deeper = format!("{}/extra", topic);
        let depth = topic.split('/').count();
        let filter = vec!["+"; depth].join("/");
        prop_assert!(!topic_matches(&filter, &deeper));
    }

    /// Property: stream names contain no subject grammar
    #[test]
    fn prop_stream_name_is_plain(subject in subject()) {
        let name = subject_to_stream_name(&subject);
        prop_assert!(!name.contains(['.', '*', '>']));
    }
}
