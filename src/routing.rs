// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Route Keys, Topic Patterns and Partition Selection
//!
//! Three small pieces of pure routing logic:
//!
//! - deriving the route key of an outgoing message (`message.event` unless the
//!   caller supplied one),
//! - matching dotted route keys against topic patterns (`*` matches exactly
//!   one word, `#` matches zero or more), used to resolve the handler for a
//!   consumed message,
//! - resolving partition-key selector templates such as
//!   `"{message.serialNumber}"` against a decoded payload.

use crate::handler::{EventHandler, Handlers};
use serde_json::Value;
use std::sync::Arc;

/// Partition value used when no selector resolves.
pub const DEFAULT_PARTITION: &str = "default";

/// Derives the route key for an outgoing message.
///
/// An explicit key always wins; otherwise the payload's `event` field is used.
pub fn route_key_of(payload: &Value, explicit: Option<&str>) -> Option<String> {
    if let Some(key) = explicit {
        return Some(key.to_owned());
    }

    match payload.get("event") {
        Some(Value::String(event)) if !event.is_empty() => Some(event.clone()),
        _ => None,
    }
}

/// Returns true when `key` matches the topic `pattern`.
///
/// Follows AMQP topic-exchange semantics on dot-separated words: `*`
/// substitutes exactly one word, `#` substitutes zero or more words.
pub fn matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();

    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern {
        [] => key.is_empty(),
        // `#` absorbs any number of words, including none
        ["#", rest @ ..] => (0..=key.len()).any(|taken| matches_words(rest, &key[taken..])),
        ["*", rest @ ..] => !key.is_empty() && matches_words(rest, &key[1..]),
        [word, rest @ ..] => key.first() == Some(word) && matches_words(rest, &key[1..]),
    }
}

/// Resolves the handler for a route key.
///
/// An exact pattern wins outright. Among matching wildcard patterns the most
/// specific one is chosen: fewest `#` words, then fewest `*` words, then the
/// longest pattern.
pub fn resolve_handler(handlers: &Handlers, route_key: &str) -> Option<Arc<dyn EventHandler>> {
    if let Some(handler) = handlers.get(route_key) {
        return Some(handler.clone());
    }

    handlers
        .iter()
        .filter(|(pattern, _)| matches(pattern, route_key))
        .min_by_key(|(pattern, _)| {
            let hashes = pattern.split('.').filter(|word| *word == "#").count();
            let stars = pattern.split('.').filter(|word| *word == "*").count();
            (hashes, stars, usize::MAX - pattern.len())
        })
        .map(|(_, handler)| handler.clone())
}

/// Resolves the partition value for a payload.
///
/// Selectors are templates of the form `"{message.path.to.field}"`, resolved
/// in order against the decoded payload; the first one yielding a non-empty
/// scalar wins. With no selectors, or none resolving, the partition is
/// [`DEFAULT_PARTITION`].
pub fn partition_value(selectors: &[String], payload: Option<&Value>) -> String {
    let Some(payload) = payload else {
        return DEFAULT_PARTITION.to_owned();
    };

    selectors
        .iter()
        .filter_map(|selector| resolve_selector(selector, payload))
        .next()
        .unwrap_or_else(|| DEFAULT_PARTITION.to_owned())
}

/// Builds the dispatcher registry key for a queue and partition value.
pub fn dispatch_key(queue: &str, partition: &str) -> String {
    format!("{}:{}", queue, partition)
}

fn resolve_selector(selector: &str, payload: &Value) -> Option<String> {
    let path = selector.strip_prefix('{')?.strip_suffix('}')?;

    let mut segments = path.split('.');
    // the leading `message` segment names the payload root
    let first = segments.next()?;
    let mut cursor = if first == "message" {
        payload
    } else {
        payload.get(first)?
    };

    for segment in segments {
        cursor = cursor.get(segment)?;
    }

    match cursor {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BusError;
    use crate::handler::{handler_fn, Handlers};
    use serde_json::json;

    fn noop_handlers(patterns: &[&str]) -> Handlers {
        let mut handlers = Handlers::new();
        for pattern in patterns {
            handlers.insert(
                (*pattern).to_owned(),
                handler_fn(|_message, _ops| Box::pin(async { Ok::<(), BusError>(()) })),
            );
        }
        handlers
    }

    #[test]
    fn route_key_prefers_the_explicit_option() {
        let payload = json!({"event": "from.message"});

        assert_eq!(
            route_key_of(&payload, Some("from.options")).as_deref(),
            Some("from.options")
        );
        assert_eq!(route_key_of(&payload, None).as_deref(), Some("from.message"));
        assert_eq!(route_key_of(&json!({"name": "x"}), None), None);
        assert_eq!(route_key_of(&json!({"event": ""}), None), None);
    }

    #[test]
    fn star_matches_exactly_one_word() {
        assert!(matches("abc.*.xyz", "abc.helloworld.xyz"));
        assert!(!matches("abc.*.xyz", "abc.xyz"));
        assert!(!matches("abc.*.xyz", "abc.hello.world.xyz"));
        assert!(matches("*", "abc"));
        assert!(!matches("*", "abc.def"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        assert!(matches("abc.#", "abc"));
        assert!(matches("abc.#", "abc.hello.world"));
        assert!(matches("#.xyz", "xyz"));
        assert!(matches("#.xyz", "abc.hello.xyz"));
        assert!(matches("#", "anything.at.all"));
        assert!(!matches("abc.#.xyz", "abc"));
    }

    #[test]
    fn exact_patterns_require_equality() {
        assert!(matches("abc.def", "abc.def"));
        assert!(!matches("abc.def", "abc.deff"));
        assert!(!matches("abc.def", "abc"));
    }

    #[test]
    fn exact_handler_wins_over_wildcards() {
        let handlers = noop_handlers(&["abc.#", "abc.def", "abc.*"]);

        assert!(resolve_handler(&handlers, "abc.def").is_some());
        // resolution succeeds through wildcards when no exact entry exists
        assert!(resolve_handler(&handlers, "abc.ghi").is_some());
        assert!(resolve_handler(&handlers, "zzz").is_none());
    }

    #[test]
    fn most_specific_wildcard_wins() {
        let handlers = noop_handlers(&["#", "abc.*.xyz"]);

        // both match; resolution must not pick `#` over the narrower pattern
        let resolved = resolve_handler(&handlers, "abc.hello.xyz");
        assert!(resolved.is_some());

        let only_hash = noop_handlers(&["#"]);
        assert!(resolve_handler(&only_hash, "abc.hello.xyz").is_some());
    }

    #[test]
    fn first_resolving_selector_picks_the_partition() {
        let selectors = vec![
            "{message.missing}".to_owned(),
            "{message.serialNumber}".to_owned(),
        ];
        let payload = json!({"serialNumber": "sn-17", "event": "a"});

        assert_eq!(partition_value(&selectors, Some(&payload)), "sn-17");
    }

    #[test]
    fn nested_paths_and_numbers_resolve() {
        let selectors = vec!["{message.device.id}".to_owned()];
        let payload = json!({"device": {"id": 42}});

        assert_eq!(partition_value(&selectors, Some(&payload)), "42");
    }

    #[test]
    fn unresolved_selectors_fall_back_to_default() {
        let selectors = vec!["{message.absent}".to_owned()];

        assert_eq!(
            partition_value(&selectors, Some(&json!({"event": "a"}))),
            DEFAULT_PARTITION
        );
        assert_eq!(partition_value(&[], Some(&json!({}))), DEFAULT_PARTITION);
        assert_eq!(partition_value(&selectors, None), DEFAULT_PARTITION);
    }

    #[test]
    fn empty_string_values_do_not_pick_a_partition() {
        let selectors = vec!["{message.serialNumber}".to_owned()];

        assert_eq!(
            partition_value(&selectors, Some(&json!({"serialNumber": ""}))),
            DEFAULT_PARTITION
        );
    }

    #[test]
    fn dispatch_keys_join_queue_and_partition() {
        assert_eq!(dispatch_key("orders", "sn-17"), "orders:sn-17");
        assert_eq!(dispatch_key("orders", DEFAULT_PARTITION), "orders:default");
    }
}
