//! Topic registry: routes inbound broker messages to component handlers.
//!
//! Patterns are stored in a prefix tree over `/`-delimited segments. Each
//! terminal node carries the handlers registered for exactly that pattern,
//! keyed by the component that registered them, so several charts can share
//! one pattern and tear down independently. A reference count per pattern
//! string decides when the broker-level subscription itself has to be opened
//! (first consumer) or dropped (last consumer); the connection layer only
//! ever sees those 0→1 and 1→0 transitions.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{error, warn};

use super::error::MqttError;

/// Delivery metadata forwarded to handlers alongside the payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MessageMeta {
    /// Retained-message flag from the broker. Live charts skip these to
    /// avoid plotting stale points.
    pub retain: bool,
}

/// Message callback owned by a UI component. The registry holds a shared,
/// non-owning reference keyed by the component's identity string.
pub type Handler = Arc<dyn Fn(&str, &[u8], &MessageMeta) + Send + Sync>;

/// One path segment of a registered pattern. `+` and `#` are always treated
/// as reserved, never as literal segment values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Single,
    Multi,
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, MqttError> {
    let raw: Vec<&str> = pattern.split('/').collect();
    let mut segments = Vec::with_capacity(raw.len());
    for (idx, part) in raw.iter().enumerate() {
        match *part {
            "+" => segments.push(Segment::Single),
            "#" => {
                if idx + 1 != raw.len() {
                    return Err(MqttError::InvalidPattern(pattern.to_string()));
                }
                segments.push(Segment::Multi);
            }
            literal => segments.push(Segment::Literal(literal.to_string())),
        }
    }
    Ok(segments)
}

#[derive(Default)]
struct TrieNode {
    children: HashMap<Segment, TrieNode>,
    /// Non-empty only at the terminal node of at least one registered pattern.
    handlers: HashMap<String, Handler>,
}

/// Handler registry plus per-pattern reference counts.
///
/// Purely local state: the registry never talks to the broker itself. Its
/// `subscribe`/`unsubscribe` return the patterns whose count just crossed
/// zero so the caller can issue one batched broker call for them, and that
/// works identically whether or not a connection is currently live.
#[derive(Default)]
pub struct TopicRegistry {
    root: TrieNode,
    ref_counts: HashMap<String, usize>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `key` for every pattern in the call and
    /// returns the patterns that became active (count 0→1).
    ///
    /// Duplicate patterns within one call are processed once. Re-registering
    /// an existing `(pattern, key)` pair replaces the handler without
    /// touching the count. Patterns with a misplaced `#` are skipped with a
    /// warning; the rest of the call still goes through.
    pub fn subscribe<S: AsRef<str>>(
        &mut self,
        patterns: &[S],
        handler: Handler,
        key: &str,
    ) -> Vec<String> {
        let mut newly_active = Vec::new();
        let mut seen = HashSet::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if !seen.insert(pattern.to_string()) {
                continue;
            }
            let segments = match parse_pattern(pattern) {
                Ok(segments) => segments,
                Err(e) => {
                    warn!(%pattern, key, error = %e, "skipping invalid subscription pattern");
                    continue;
                }
            };
            let mut node = &mut self.root;
            for segment in &segments {
                node = node.children.entry(segment.clone()).or_default();
            }
            if node
                .handlers
                .insert(key.to_string(), handler.clone())
                .is_none()
            {
                let count = self.ref_counts.entry(pattern.to_string()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    newly_active.push(pattern.to_string());
                }
            }
        }
        newly_active
    }

    /// Removes `key`'s handler for every pattern in the call and returns the
    /// patterns that went inactive (count 1→0). Inactive patterns are erased
    /// from the count table entirely so a later subscribe is treated as
    /// fresh. Unknown `(pattern, key)` pairs are ignored.
    pub fn unsubscribe<S: AsRef<str>>(&mut self, patterns: &[S], key: &str) -> Vec<String> {
        let mut newly_inactive = Vec::new();
        let mut seen = HashSet::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if !seen.insert(pattern.to_string()) {
                continue;
            }
            let Ok(segments) = parse_pattern(pattern) else {
                // invalid patterns were never registered
                continue;
            };
            let mut node = Some(&mut self.root);
            for segment in &segments {
                node = node.and_then(|n| n.children.get_mut(segment));
            }
            let removed = node.map_or(false, |n| n.handlers.remove(key).is_some());
            if !removed {
                continue;
            }
            if let Some(count) = self.ref_counts.get_mut(pattern) {
                *count -= 1;
                if *count == 0 {
                    self.ref_counts.remove(pattern);
                    newly_inactive.push(pattern.to_string());
                }
            }
        }
        newly_inactive
    }

    /// All patterns with at least one live registration, i.e. the set that
    /// has to be re-subscribed after a (re)connect.
    pub fn active_patterns(&self) -> Vec<String> {
        self.ref_counts.keys().cloned().collect()
    }

    /// Collects every handler whose pattern matches the concrete topic.
    ///
    /// A topic segment matches a literal edge, a `+` edge and a `#` edge
    /// simultaneously when all are present; each receives the message. A `#`
    /// node also matches with zero remaining segments, so `x/#` covers `x`
    /// itself. Returned handlers are cloned out so invocation can happen
    /// without borrowing the trie.
    pub fn matches(&self, topic: &str) -> Vec<Handler> {
        let segments: Vec<&str> = topic.split('/').collect();
        let mut collected = Vec::new();
        collect(&self.root, &segments, &mut collected);
        collected
    }

    /// Walks the trie for `topic` and invokes every matching handler once.
    /// Zero matches is a silent no-op; most cluster traffic is not locally
    /// subscribed.
    pub fn dispatch(&self, topic: &str, payload: &[u8], meta: &MessageMeta) {
        invoke_all(&self.matches(topic), topic, payload, meta);
    }
}

fn collect(node: &TrieNode, remaining: &[&str], out: &mut Vec<Handler>) {
    // '#' swallows all remaining segments, including none.
    if let Some(multi) = node.children.get(&Segment::Multi) {
        out.extend(multi.handlers.values().cloned());
    }
    match remaining.split_first() {
        None => out.extend(node.handlers.values().cloned()),
        Some((segment, rest)) => {
            if let Some(child) = node.children.get(&Segment::Literal((*segment).to_string())) {
                collect(child, rest, out);
            }
            if let Some(child) = node.children.get(&Segment::Single) {
                collect(child, rest, out);
            }
        }
    }
}

/// Runs each handler exactly once. A panicking handler is caught and logged
/// so the remaining handlers for the same message still run.
pub(crate) fn invoke_all(handlers: &[Handler], topic: &str, payload: &[u8], meta: &MessageMeta) {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(topic, payload, meta))).is_err() {
            error!(%topic, "message handler panicked during dispatch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn counting_handler(hits: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_, _, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn noop_handler() -> Handler {
        Arc::new(|_, _, _| {})
    }

    #[test]
    fn first_key_activates_pattern_once() {
        let mut registry = TopicRegistry::new();
        let active = registry.subscribe(&["sensors/+/temp"], noop_handler(), "chart-a");
        assert_eq!(active, vec!["sensors/+/temp".to_string()]);

        // second consumer on the same pattern must not re-activate it
        let active = registry.subscribe(&["sensors/+/temp"], noop_handler(), "chart-b");
        assert!(active.is_empty());
    }

    #[test]
    fn last_key_deactivates_pattern_once() {
        let mut registry = TopicRegistry::new();
        registry.subscribe(&["sensors/+/temp"], noop_handler(), "chart-a");
        registry.subscribe(&["sensors/+/temp"], noop_handler(), "chart-b");

        assert!(registry.unsubscribe(&["sensors/+/temp"], "chart-a").is_empty());
        assert_eq!(
            registry.unsubscribe(&["sensors/+/temp"], "chart-b"),
            vec!["sensors/+/temp".to_string()]
        );
        // pattern is gone entirely, so a new consumer starts fresh
        assert_eq!(
            registry.subscribe(&["sensors/+/temp"], noop_handler(), "chart-c"),
            vec!["sensors/+/temp".to_string()]
        );
    }

    #[test]
    fn resubscribing_same_key_is_idempotent() {
        let mut registry = TopicRegistry::new();
        registry.subscribe(&["logs/#"], noop_handler(), "log-view");
        assert!(registry.subscribe(&["logs/#"], noop_handler(), "log-view").is_empty());

        // a single unsubscribe must fully deactivate the pattern
        assert_eq!(
            registry.unsubscribe(&["logs/#"], "log-view"),
            vec!["logs/#".to_string()]
        );
        assert!(registry.active_patterns().is_empty());
    }

    #[test]
    fn duplicate_patterns_in_one_call_count_once() {
        let mut registry = TopicRegistry::new();
        let active = registry.subscribe(&["a/b", "a/b", "a/b"], noop_handler(), "k");
        assert_eq!(active, vec!["a/b".to_string()]);
        assert_eq!(registry.unsubscribe(&["a/b"], "k"), vec!["a/b".to_string()]);
    }

    #[test]
    fn overlapping_wildcards_all_match() {
        let mut registry = TopicRegistry::new();
        let plus_hits = Arc::new(AtomicUsize::new(0));
        let hash_hits = Arc::new(AtomicUsize::new(0));
        registry.subscribe(&["a/+/c"], counting_handler(plus_hits.clone()), "plus");
        registry.subscribe(&["a/#"], counting_handler(hash_hits.clone()), "hash");

        registry.dispatch("a/b/c", b"1", &MessageMeta::default());
        assert_eq!(plus_hits.load(Ordering::SeqCst), 1);
        assert_eq!(hash_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hash_matches_zero_or_more_segments() {
        let mut registry = TopicRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.subscribe(&["x/#"], counting_handler(hits.clone()), "k");

        registry.dispatch("x", b"", &MessageMeta::default());
        registry.dispatch("x/y/z", b"", &MessageMeta::default());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn literal_pattern_requires_exact_depth() {
        let mut registry = TopicRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.subscribe(&["x/y"], counting_handler(hits.clone()), "k");

        registry.dispatch("x/y/z", b"", &MessageMeta::default());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        registry.dispatch("x/y", b"", &MessageMeta::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn literal_and_plus_both_receive() {
        let mut registry = TopicRegistry::new();
        let literal_hits = Arc::new(AtomicUsize::new(0));
        let plus_hits = Arc::new(AtomicUsize::new(0));
        registry.subscribe(&["a/b"], counting_handler(literal_hits.clone()), "lit");
        registry.subscribe(&["a/+"], counting_handler(plus_hits.clone()), "plus");

        registry.dispatch("a/b", b"", &MessageMeta::default());
        assert_eq!(literal_hits.load(Ordering::SeqCst), 1);
        assert_eq!(plus_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_does_not_starve_others() {
        let mut registry = TopicRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.subscribe(
            &["sensors/#"],
            Arc::new(|_, _, _| panic!("chart exploded")),
            "bad",
        );
        registry.subscribe(&["sensors/+/temp"], counting_handler(hits.clone()), "good");

        registry.dispatch("sensors/unit1/temp", b"21.5", &MessageMeta::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // trie is still intact afterwards
        registry.dispatch("sensors/unit1/temp", b"21.6", &MessageMeta::default());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn misplaced_hash_is_rejected_without_registration() {
        let mut registry = TopicRegistry::new();
        let active = registry.subscribe(&["a/#/b", "a/b"], noop_handler(), "k");
        assert_eq!(active, vec!["a/b".to_string()]);
        assert_eq!(registry.active_patterns(), vec!["a/b".to_string()]);
    }

    #[test]
    fn dispatch_without_matches_is_a_noop() {
        let mut registry = TopicRegistry::new();
        registry.subscribe(&["sensors/unit1/temp"], noop_handler(), "k");
        // other devices' traffic simply falls through
        registry.dispatch("sensors/unit2/ph", b"6.9", &MessageMeta::default());
    }

    #[test]
    fn handler_receives_topic_payload_and_meta() {
        let mut registry = TopicRegistry::new();
        let seen: Arc<Mutex<Vec<(String, Vec<u8>, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.subscribe(
            &["sensors/+/temp"],
            Arc::new(move |topic, payload, meta| {
                sink.lock()
                    .unwrap()
                    .push((topic.to_string(), payload.to_vec(), meta.retain));
            }),
            "chart",
        );

        registry.dispatch("sensors/unit1/temp", b"21.5", &MessageMeta { retain: true });
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![("sensors/unit1/temp".to_string(), b"21.5".to_vec(), true)]
        );
    }

    #[test]
    fn chart_end_to_end_lifecycle() {
        let mut registry = TopicRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.subscribe(&["sensors/+/temp"], counting_handler(hits.clone()), "Chart");

        registry.dispatch("sensors/unit1/temp", b"21.5", &MessageMeta::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        registry.unsubscribe(&["sensors/+/temp"], "Chart");
        registry.dispatch("sensors/unit1/temp", b"21.6", &MessageMeta::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
