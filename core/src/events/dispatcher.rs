// Copyright 2023 The Hive Project
// SPDX-License-Identifier: BSD-3-Clause

//! Local pattern matching and dispatch.
//!
//! Patterns are dotted words with two wildcards: `*` matches exactly one word, `#` matches zero
//! or more dotted words. They compile to anchored regular expressions. A handler registered
//! under several patterns matching the same event is returned at most once.

use std::sync::{Arc, Mutex};

use regex::Regex;

use crate::events::{EventError, EventHandlerBinding};

struct Entry {
    regex: Regex,
    pattern: String,
    handler: Arc<EventHandlerBinding>,
}

/// Compile an event-type pattern into an anchored regex.
pub fn compile_pattern(pattern: &str) -> Result<Regex, EventError> {
    let words: Vec<String> = pattern
        .split('.')
        .map(|word| match word {
            "#" => r"[\w.]*".to_string(),
            "*" => r"\w+".to_string(),
            word => regex::escape(word),
        })
        .collect();
    Regex::new(&format!("^{}$", words.join(r"\.")))
        .map_err(|e| EventError::InvalidPattern(pattern.to_string(), e.to_string()))
}

#[derive(Default)]
pub struct EventDispatcher {
    entries: Mutex<Vec<Entry>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register a handler under every one of its patterns.
    pub fn register(&self, handler: &Arc<EventHandlerBinding>) -> Result<(), EventError> {
        let mut compiled = Vec::with_capacity(handler.patterns().len());
        for pattern in handler.patterns() {
            compiled.push(Entry {
                regex: compile_pattern(pattern)?,
                pattern: pattern.clone(),
                handler: Arc::clone(handler),
            });
        }
        self.entries
            .lock()
            .expect("dispatcher entries lock poisoned")
            .extend(compiled);
        Ok(())
    }

    /// Remove every registration of `handler`. Returns whether any entry was removed.
    pub fn remove(&self, handler: &Arc<EventHandlerBinding>) -> bool {
        let mut entries = self.entries.lock().expect("dispatcher entries lock poisoned");
        let before = entries.len();
        entries.retain(|entry| !Arc::ptr_eq(&entry.handler, handler));
        entries.len() != before
    }

    /// Handlers whose patterns match `event_type`, each at most once.
    pub fn matching(&self, event_type: &str) -> Vec<Arc<EventHandlerBinding>> {
        let entries = self.entries.lock().expect("dispatcher entries lock poisoned");
        let mut seen: Vec<*const EventHandlerBinding> = Vec::new();
        let mut matched = Vec::new();
        for entry in entries.iter() {
            if !entry.regex.is_match(event_type) {
                continue;
            }
            let ptr = Arc::as_ptr(&entry.handler);
            if seen.contains(&ptr) {
                continue;
            }
            seen.push(ptr);
            matched.push(Arc::clone(&entry.handler));
        }
        matched
    }

    pub fn patterns(&self) -> Vec<String> {
        let entries = self.entries.lock().expect("dispatcher entries lock poisoned");
        entries.iter().map(|entry| entry.pattern.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("dispatcher entries lock poisoned").is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::events::{EventFlags, EventHandlerFn};

    fn handler(name: &str, patterns: &[&str]) -> Arc<EventHandlerBinding> {
        let f: EventHandlerFn = Arc::new(|_| Box::pin(async { Ok(()) }));
        EventHandlerBinding::new(
            "test",
            name,
            patterns.iter().map(ToString::to_string).collect(),
            EventFlags::default(),
            f,
        )
        .unwrap()
    }

    #[test]
    fn wildcard_table() {
        let dispatcher = EventDispatcher::new();
        let mut by_pattern = HashMap::new();
        for pattern in ["foo", "#", "*", "foo.*", "foo.#"] {
            let binding = handler(pattern, &[pattern]);
            dispatcher.register(&binding).unwrap();
            by_pattern.insert(pattern, binding);
        }

        let matched_patterns = |event_type: &str| {
            let mut names: Vec<&str> = dispatcher
                .matching(event_type)
                .into_iter()
                .map(|b| {
                    by_pattern
                        .iter()
                        .find(|(_, v)| Arc::ptr_eq(v, &b))
                        .map(|(k, _)| *k)
                        .unwrap()
                })
                .collect();
            names.sort_unstable();
            names
        };

        assert_eq!(matched_patterns("foo"), vec!["#", "*", "foo"]);
        assert_eq!(matched_patterns("foo.bar"), vec!["#", "foo.#", "foo.*"]);
        assert_eq!(matched_patterns("foo.bar.baz"), vec!["#", "foo.#"]);
        assert_eq!(matched_patterns(""), vec!["#"]);
    }

    #[test]
    fn handler_under_multiple_matching_patterns_returned_once() {
        let dispatcher = EventDispatcher::new();
        let binding = handler("multi", &["foo", "foo.#", "#"]);
        dispatcher.register(&binding).unwrap();
        assert_eq!(dispatcher.matching("foo").len(), 1);
    }

    #[test]
    fn remove_unregisters_all_patterns() {
        let dispatcher = EventDispatcher::new();
        let binding = handler("multi", &["foo", "#"]);
        dispatcher.register(&binding).unwrap();
        assert!(dispatcher.remove(&binding));
        assert!(dispatcher.matching("foo").is_empty());
        assert!(!dispatcher.remove(&binding));
    }

    #[test]
    fn literal_dots_do_not_match_wildcards() {
        let dispatcher = EventDispatcher::new();
        let binding = handler("exact", &["foo.bar"]);
        dispatcher.register(&binding).unwrap();
        assert_eq!(dispatcher.matching("foo.bar").len(), 1);
        assert!(dispatcher.matching("fooxbar").is_empty());
        assert!(dispatcher.matching("foo").is_empty());
    }
}
