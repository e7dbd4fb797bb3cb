//! Mapping from event types to broker topics.

use std::collections::HashMap;

/// Suffix appended to a topic to form its dead-letter topic.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Resolves the topic an event type is published to.
///
/// By default `payment.succeeded` under prefix `booking` maps to
/// `booking.payment.succeeded`. Individual event types can be overridden.
#[derive(Debug, Clone)]
pub struct TopicMap {
    prefix: String,
    overrides: HashMap<String, String>,
}

impl TopicMap {
    /// Creates a map that prefixes every event type.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            overrides: HashMap::new(),
        }
    }

    /// Routes one event type to an explicit topic.
    pub fn with_override(mut self, event_type: impl Into<String>, topic: impl Into<String>) -> Self {
        self.overrides.insert(event_type.into(), topic.into());
        self
    }

    /// Returns the topic prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns the topic for an event type.
    pub fn topic_for(&self, event_type: &str) -> String {
        match self.overrides.get(event_type) {
            Some(topic) => topic.clone(),
            None if self.prefix.is_empty() => event_type.to_string(),
            None => format!("{}.{}", self.prefix, event_type),
        }
    }

    /// Returns the topics for a set of event types, deduplicated in order.
    pub fn topics_for<'a>(&self, event_types: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for event_type in event_types {
            let topic = self.topic_for(event_type);
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        topics
    }

    /// Returns the dead-letter topic for a source topic.
    pub fn dead_letter_topic(topic: &str) -> String {
        format!("{topic}{DEAD_LETTER_SUFFIX}")
    }
}

impl Default for TopicMap {
    fn default() -> Self {
        Self::new("booking")
    }
}
