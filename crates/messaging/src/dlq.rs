//! Dead-letter routing for messages a consumer could not process.
//!
//! A message from topic `t` is republished to `t.dlq`, keyed like the
//! original, wrapped in a [`DeadLetter`] record describing the failure.

use std::sync::Arc;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{InboundMessage, MessagePublisher, MessagingError, Result, TopicMap, retry};

/// A failed message plus why and where it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// Handler that gave up on the message.
    pub consumer: String,
    pub reason: String,
    /// Delivery attempts made before giving up.
    pub attempts: u32,
    /// Whether the last failure looked transient.
    pub is_transient: bool,
    pub failed_at: DateTime<Utc>,
    /// Original payload, lossily decoded as UTF-8.
    pub payload: String,
}

impl DeadLetter {
    /// Builds a dead letter for an inbound message.
    pub fn from_message(
        message: &InboundMessage,
        consumer: &str,
        reason: impl Into<String>,
        attempts: u32,
        is_transient: bool,
    ) -> Self {
        Self {
            source_topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            key: message.key.clone(),
            consumer: consumer.to_string(),
            reason: reason.into(),
            attempts,
            is_transient,
            failed_at: Utc::now(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
        }
    }

    /// Topic this letter is published to.
    pub fn topic(&self) -> String {
        TopicMap::dead_letter_topic(&self.source_topic)
    }
}

/// Publishes [`DeadLetter`]s to `{topic}.dlq`.
#[derive(Clone)]
pub struct DeadLetterSink {
    publisher: Arc<dyn MessagePublisher>,
    backoff: ExponentialBuilder,
}

impl DeadLetterSink {
    pub fn new(publisher: Arc<dyn MessagePublisher>) -> Self {
        Self {
            publisher,
            backoff: retry::publish_backoff(),
        }
    }

    /// Overrides the publish backoff.
    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    #[tracing::instrument(skip(self, letter), fields(source_topic = %letter.source_topic, offset = letter.offset))]
    pub async fn publish(&self, letter: &DeadLetter) -> Result<()> {
        let topic = letter.topic();
        let key = letter.key.clone().unwrap_or_default();
        let payload = serde_json::to_vec(letter)?;

        let publisher = &self.publisher;
        let (topic_ref, key_ref, payload_ref) = (topic.as_str(), key.as_str(), payload.as_slice());
        (|| async move { publisher.publish(topic_ref, key_ref, payload_ref).await })
            .retry(self.backoff)
            .when(MessagingError::is_retryable)
            .await?;

        metrics::counter!("consumer_dead_letters_total", "consumer" => letter.consumer.clone())
            .increment(1);
        tracing::warn!(topic = %topic, reason = %letter.reason, "message dead-lettered");
        Ok(())
    }
}
