//! Outbound side of the broker abstraction.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use common::SagaKey;

use crate::{EventEnvelope, MessagingError, Result, TopicMap, retry};

/// Raw keyed publish to a topic.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes one message. The key decides the partition.
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

#[async_trait]
impl<T: MessagePublisher + ?Sized> MessagePublisher for std::sync::Arc<T> {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        (**self).publish(topic, key, payload).await
    }
}

/// Emits saga commands and events, keyed by saga so that everything for one
/// saga lands on one partition.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// Emits an event. An error means the event may not have been delivered.
    async fn emit(&self, key: &SagaKey, event: &EventEnvelope) -> Result<()>;
}

#[async_trait]
impl<T: EventEmitter + ?Sized> EventEmitter for std::sync::Arc<T> {
    async fn emit(&self, key: &SagaKey, event: &EventEnvelope) -> Result<()> {
        (**self).emit(key, event).await
    }
}

/// [`EventEmitter`] that resolves topics from a [`TopicMap`] and retries
/// transient publish failures with exponential backoff.
pub struct EventProducer<P> {
    publisher: P,
    topics: TopicMap,
    backoff: ExponentialBuilder,
}

impl<P: MessagePublisher> EventProducer<P> {
    /// Creates a producer with the default publish backoff.
    pub fn new(publisher: P, topics: TopicMap) -> Self {
        Self {
            publisher,
            topics,
            backoff: retry::publish_backoff(),
        }
    }

    /// Overrides the publish backoff.
    pub fn with_backoff(mut self, backoff: ExponentialBuilder) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns the topic map.
    pub fn topics(&self) -> &TopicMap {
        &self.topics
    }
}

#[async_trait]
impl<P: MessagePublisher> EventEmitter for EventProducer<P> {
    #[tracing::instrument(
        skip(self, event),
        fields(saga_key = %key, event_type = %event.event_type, event_id = %event.event_id)
    )]
    async fn emit(&self, key: &SagaKey, event: &EventEnvelope) -> Result<()> {
        let topic = self.topics.topic_for(&event.event_type);
        let payload = event.to_bytes()?;

        let publisher = &self.publisher;
        let topic_ref = topic.as_str();
        let payload_ref = payload.as_slice();
        let result = (|| async move { publisher.publish(topic_ref, key.as_str(), payload_ref).await })
            .retry(self.backoff)
            .when(MessagingError::is_retryable)
            .notify(|err: &MessagingError, delay| {
                tracing::warn!(error = %err, delay = ?delay, topic = %topic_ref, "publish failed, retrying");
            })
            .await;

        match &result {
            Ok(()) => tracing::debug!(topic = %topic, "event emitted"),
            Err(err) => {
                metrics::counter!("producer_publish_failures_total").increment(1);
                tracing::error!(error = %err, topic = %topic, "giving up on publish");
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;
    use std::time::Duration;

    fn fast_backoff() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
            .with_max_times(3)
    }

    #[tokio::test]
    async fn emits_to_mapped_topic_keyed_by_saga() {
        let broker = InMemoryBroker::new();
        let producer = EventProducer::new(broker.clone(), TopicMap::new("booking"));
        let key = SagaKey::new("b-1");

        let event = EventEnvelope::new("seats.reserve", serde_json::json!({"saga_key": "b-1"}));
        producer.emit(&key, &event).await.unwrap();

        let published = broker.published("booking.seats.reserve").await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, "b-1");
        assert_eq!(
            EventEnvelope::from_bytes(&published[0].payload).unwrap(),
            event
        );
    }

    #[tokio::test]
    async fn retries_transient_publish_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(2).await;
        let producer =
            EventProducer::new(broker.clone(), TopicMap::new("booking")).with_backoff(fast_backoff());

        let event = EventEnvelope::new("seats.reserve", serde_json::json!({}));
        producer.emit(&SagaKey::new("b-1"), &event).await.unwrap();

        assert_eq!(broker.published("booking.seats.reserve").await.len(), 1);
    }

    #[tokio::test]
    async fn surfaces_error_once_retries_are_exhausted() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(10).await;
        let producer =
            EventProducer::new(broker.clone(), TopicMap::new("booking")).with_backoff(fast_backoff());

        let event = EventEnvelope::new("seats.reserve", serde_json::json!({}));
        let result = producer.emit(&SagaKey::new("b-1"), &event).await;

        assert!(matches!(result, Err(MessagingError::Publish { .. })));
        assert!(broker.published("booking.seats.reserve").await.is_empty());
    }
}
