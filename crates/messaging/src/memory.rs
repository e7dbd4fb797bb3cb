//! In-memory broker for tests and standalone runs.

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{Mutex, mpsc};

use crate::{
    EventEnvelope, InboundMessage, MessagePublisher, MessageSource, MessageStream, MessagingError,
    Result,
};

/// Default partition count per topic.
pub const DEFAULT_PARTITIONS: i32 = 8;

/// A message as recorded by the in-memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    fn to_inbound(&self) -> InboundMessage {
        InboundMessage {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
            key: Some(self.key.clone()),
            payload: self.payload.clone(),
        }
    }
}

struct Subscriber {
    topics: Vec<String>,
    sender: mpsc::UnboundedSender<Result<InboundMessage>>,
}

#[derive(Default)]
struct BrokerState {
    log: Vec<PublishedMessage>,
    next_offsets: HashMap<(String, i32), i64>,
    subscribers: Vec<Subscriber>,
    acked: Vec<(String, i32, i64)>,
    fail_next_publishes: usize,
}

/// Broker that keeps every topic in memory.
///
/// Keys hash to a fixed partition, so per-key ordering matches a real broker.
/// New subscribers first receive the existing log for their topics, like a
/// consumer group starting from the earliest offset.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    partitions: i32,
}

impl InMemoryBroker {
    /// Creates a broker with [`DEFAULT_PARTITIONS`] partitions per topic.
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Creates a broker with a custom partition count.
    pub fn with_partitions(partitions: i32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            partitions: partitions.max(1),
        }
    }

    /// Returns the partition a key is assigned to.
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }

    /// Makes the next `count` publishes fail with a retryable error.
    pub async fn fail_next_publishes(&self, count: usize) {
        self.state.lock().await.fail_next_publishes = count;
    }

    /// Returns every message published to a topic, in publish order.
    pub async fn published(&self, topic: &str) -> Vec<PublishedMessage> {
        let state = self.state.lock().await;
        state
            .log
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Returns the decodable envelopes published to a topic.
    pub async fn published_envelopes(&self, topic: &str) -> Vec<EventEnvelope> {
        self.published(topic)
            .await
            .iter()
            .filter_map(|m| EventEnvelope::from_bytes(&m.payload).ok())
            .collect()
    }

    /// Returns every message published to any topic.
    pub async fn all_published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.log.clone()
    }

    /// Returns how many messages have been acknowledged.
    pub async fn acked_count(&self) -> usize {
        self.state.lock().await.acked.len()
    }

    /// Publishes an envelope to a topic, keyed by its saga key when present.
    pub async fn inject(&self, topic: &str, event: &EventEnvelope) -> Result<()> {
        let key = event
            .saga_key()
            .map(|k| k.to_string())
            .unwrap_or_else(|_| event.event_id.to_string());
        self.publish(topic, &key, &event.to_bytes()?).await
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let partition = self.partition_for(key);
        let mut state = self.state.lock().await;

        if state.fail_next_publishes > 0 {
            state.fail_next_publishes -= 1;
            return Err(MessagingError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let next_offset = state
            .next_offsets
            .entry((topic.to_string(), partition))
            .or_insert(0);
        let offset = *next_offset;
        *next_offset += 1;

        let message = PublishedMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            partition,
            offset,
            payload: payload.to_vec(),
        };

        state.subscribers.retain(|sub| {
            if !sub.topics.iter().any(|t| t == topic) {
                return true;
            }
            sub.sender.send(Ok(message.to_inbound())).is_ok()
        });
        state.log.push(message);

        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryBroker {
    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;

        for message in state.log.iter().filter(|m| topics.contains(&m.topic)) {
            // The receiver is alive in this scope.
            let _ = sender.send(Ok(message.to_inbound()));
        }
        state.subscribers.push(Subscriber {
            topics: topics.to_vec(),
            sender,
        });

        let stream = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(Box::pin(stream))
    }

    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        self.state.lock().await.acked.push((
            message.topic.clone(),
            message.partition,
            message.offset,
        ));
        Ok(())
    }
}
