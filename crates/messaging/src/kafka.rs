//! Kafka-compatible broker adapters built on `rdkafka`.
//!
//! Offsets are committed manually, and only after the consumer acknowledges a
//! message, giving at-least-once delivery. A crash between handling and
//! commit causes a redelivery, which the consumer's dedup cache and the
//! orchestrator's stale-result checks absorb.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use tokio::sync::mpsc;

use crate::{
    InboundMessage, MessagePublisher, MessageSource, MessageStream, MessagingError, Result,
};

/// Connection settings shared by the producer and consumer.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers.
    pub brokers: String,
    pub group_id: String,
    /// Where a new consumer group starts reading: `earliest` or `latest`.
    pub auto_offset_reset: String,
    pub producer_acks: String,
    pub send_timeout: Duration,
    pub buffer_size: usize,
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            group_id: group_id.into(),
            auto_offset_reset: "earliest".to_string(),
            producer_acks: "all".to_string(),
            send_timeout: Duration::from_secs(5),
            buffer_size: 1000,
        }
    }
}

/// Publishes to Kafka with a [`FutureProducer`].
pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.send_timeout.as_millis().to_string())
            .set("acks", &config.producer_acks)
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| MessagingError::Connection(format!("failed to create producer: {e}")))?;

        Ok(Self {
            producer,
            timeout: config.send_timeout,
        })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic).payload(payload).key(key);

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok(delivery) => {
                tracing::trace!(topic, ?delivery, "message delivered");
                Ok(())
            }
            Err((kafka_error, _)) => Err(MessagingError::Publish {
                topic: topic.to_string(),
                reason: kafka_error.to_string(),
            }),
        }
    }
}

/// Reads from Kafka with a [`StreamConsumer`] in a consumer group.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    buffer_size: usize,
}

impl KafkaSource {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| MessagingError::Connection(format!("failed to create consumer: {e}")))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            buffer_size: config.buffer_size.max(1),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream> {
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topic_refs)
            .map_err(|e| MessagingError::Subscribe {
                topics: topics.to_vec(),
                reason: e.to_string(),
            })?;

        tracing::info!(?topics, "subscribed to kafka topics");

        let (tx, mut rx) = mpsc::channel(self.buffer_size);
        let consumer = Arc::clone(&self.consumer);
        tokio::spawn(async move {
            let mut stream = consumer.stream();
            while let Some(received) = stream.next().await {
                let item = received
                    .map(|message| InboundMessage {
                        topic: message.topic().to_string(),
                        partition: message.partition(),
                        offset: message.offset(),
                        key: message
                            .key()
                            .map(|k| String::from_utf8_lossy(k).into_owned()),
                        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    })
                    .map_err(|e| MessagingError::Connection(format!("receive failed: {e}")));

                if tx.send(item).await.is_err() {
                    tracing::debug!("message stream dropped, stopping kafka reader");
                    break;
                }
            }
        });

        let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
        Ok(Box::pin(stream))
    }

    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))
            .map_err(|e| MessagingError::Ack(e.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| MessagingError::Ack(e.to_string()))
    }
}
