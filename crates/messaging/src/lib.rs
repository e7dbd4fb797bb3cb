//! Message broker plumbing for the saga orchestrator.
//!
//! This crate provides everything between the broker and the orchestrator:
//! - [`EventEnvelope`], the JSON wire envelope shared by triggers, commands and results
//! - [`EventProducer`], which maps event types to topics and publishes keyed by saga
//! - [`EventConsumer`], which fans messages out to one sequential worker per
//!   partition, deduplicates by event ID, retries and dead-letters
//! - [`InMemoryBroker`] for tests and standalone runs, and Kafka adapters for production

pub mod consumer;
pub mod dedup;
pub mod dlq;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod kafka;
pub mod memory;
pub mod publisher;
pub mod retry;
pub mod source;
pub mod topics;

pub use consumer::{ConsumerConfig, Disposition, EventConsumer, PartitionWorker};
pub use dedup::DedupCache;
pub use dlq::{DeadLetter, DeadLetterSink};
pub use envelope::EventEnvelope;
pub use error::{MessagingError, Result};
pub use handler::{EventHandler, HandlerError};
pub use kafka::{KafkaConfig, KafkaPublisher, KafkaSource};
pub use memory::{InMemoryBroker, PublishedMessage};
pub use publisher::{EventEmitter, EventProducer, MessagePublisher};
pub use source::{InboundMessage, MessageSource, MessageStream};
pub use topics::TopicMap;
