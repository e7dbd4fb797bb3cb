//! Messaging error types.

use common::EventId;
use thiserror::Error;

/// Errors that can occur while talking to the broker.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// Publishing a message failed.
    #[error("Failed to publish to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribing to topics failed.
    #[error("Failed to subscribe to {topics:?}: {reason}")]
    Subscribe { topics: Vec<String>, reason: String },

    /// A message payload was not a valid event envelope.
    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    /// The envelope's data carries neither `saga_key` nor `booking_id`.
    #[error("Event {event_id} carries no saga key")]
    MissingSagaKey { event_id: EventId },

    /// Committing a consumed message failed.
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Could not reach or configure the broker.
    #[error("Broker connection error: {0}")]
    Connection(String),
}

impl MessagingError {
    /// Returns true if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessagingError::Publish { .. } | MessagingError::Connection(_)
        )
    }
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
