//! The trait consumers deliver decoded envelopes to.

use async_trait::async_trait;
use thiserror::Error;

use crate::EventEnvelope;

/// How a handler failed, which decides what the consumer does next.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient failure such as a store outage or CAS contention.
    /// The consumer redelivers with backoff, then dead-letters.
    #[error("retryable handler failure: {0}")]
    Retryable(String),

    /// The message can never be processed (unknown type, missing fields).
    /// The consumer logs it and moves on.
    #[error("malformed event: {0}")]
    Structural(String),

    /// Processing failed in a way retries cannot fix.
    /// The consumer dead-letters immediately.
    #[error("permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    /// Returns true if redelivery may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}

/// Receives every envelope a consumer decodes.
///
/// Handlers are called sequentially per partition, so events for one saga
/// key never race each other inside a single consumer.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs, metrics and dead-letter records.
    fn name(&self) -> &'static str;

    /// Handles a single event.
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: EventHandler + ?Sized> EventHandler for std::sync::Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        (**self).handle(event).await
    }
}
