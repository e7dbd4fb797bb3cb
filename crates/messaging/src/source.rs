//! Inbound side of the broker abstraction.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::Result;

/// A raw message read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    /// Returns which of `workers` partition workers owns this message.
    pub fn worker_slot(&self, workers: usize) -> usize {
        let workers = workers.max(1) as i64;
        (self.partition as i64).rem_euclid(workers) as usize
    }
}

/// Stream of inbound messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<InboundMessage>> + Send>>;

/// A broker the consumer can read from.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Subscribes to topics and returns the message stream.
    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream>;

    /// Marks a message as processed so it is not redelivered.
    async fn ack(&self, message: &InboundMessage) -> Result<()>;
}

#[async_trait]
impl<T: MessageSource + ?Sized> MessageSource for std::sync::Arc<T> {
    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream> {
        (**self).subscribe(topics).await
    }

    async fn ack(&self, message: &InboundMessage) -> Result<()> {
        (**self).ack(message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(partition: i32) -> InboundMessage {
        InboundMessage {
            topic: "t".to_string(),
            partition,
            offset: 0,
            key: None,
            payload: Vec::new(),
        }
    }

    #[test]
    fn worker_slot_is_partition_modulo_workers() {
        assert_eq!(message(0).worker_slot(4), 0);
        assert_eq!(message(5).worker_slot(4), 1);
        assert_eq!(message(7).worker_slot(1), 0);
        assert_eq!(message(3).worker_slot(0), 0);
    }
}
