//! Partitioned event consumer.
//!
//! One reader task pulls from the [`MessageSource`] and hands each message to
//! the worker owning `partition % partition_workers`. Workers process their
//! queue strictly in order, so events for one saga key never interleave.
//! A message is acknowledged only after the handler has finished with it
//! (handled, skipped or dead-lettered).

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::{
    DeadLetter, DeadLetterSink, DedupCache, EventEnvelope, EventHandler, HandlerError,
    InboundMessage, MessageSource, Result, retry,
};

/// Consumer tuning knobs.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub topics: Vec<String>,
    pub partition_workers: usize,
    /// Total deliveries of a retryable failure before dead-lettering.
    pub max_delivery_attempts: usize,
    pub retry_min_delay: Duration,
    pub retry_max_delay: Duration,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    /// Per-worker queue depth; a full queue applies backpressure to the reader.
    pub worker_queue: usize,
}

impl ConsumerConfig {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            topics,
            ..Self::default()
        }
    }

    fn delivery_backoff(&self) -> ExponentialBuilder {
        retry::delivery_backoff(
            self.max_delivery_attempts,
            self.retry_min_delay,
            self.retry_max_delay,
        )
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topics: Vec::new(),
            partition_workers: 8,
            max_delivery_attempts: 5,
            retry_min_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(600),
            worker_queue: 64,
        }
    }
}

/// What happened to a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The handler succeeded.
    Handled,
    /// The event ID was processed recently.
    Duplicate,
    /// The message was undecodable or structurally invalid.
    Skipped,
    /// The message was moved to the dead-letter topic.
    DeadLettered,
    /// Dead-lettering itself failed; the message is logged and dropped.
    Abandoned,
}

impl Disposition {
    fn as_str(&self) -> &'static str {
        match self {
            Disposition::Handled => "handled",
            Disposition::Duplicate => "duplicate",
            Disposition::Skipped => "skipped",
            Disposition::DeadLettered => "dead_lettered",
            Disposition::Abandoned => "abandoned",
        }
    }
}

/// Sequentially processes the messages of the partitions assigned to it.
pub struct PartitionWorker<H> {
    id: usize,
    handler: Arc<H>,
    dead_letters: DeadLetterSink,
    dedup: DedupCache,
    backoff: ExponentialBuilder,
}

impl<H: EventHandler> PartitionWorker<H> {
    pub fn new(
        id: usize,
        handler: Arc<H>,
        dead_letters: DeadLetterSink,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            id,
            handler,
            dead_letters,
            dedup: DedupCache::new(config.dedup_capacity, config.dedup_ttl),
            backoff: config.delivery_backoff(),
        }
    }

    /// Decodes, deduplicates and handles one message.
    #[tracing::instrument(
        skip(self, message),
        fields(worker = self.id, topic = %message.topic, partition = message.partition, offset = message.offset)
    )]
    pub async fn process(&mut self, message: &InboundMessage) -> Disposition {
        let disposition = self.dispatch(message).await;
        metrics::counter!(
            "consumer_messages_total",
            "handler" => self.handler.name(),
            "disposition" => disposition.as_str()
        )
        .increment(1);
        disposition
    }

    async fn dispatch(&mut self, message: &InboundMessage) -> Disposition {
        let envelope = match EventEnvelope::from_bytes(&message.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "skipping undecodable message");
                return Disposition::Skipped;
            }
        };

        if self.dedup.contains(&envelope.event_id) {
            metrics::counter!("consumer_duplicates_total").increment(1);
            tracing::debug!(event_id = %envelope.event_id, "duplicate event ignored");
            return Disposition::Duplicate;
        }

        let attempts = AtomicU32::new(0);
        let result = {
            let (handler, envelope, attempts) = (&self.handler, &envelope, &attempts);
            (|| async move {
                attempts.fetch_add(1, Ordering::Relaxed);
                handler.handle(envelope).await
            })
            .retry(self.backoff)
            .when(HandlerError::is_retryable)
            .notify(|err: &HandlerError, delay| {
                tracing::warn!(error = %err, delay = ?delay, "handler failed, redelivering");
            })
            .await
        };

        let disposition = match result {
            Ok(()) => Disposition::Handled,
            Err(HandlerError::Structural(reason)) => {
                tracing::warn!(event_id = %envelope.event_id, event_type = %envelope.event_type, %reason, "skipping malformed event");
                Disposition::Skipped
            }
            Err(err) => {
                let letter = DeadLetter::from_message(
                    message,
                    self.handler.name(),
                    err.to_string(),
                    attempts.load(Ordering::Relaxed),
                    err.is_retryable(),
                );
                match self.dead_letters.publish(&letter).await {
                    Ok(()) => Disposition::DeadLettered,
                    Err(publish_err) => {
                        tracing::error!(
                            event_id = %envelope.event_id,
                            error = %err,
                            dlq_error = %publish_err,
                            "failed to dead-letter message"
                        );
                        Disposition::Abandoned
                    }
                }
            }
        };

        self.dedup.insert(envelope.event_id);
        disposition
    }
}

/// Consumes topics from a [`MessageSource`] and feeds an [`EventHandler`].
pub struct EventConsumer<S, H> {
    source: Arc<S>,
    handler: Arc<H>,
    dead_letters: DeadLetterSink,
    config: ConsumerConfig,
}

impl<S, H> EventConsumer<S, H>
where
    S: MessageSource + 'static,
    H: EventHandler + 'static,
{
    pub fn new(
        source: Arc<S>,
        handler: Arc<H>,
        dead_letters: DeadLetterSink,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            source,
            handler,
            dead_letters,
            config,
        }
    }

    /// Runs until the stream ends or `shutdown` flips to true.
    ///
    /// In-flight messages already queued to workers are drained before
    /// returning.
    #[tracing::instrument(skip(self, shutdown), fields(handler = self.handler.name()))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut stream = self.source.subscribe(&self.config.topics).await?;
        let worker_count = self.config.partition_workers.max(1);

        let mut workers = JoinSet::new();
        let mut queues = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let (tx, rx) = mpsc::channel(self.config.worker_queue.max(1));
            let worker = PartitionWorker::new(
                id,
                Arc::clone(&self.handler),
                self.dead_letters.clone(),
                &self.config,
            );
            workers.spawn(worker_loop(worker, Arc::clone(&self.source), rx));
            queues.push(tx);
        }

        tracing::info!(topics = ?self.config.topics, workers = worker_count, "consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                next = stream.next() => match next {
                    Some(Ok(message)) => {
                        let slot = message.worker_slot(worker_count);
                        if queues[slot].send(message).await.is_err() {
                            tracing::error!(worker = slot, "partition worker stopped");
                            break;
                        }
                    }
                    Some(Err(err)) => tracing::warn!(error = %err, "error reading from broker"),
                    None => break,
                },
            }
        }

        drop(queues);
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "partition worker panicked");
            }
        }

        tracing::info!("consumer stopped");
        Ok(())
    }
}

async fn worker_loop<S, H>(
    mut worker: PartitionWorker<H>,
    source: Arc<S>,
    mut queue: mpsc::Receiver<InboundMessage>,
) where
    S: MessageSource,
    H: EventHandler,
{
    while let Some(message) = queue.recv().await {
        worker.process(&message).await;
        if let Err(err) = source.ack(&message).await {
            tracing::warn!(error = %err, offset = message.offset, "failed to acknowledge message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct ScriptedHandler {
        calls: Mutex<u32>,
        failures: Vec<HandlerError>,
    }

    impl ScriptedHandler {
        fn failing_with(failures: Vec<HandlerError>) -> Self {
            Self {
                calls: Mutex::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl EventHandler for ScriptedHandler {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn handle(&self, _event: &EventEnvelope) -> std::result::Result<(), HandlerError> {
            let mut calls = self.calls.lock().await;
            let call = *calls as usize;
            *calls += 1;
            match self.failures.get(call) {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig {
            max_delivery_attempts: 3,
            retry_min_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(2),
            ..ConsumerConfig::new(vec!["t".to_string()])
        }
    }

    fn message_for(envelope: &EventEnvelope) -> InboundMessage {
        InboundMessage {
            topic: "t".to_string(),
            partition: 0,
            offset: 7,
            key: Some("b-1".to_string()),
            payload: envelope.to_bytes().unwrap(),
        }
    }

    fn worker(handler: ScriptedHandler, broker: &InMemoryBroker) -> PartitionWorker<ScriptedHandler> {
        let sink = DeadLetterSink::new(Arc::new(broker.clone()));
        PartitionWorker::new(0, Arc::new(handler), sink, &config())
    }

    #[tokio::test]
    async fn duplicate_event_ids_are_handled_once() {
        let broker = InMemoryBroker::new();
        let mut worker = worker(ScriptedHandler::failing_with(vec![]), &broker);
        let envelope = EventEnvelope::new("x", serde_json::json!({"booking_id": "b-1"}));

        assert_eq!(worker.process(&message_for(&envelope)).await, Disposition::Handled);
        assert_eq!(worker.process(&message_for(&envelope)).await, Disposition::Duplicate);
        assert_eq!(*worker.handler.calls.lock().await, 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let broker = InMemoryBroker::new();
        let failures = vec![HandlerError::Retryable("db down".into())];
        let mut worker = worker(ScriptedHandler::failing_with(failures), &broker);
        let envelope = EventEnvelope::new("x", serde_json::json!({}));

        assert_eq!(worker.process(&message_for(&envelope)).await, Disposition::Handled);
        assert_eq!(*worker.handler.calls.lock().await, 2);
        assert!(broker.published("t.dlq").await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_go_to_dead_letter_topic() {
        let broker = InMemoryBroker::new();
        let failures = vec![HandlerError::Retryable("db down".into()); 10];
        let mut worker = worker(ScriptedHandler::failing_with(failures), &broker);
        let envelope = EventEnvelope::new("x", serde_json::json!({}));

        assert_eq!(
            worker.process(&message_for(&envelope)).await,
            Disposition::DeadLettered
        );
        assert_eq!(*worker.handler.calls.lock().await, 3);

        let letters = broker.published("t.dlq").await;
        assert_eq!(letters.len(), 1);
        let letter: DeadLetter = serde_json::from_slice(&letters[0].payload).unwrap();
        assert_eq!(letter.attempts, 3);
        assert!(letter.is_transient);
        assert_eq!(letter.offset, 7);
    }

    #[tokio::test]
    async fn permanent_failures_skip_retries() {
        let broker = InMemoryBroker::new();
        let failures = vec![HandlerError::Permanent("bad state".into())];
        let mut worker = worker(ScriptedHandler::failing_with(failures), &broker);
        let envelope = EventEnvelope::new("x", serde_json::json!({}));

        assert_eq!(
            worker.process(&message_for(&envelope)).await,
            Disposition::DeadLettered
        );
        assert_eq!(*worker.handler.calls.lock().await, 1);
    }

    #[tokio::test]
    async fn structural_failures_and_garbage_are_skipped() {
        let broker = InMemoryBroker::new();
        let failures = vec![HandlerError::Structural("unknown type".into())];
        let mut worker = worker(ScriptedHandler::failing_with(failures), &broker);
        let envelope = EventEnvelope::new("x", serde_json::json!({}));

        assert_eq!(worker.process(&message_for(&envelope)).await, Disposition::Skipped);

        let mut garbage = message_for(&envelope);
        garbage.payload = b"not json".to_vec();
        assert_eq!(worker.process(&garbage).await, Disposition::Skipped);
        assert!(broker.published("t.dlq").await.is_empty());
    }
}
