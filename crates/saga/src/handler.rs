//! Bridges the consumer to the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use messaging::{EventEmitter, EventEnvelope, EventHandler, HandlerError};
use saga_store::{SagaStore, SagaStoreError};

use crate::events::InboundEvent;
use crate::triggers::TriggerBindings;
use crate::{Orchestrator, SagaError};

/// Decodes inbound events and dispatches them to the orchestrator.
///
/// Stale results and starts of finished sagas are expected under
/// redelivery and succeed without effect. Everything else is classified for
/// the consumer: transient errors are retried, malformed events skipped.
pub struct SagaEventHandler<S, E> {
    orchestrator: Arc<Orchestrator<S, E>>,
    triggers: TriggerBindings,
}

impl<S, E> SagaEventHandler<S, E>
where
    S: SagaStore,
    E: EventEmitter,
{
    pub fn new(orchestrator: Arc<Orchestrator<S, E>>, triggers: TriggerBindings) -> Self {
        Self {
            orchestrator,
            triggers,
        }
    }

    async fn dispatch(&self, event: InboundEvent) -> Result<(), SagaError> {
        match event {
            InboundEvent::Start(start) => {
                self.orchestrator
                    .start_saga(&start.definition, start.saga_key, start.payload)
                    .await?;
            }
            InboundEvent::StepResult(result) => {
                self.orchestrator.handle_step_result(&result).await?;
            }
            InboundEvent::CompensationResult(result) => {
                self.orchestrator.handle_compensation_result(&result).await?;
            }
            InboundEvent::Unknown { event_type } => {
                tracing::warn!(%event_type, "no handler bound to event type");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S, E> EventHandler for SagaEventHandler<S, E>
where
    S: SagaStore,
    E: EventEmitter,
{
    fn name(&self) -> &'static str {
        "saga-orchestrator"
    }

    #[tracing::instrument(skip(self, event), fields(event_id = %event.event_id, event_type = %event.event_type))]
    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let inbound = InboundEvent::decode(event, &self.triggers).map_err(classify)?;
        match self.dispatch(inbound).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_benign() => {
                tracing::debug!(error = %err, "event had no effect");
                Ok(())
            }
            Err(err) => Err(classify(err)),
        }
    }
}

fn classify(err: SagaError) -> HandlerError {
    match err {
        err if err.is_retryable() => HandlerError::Retryable(err.to_string()),
        err @ (SagaError::InvalidEvent(_)
        | SagaError::UnknownDefinition(_)
        | SagaError::Store(SagaStoreError::NotFound(_))) => HandlerError::Structural(err.to_string()),
        err => HandlerError::Permanent(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{STEP_RESULT, SAGA_START};
    use crate::triggers::TriggerBinding;
    use crate::{DefinitionRegistry, SagaDefinition};
    use messaging::{EventProducer, InMemoryBroker, TopicMap};
    use saga_store::{InMemorySagaStore, SagaStatus};
    use serde_json::json;
    use std::time::Duration;

    type TestHandler = SagaEventHandler<InMemorySagaStore, EventProducer<InMemoryBroker>>;

    fn handler() -> (TestHandler, InMemorySagaStore) {
        let mut registry = DefinitionRegistry::new();
        registry
            .register(
                SagaDefinition::builder("one-step")
                    .add_step("a", "a.do", "a.undo", Duration::from_secs(5), 0)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let store = InMemorySagaStore::new();
        let orchestrator = Orchestrator::new(
            store.clone(),
            EventProducer::new(InMemoryBroker::new(), TopicMap::new("")),
            Arc::new(registry),
        );
        let triggers = TriggerBindings::new().bind(TriggerBinding::new("thing.happened", "one-step"));
        (SagaEventHandler::new(Arc::new(orchestrator), triggers), store)
    }

    #[tokio::test]
    async fn trigger_starts_saga() {
        let (handler, store) = handler();
        let event = EventEnvelope::new("thing.happened", json!({"booking_id": "b-1"}));
        handler.handle(&event).await.unwrap();

        let saga = store.get(&common::SagaKey::new("b-1")).await.unwrap();
        assert_eq!(saga.status, SagaStatus::Running);
    }

    #[tokio::test]
    async fn explicit_start_and_duplicate_results_are_fine() {
        let (handler, store) = handler();
        let start = EventEnvelope::new(
            SAGA_START,
            json!({"definition": "one-step", "saga_key": "k", "payload": {}}),
        );
        handler.handle(&start).await.unwrap();

        let result = EventEnvelope::new(
            STEP_RESULT,
            json!({"saga_key": "k", "step_index": 0, "outcome": "SUCCESS"}),
        );
        handler.handle(&result).await.unwrap();
        // Redelivered with a new event ID: stale, but not an error.
        let again = EventEnvelope::new(result.event_type.clone(), result.data.clone());
        handler.handle(&again).await.unwrap();

        let saga = store.get(&common::SagaKey::new("k")).await.unwrap();
        assert_eq!(saga.status, SagaStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_types_are_ignored_and_bad_payloads_are_structural() {
        let (handler, _) = handler();
        let unknown = EventEnvelope::new("nobody.cares", json!({"booking_id": "b-1"}));
        handler.handle(&unknown).await.unwrap();

        let bad = EventEnvelope::new(STEP_RESULT, json!({"saga_key": "k"}));
        assert!(matches!(
            handler.handle(&bad).await,
            Err(HandlerError::Structural(_))
        ));

        let orphan = EventEnvelope::new(
            STEP_RESULT,
            json!({"saga_key": "missing", "step_index": 0, "outcome": "SUCCESS"}),
        );
        assert!(matches!(
            handler.handle(&orphan).await,
            Err(HandlerError::Structural(_))
        ));
    }
}
