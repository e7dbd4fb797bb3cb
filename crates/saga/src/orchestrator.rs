//! Saga orchestrator: applies transitions and persists them before publishing.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::SagaKey;
use messaging::{EventEmitter, EventEnvelope};
use saga_store::{SagaInstance, SagaQuery, SagaStatus, SagaStore, SagaStoreError, StepOutcome};

use crate::events::StepResult;
use crate::transitions::{self, Decision, Dispatch};
use crate::{DefinitionRegistry, Result, SagaDefinition, SagaError};

/// What a start request does when the saga already finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TerminalStartPolicy {
    /// Return the finished instance unchanged.
    #[default]
    Ignore,
    /// Fail with [`SagaError::AlreadyTerminal`].
    Reject,
}

impl std::str::FromStr for TerminalStartPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(TerminalStartPolicy::Ignore),
            "reject" => Ok(TerminalStartPolicy::Reject),
            other => Err(format!("unknown terminal start policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub terminal_start_policy: TerminalStartPolicy,
    /// How often a transition reloads and re-decides after losing a
    /// compare-and-swap race before giving up.
    pub conflict_retries: u32,
    /// How long a command may stay unconfirmed before the reconciler
    /// publishes it again.
    pub dispatch_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            terminal_start_policy: TerminalStartPolicy::Ignore,
            conflict_retries: 5,
            dispatch_grace: Duration::from_secs(5),
        }
    }
}

/// Drives saga instances through their definitions.
///
/// Every transition is a compare-and-swap against the store; commands are
/// emitted only after the write succeeds, and a second write marks them
/// dispatched. If emitting fails the attempt stays unconfirmed and the
/// reconciler publishes it again without spending a retry.
pub struct Orchestrator<S, E> {
    store: S,
    emitter: E,
    registry: Arc<DefinitionRegistry>,
    config: OrchestratorConfig,
}

impl<S, E> Orchestrator<S, E>
where
    S: SagaStore,
    E: EventEmitter,
{
    pub fn new(store: S, emitter: E, registry: Arc<DefinitionRegistry>) -> Self {
        Self::with_config(store, emitter, registry, OrchestratorConfig::default())
    }

    pub fn with_config(
        store: S,
        emitter: E,
        registry: Arc<DefinitionRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            emitter,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &DefinitionRegistry {
        &self.registry
    }

    /// Starts a saga, or returns the existing instance for `saga_key`.
    ///
    /// A fresh instance is created pending, moved to running and step 0 is
    /// issued. An existing non-terminal instance is returned unchanged; a
    /// terminal one is handled per [`TerminalStartPolicy`].
    #[tracing::instrument(skip(self, payload), fields(saga_id = %saga_key))]
    pub async fn start_saga(
        &self,
        definition_name: &str,
        saga_key: SagaKey,
        payload: serde_json::Value,
    ) -> Result<SagaInstance> {
        let definition = self.registry.require(definition_name)?;
        let (instance, created) = self
            .store
            .get_or_create(SagaInstance::new(saga_key, definition.name(), payload))
            .await?;

        if created {
            metrics::counter!("saga_started_total", "definition" => definition.name().to_string())
                .increment(1);
            tracing::info!(definition = definition.name(), "saga created");
            return self.transition(&instance.saga_id, transitions::begin).await;
        }

        if instance.definition_name != definition.name() {
            tracing::warn!(
                existing = %instance.definition_name,
                requested = definition.name(),
                "saga key already used by another definition"
            );
        }

        if instance.is_terminal() && self.config.terminal_start_policy == TerminalStartPolicy::Reject
        {
            return Err(SagaError::AlreadyTerminal {
                saga_id: instance.saga_id,
                status: instance.status,
            });
        }

        tracing::debug!(status = %instance.status, "saga already exists");
        Ok(instance)
    }

    /// Applies the result of a forward step.
    #[tracing::instrument(
        skip(self, result),
        fields(saga_id = %result.saga_key, step_index = result.step_index, outcome = ?result.outcome)
    )]
    pub async fn handle_step_result(&self, result: &StepResult) -> Result<SagaInstance> {
        self.transition(&result.saga_key, |definition, instance| {
            transitions::forward_result(definition, instance, result)
        })
        .await
    }

    /// Treats the in-flight attempt of a forward step as failed by timeout.
    pub async fn handle_step_timeout(
        &self,
        saga_key: &SagaKey,
        step_index: usize,
    ) -> Result<SagaInstance> {
        self.handle_step_result(&timed_out(saga_key, step_index))
            .await
    }

    /// Applies the result of a compensation step.
    #[tracing::instrument(
        skip(self, result),
        fields(saga_id = %result.saga_key, step_index = result.step_index, outcome = ?result.outcome)
    )]
    pub async fn handle_compensation_result(&self, result: &StepResult) -> Result<SagaInstance> {
        self.transition(&result.saga_key, |definition, instance| {
            transitions::compensation_result(definition, instance, result)
        })
        .await
    }

    /// Treats the in-flight attempt of a compensation as failed by timeout.
    pub async fn handle_compensation_timeout(
        &self,
        saga_key: &SagaKey,
        step_index: usize,
    ) -> Result<SagaInstance> {
        self.handle_compensation_result(&timed_out(saga_key, step_index))
            .await
    }

    /// Drives an instance left pending by a crash between create and start.
    #[tracing::instrument(skip(self), fields(saga_id = %saga_key))]
    pub async fn resume_pending(&self, saga_key: &SagaKey) -> Result<SagaInstance> {
        self.transition(saga_key, transitions::begin).await
    }

    /// Publishes the in-flight command again if its publish was never
    /// confirmed.
    #[tracing::instrument(skip(self), fields(saga_id = %saga_key))]
    pub async fn redispatch(&self, saga_key: &SagaKey) -> Result<SagaInstance> {
        self.transition(saga_key, transitions::redispatch).await
    }

    pub async fn get_saga(&self, saga_key: &SagaKey) -> Result<SagaInstance> {
        Ok(self.store.get(saga_key).await?)
    }

    pub async fn list_sagas(&self, query: SagaQuery) -> Result<Vec<SagaInstance>> {
        Ok(self.store.query(query).await?)
    }

    /// Persists a decision, emits its commands, then confirms the dispatch.
    async fn transition<F>(&self, saga_key: &SagaKey, decide: F) -> Result<SagaInstance>
    where
        F: FnMut(&SagaDefinition, SagaInstance) -> Result<Decision>,
    {
        let (saved, commands) = self.persist(saga_key, decide).await?;
        if commands.is_empty() {
            return Ok(saved);
        }

        let dispatch = Dispatch::of(&saved);
        self.emit_all(&saved.saga_id, &commands).await?;
        let Some(dispatch) = dispatch else {
            return Ok(saved);
        };

        let confirmed = self
            .persist(saga_key, |_, instance| {
                Ok(transitions::confirm_dispatch(instance, &dispatch))
            })
            .await;
        match confirmed {
            Ok((instance, _)) => Ok(instance),
            Err(err) => {
                tracing::warn!(saga_id = %saga_key, error = %err, "could not record dispatch");
                Ok(saved)
            }
        }
    }

    /// Loads, decides and compare-and-swaps; returns the stored instance
    /// and the commands to emit.
    ///
    /// A lost race reloads and decides again with the fresh instance, so the
    /// decision always reflects what is stored.
    async fn persist<F>(
        &self,
        saga_key: &SagaKey,
        mut decide: F,
    ) -> Result<(SagaInstance, Vec<EventEnvelope>)>
    where
        F: FnMut(&SagaDefinition, SagaInstance) -> Result<Decision>,
    {
        let mut conflicts = 0;
        loop {
            let current = self.store.get(saga_key).await?;
            let definition = self.registry.require(&current.definition_name)?;
            let expected = current.version;
            let previous_status = current.status;

            let (mut next, commands) = match decide(definition.as_ref(), current) {
                Ok(Decision::Unchanged(instance)) => return Ok((instance, Vec::new())),
                Ok(Decision::Persist { instance, commands }) => (instance, commands),
                Err(err @ SagaError::StaleStepResult { .. }) => {
                    metrics::counter!("saga_stale_results_total").increment(1);
                    tracing::debug!(error = %err, "ignoring stale result");
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            next.deadline_at = transitions::deadline(
                definition.as_ref(),
                &next,
                Utc::now(),
                self.config.dispatch_grace,
            );

            match self.store.compare_and_swap(next, expected).await {
                Ok(saved) => {
                    record_status_change(previous_status, &saved);
                    return Ok((saved, commands));
                }
                Err(SagaStoreError::VersionConflict { .. })
                    if conflicts < self.config.conflict_retries =>
                {
                    conflicts += 1;
                    tracing::debug!(conflicts, "version conflict, reloading");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn emit_all(&self, saga_key: &SagaKey, commands: &[EventEnvelope]) -> Result<()> {
        for command in commands {
            self.emitter.emit(saga_key, command).await?;
            tracing::debug!(command = %command.event_type, "command emitted");
        }
        Ok(())
    }
}

fn timed_out(saga_key: &SagaKey, step_index: usize) -> StepResult {
    StepResult {
        saga_key: saga_key.clone(),
        step_index,
        attempt: None,
        outcome: StepOutcome::TimedOut,
        output: None,
        error: None,
    }
}

fn record_status_change(previous: SagaStatus, saved: &SagaInstance) {
    if previous == saved.status {
        return;
    }

    let definition = saved.definition_name.clone();
    match saved.status {
        SagaStatus::Completed => {
            metrics::counter!("saga_completed_total", "definition" => definition).increment(1);
            tracing::info!(saga_id = %saved.saga_id, "saga completed");
        }
        SagaStatus::Compensated => {
            metrics::counter!("saga_compensated_total", "definition" => definition).increment(1);
            tracing::info!(saga_id = %saved.saga_id, reason = ?saved.failure_reason, "saga compensated");
        }
        SagaStatus::Failed => {
            metrics::counter!("saga_failed_total", "definition" => definition).increment(1);
            tracing::error!(saga_id = %saved.saga_id, reason = ?saved.failure_reason, "saga failed");
        }
        SagaStatus::Compensating => {
            tracing::warn!(saga_id = %saved.saga_id, reason = ?saved.failure_reason, "saga compensating");
        }
        SagaStatus::Pending | SagaStatus::Running => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging::{EventProducer, InMemoryBroker, TopicMap};
    use saga_store::{InMemorySagaStore, StepPhase};
    use std::time::Duration;

    type TestOrchestrator = Orchestrator<InMemorySagaStore, EventProducer<InMemoryBroker>>;

    fn registry() -> Arc<DefinitionRegistry> {
        let mut registry = DefinitionRegistry::new();
        registry
            .register(
                SagaDefinition::builder("two-step")
                    .add_step("a", "a.do", "a.undo", Duration::from_secs(5), 0)
                    .add_step("b", "b.do", "b.undo", Duration::from_secs(5), 0)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        Arc::new(registry)
    }

    fn setup(policy: TerminalStartPolicy) -> (TestOrchestrator, InMemoryBroker) {
        let broker = InMemoryBroker::new();
        let orchestrator = Orchestrator::with_config(
            InMemorySagaStore::new(),
            EventProducer::new(broker.clone(), TopicMap::new("")),
            registry(),
            OrchestratorConfig {
                terminal_start_policy: policy,
                conflict_retries: 3,
                ..OrchestratorConfig::default()
            },
        );
        (orchestrator, broker)
    }

    fn success(key: &str, index: usize) -> StepResult {
        StepResult {
            saga_key: SagaKey::new(key),
            step_index: index,
            attempt: None,
            outcome: StepOutcome::Success,
            output: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn start_persists_before_emitting() {
        let (orchestrator, broker) = setup(TerminalStartPolicy::Ignore);

        let saga = orchestrator
            .start_saga("two-step", SagaKey::new("k"), serde_json::json!({"n": 1}))
            .await
            .unwrap();

        assert_eq!(saga.status, SagaStatus::Running);
        // Created, started, then confirmed as dispatched.
        assert_eq!(saga.version.as_i64(), 3);
        assert!(saga.in_flight().is_some_and(|r| r.dispatched));
        assert!(saga.deadline_at.is_some());
        let commands = broker.published_envelopes("a.do").await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].data["payload"]["n"], 1);
    }

    #[tokio::test]
    async fn unknown_definition_is_rejected() {
        let (orchestrator, _) = setup(TerminalStartPolicy::Ignore);
        let result = orchestrator
            .start_saga("nope", SagaKey::new("k"), serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(SagaError::UnknownDefinition(_))));
    }

    #[tokio::test]
    async fn terminal_start_policy_reject() {
        let (orchestrator, _) = setup(TerminalStartPolicy::Reject);
        let key = SagaKey::new("k");
        orchestrator
            .start_saga("two-step", key.clone(), serde_json::json!({}))
            .await
            .unwrap();
        orchestrator.handle_step_result(&success("k", 0)).await.unwrap();
        let done = orchestrator.handle_step_result(&success("k", 1)).await.unwrap();
        assert_eq!(done.status, SagaStatus::Completed);

        let result = orchestrator
            .start_saga("two-step", key, serde_json::json!({}))
            .await;
        assert!(matches!(
            result,
            Err(SagaError::AlreadyTerminal { status: SagaStatus::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn terminal_start_policy_ignore_returns_instance() {
        let (orchestrator, broker) = setup(TerminalStartPolicy::Ignore);
        let key = SagaKey::new("k");
        orchestrator
            .start_saga("two-step", key.clone(), serde_json::json!({}))
            .await
            .unwrap();
        orchestrator.handle_step_result(&success("k", 0)).await.unwrap();
        orchestrator.handle_step_result(&success("k", 1)).await.unwrap();

        let again = orchestrator
            .start_saga("two-step", key, serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(again.status, SagaStatus::Completed);
        assert_eq!(broker.published("a.do").await.len(), 1);
    }

    #[tokio::test]
    async fn resume_pending_issues_first_step() {
        let (orchestrator, broker) = setup(TerminalStartPolicy::Ignore);
        let key = SagaKey::new("k");
        orchestrator
            .store()
            .create(SagaInstance::new(key.clone(), "two-step", serde_json::json!({})))
            .await
            .unwrap();

        let saga = orchestrator.resume_pending(&key).await.unwrap();
        assert_eq!(saga.status, SagaStatus::Running);
        assert_eq!(broker.published("a.do").await.len(), 1);

        // Not pending any more: nothing happens.
        let again = orchestrator.resume_pending(&key).await.unwrap();
        assert_eq!(again.version, saga.version);
        assert_eq!(broker.published("a.do").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn emit_failure_leaves_transition_persisted() {
        let (orchestrator, broker) = setup(TerminalStartPolicy::Ignore);
        let key = SagaKey::new("k");
        orchestrator
            .start_saga("two-step", key.clone(), serde_json::json!({}))
            .await
            .unwrap();

        broker.fail_next_publishes(100).await;
        let result = orchestrator.handle_step_result(&success("k", 0)).await;
        assert!(matches!(&result, Err(err) if err.is_retryable()));

        let saga = orchestrator.get_saga(&key).await.unwrap();
        assert_eq!(saga.current_step_index, 1);
        let record = saga.record(StepPhase::Forward, 1).unwrap();
        assert_eq!(record.attempts, 1);
        assert!(!record.dispatched);
    }

    #[tokio::test(start_paused = true)]
    async fn redispatch_publishes_the_unconfirmed_attempt_once() {
        let (orchestrator, broker) = setup(TerminalStartPolicy::Ignore);
        let key = SagaKey::new("k");
        orchestrator
            .start_saga("two-step", key.clone(), serde_json::json!({}))
            .await
            .unwrap();

        broker.fail_next_publishes(100).await;
        assert!(orchestrator.handle_step_result(&success("k", 0)).await.is_err());
        broker.fail_next_publishes(0).await;

        let saga = orchestrator.redispatch(&key).await.unwrap();
        let record = saga.in_flight().unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.dispatched);
        let commands = broker.published_envelopes("b.do").await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].data["attempt"], 1);

        let again = orchestrator.redispatch(&key).await;
        assert!(matches!(again, Err(SagaError::StaleStepResult { .. })));
        assert_eq!(broker.published("b.do").await.len(), 1);
    }

    #[test]
    fn policy_parses_case_insensitively() {
        assert_eq!(
            "REJECT".parse::<TerminalStartPolicy>().unwrap(),
            TerminalStartPolicy::Reject
        );
        assert_eq!(
            "ignore".parse::<TerminalStartPolicy>().unwrap(),
            TerminalStartPolicy::Ignore
        );
        assert!("maybe".parse::<TerminalStartPolicy>().is_err());
    }
}
