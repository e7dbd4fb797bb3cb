//! Step executor contract and a simulated implementation.
//!
//! Real executors live in other services: they consume step commands and
//! publish a [`StepResult`]. [`CommandResponder`] plays that role in-process
//! for standalone runs and tests, delegating the actual work to a
//! [`StepExecutor`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use messaging::{EventEmitter, EventEnvelope, EventHandler, HandlerError};
use saga_store::StepOutcome;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::events::{StepCommand, StepResult};

/// What an executor reports for one command. `None` means no reply is
/// sent, as if the executor crashed or the result was lost.
pub type ExecutionReply = Option<StepResult>;

/// Performs the work behind a step command.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs `command`, which arrived under event type `command_type`.
    async fn execute(&self, command_type: &str, command: &StepCommand) -> ExecutionReply;
}

/// A scripted reaction to one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Succeed,
    Fail(String),
    /// Send nothing, leaving the step to time out.
    Silent,
}

#[derive(Debug, Default)]
struct SimulatedState {
    scripts: HashMap<String, VecDeque<ScriptedOutcome>>,
    always_fail: HashMap<String, String>,
    executed: Vec<(String, StepCommand)>,
}

/// Executor that succeeds unless told otherwise.
///
/// Successful forward steps return `{"reference": "<command>-<uuid>"}` as
/// output so compensations can see what they are undoing.
#[derive(Debug, Clone, Default)]
pub struct SimulatedExecutor {
    state: Arc<RwLock<SimulatedState>>,
}

impl SimulatedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues outcomes for the next commands of a type; afterwards it succeeds.
    pub async fn script(&self, command_type: &str, outcomes: Vec<ScriptedOutcome>) {
        self.state
            .write()
            .await
            .scripts
            .entry(command_type.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Makes every command of a type fail.
    pub async fn fail_always(&self, command_type: &str, reason: &str) {
        self.state
            .write()
            .await
            .always_fail
            .insert(command_type.to_string(), reason.to_string());
    }

    /// `(command_type, command)` pairs executed so far, in order.
    pub async fn executed(&self) -> Vec<(String, StepCommand)> {
        self.state.read().await.executed.clone()
    }

    /// `(step_name, attempt)` of executed commands of a type.
    pub async fn executed_steps(&self, command_type: &str) -> Vec<(String, u32)> {
        self.state
            .read()
            .await
            .executed
            .iter()
            .filter(|(t, _)| t == command_type)
            .map(|(_, c)| (c.step_name.clone(), c.attempt))
            .collect()
    }
}

#[async_trait]
impl StepExecutor for SimulatedExecutor {
    async fn execute(&self, command_type: &str, command: &StepCommand) -> ExecutionReply {
        let mut state = self.state.write().await;
        state
            .executed
            .push((command_type.to_string(), command.clone()));

        let scripted = state
            .scripts
            .get_mut(command_type)
            .and_then(VecDeque::pop_front);
        let outcome = match (scripted, state.always_fail.get(command_type)) {
            (Some(outcome), _) => outcome,
            (None, Some(reason)) => ScriptedOutcome::Fail(reason.clone()),
            (None, None) => ScriptedOutcome::Succeed,
        };

        match outcome {
            ScriptedOutcome::Succeed => Some(
                StepResult::answering(command, StepOutcome::Success).with_output(
                    serde_json::json!({ "reference": format!("{command_type}-{}", Uuid::new_v4()) }),
                ),
            ),
            ScriptedOutcome::Fail(reason) => {
                Some(StepResult::answering(command, StepOutcome::Failed).with_error(reason))
            }
            ScriptedOutcome::Silent => None,
        }
    }
}

/// Consumes step commands, runs them on an executor and publishes results.
pub struct CommandResponder<X, E> {
    executor: X,
    emitter: E,
}

impl<X, E> CommandResponder<X, E>
where
    X: StepExecutor,
    E: EventEmitter,
{
    pub fn new(executor: X, emitter: E) -> Self {
        Self { executor, emitter }
    }
}

#[async_trait]
impl<X, E> EventHandler for CommandResponder<X, E>
where
    X: StepExecutor,
    E: EventEmitter,
{
    fn name(&self) -> &'static str {
        "simulated-executor"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<(), HandlerError> {
        let command: StepCommand = event
            .data_as()
            .map_err(|e| HandlerError::Structural(e.to_string()))?;

        let Some(result) = self.executor.execute(&event.event_type, &command).await else {
            tracing::debug!(command = %event.event_type, saga_key = %command.saga_key, "executor stayed silent");
            return Ok(());
        };

        let reply = EventEnvelope::from_payload(command.result_event_type(), &result)
            .map_err(|e| HandlerError::Permanent(e.to_string()))?;
        self.emitter
            .emit(&command.saga_key, &reply)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))
    }
}
