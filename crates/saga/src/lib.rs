//! Saga orchestration for booking workflows.
//!
//! A saga is an ordered list of steps, each with a compensating action.
//! The [`Orchestrator`] issues one step command at a time, advances on
//! success, retries failures within the step's budget and, once a step is
//! exhausted, compensates the completed steps in reverse order.
//!
//! State lives in a [`saga_store::SagaStore`] and every transition is a
//! compare-and-swap, written before any command is published. Timeouts are
//! detected by the [`Reconciler`] from the age of each instance.

pub mod booking;
pub mod definition;
pub mod error;
pub mod events;
pub mod executor;
pub mod handler;
pub mod orchestrator;
pub mod reconciler;
pub mod registry;
mod transitions;
pub mod triggers;

pub use definition::{SagaDefinition, SagaDefinitionBuilder, StepSpec};
pub use error::{Result, SagaError};
pub use events::{InboundEvent, StartRequest, StepCommand, StepResult};
pub use executor::{CommandResponder, ScriptedOutcome, SimulatedExecutor, StepExecutor};
pub use handler::SagaEventHandler;
pub use orchestrator::{Orchestrator, OrchestratorConfig, TerminalStartPolicy};
pub use reconciler::{Reconciler, ReconcilerConfig, SweepReport};
pub use registry::DefinitionRegistry;
pub use triggers::{TriggerBinding, TriggerBindings};
