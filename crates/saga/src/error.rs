//! Saga error types.

use common::SagaKey;
use messaging::MessagingError;
use saga_store::{SagaStatus, SagaStoreError};
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A definition was built without steps.
    #[error("Saga definition '{name}' has no steps")]
    EmptyDefinition { name: String },

    /// Two steps of one definition share a name.
    #[error("Saga definition '{definition}' declares step '{step}' more than once")]
    DuplicateStepName { definition: String, step: String },

    /// A definition with this name is already registered.
    #[error("Saga definition '{0}' is already registered")]
    DuplicateDefinitionName(String),

    /// No definition with this name is registered.
    #[error("Unknown saga definition: {0}")]
    UnknownDefinition(String),

    /// A result or timeout no longer matches the instance's current step.
    #[error("Stale step result for saga {saga_id} step {step_index}: {reason}")]
    StaleStepResult {
        saga_id: SagaKey,
        step_index: usize,
        reason: String,
    },

    /// A start request hit a terminal instance under the `Reject` policy.
    #[error("Saga {saga_id} already finished with status {status}")]
    AlreadyTerminal { saga_id: SagaKey, status: SagaStatus },

    /// An inbound event is missing fields or has the wrong shape.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] SagaStoreError),

    /// Broker error.
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if the failed operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SagaError::Store(err) => err.is_retryable(),
            SagaError::Messaging(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true for outcomes that are expected under redelivery and
    /// need no further action.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            SagaError::StaleStepResult { .. } | SagaError::AlreadyTerminal { .. }
        )
    }

    pub(crate) fn stale(saga_id: &SagaKey, step_index: usize, reason: impl Into<String>) -> Self {
        SagaError::StaleStepResult {
            saga_id: saga_id.clone(),
            step_index,
            reason: reason.into(),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
