use thiserror::Error;

use crate::{SagaKey, Version};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// No instance is stored under the given saga ID.
    #[error("Saga instance not found: {0}")]
    NotFound(SagaKey),

    /// Strict creation was requested but the instance already exists.
    #[error("Saga instance already exists: {0}")]
    AlreadyExists(SagaKey),

    /// The stored version did not match the caller's expected version.
    #[error("Version conflict for saga {saga_id}: expected version {expected}, found {actual}")]
    VersionConflict {
        saga_id: SagaKey,
        expected: Version,
        actual: Version,
    },

    /// A stored row could not be mapped back into a saga instance.
    #[error("Invalid saga record: {0}")]
    InvalidRecord(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaStoreError {
    /// Returns true if retrying the operation after a reload may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SagaStoreError::VersionConflict { .. } | SagaStoreError::Database(_)
        )
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
