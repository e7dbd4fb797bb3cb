//! Durable persistence for saga instances.
//!
//! Every mutation goes through [`SagaStore::compare_and_swap`], which only
//! writes when the caller's expected version matches the stored one. This
//! is the sole concurrency-safety mechanism between consumers and the
//! reconciliation sweep.

pub mod error;
pub mod instance;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;

pub use common::{SagaKey, Version};
pub use error::{Result, SagaStoreError};
pub use instance::{SagaInstance, SagaStatus, StepOutcome, StepPhase, StepRecord};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use query::SagaQuery;
pub use store::{SagaStore, SagaStoreExt};
