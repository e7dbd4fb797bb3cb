//! Shared value types used across the saga orchestrator crates.

pub mod types;

pub use types::{EventId, SagaKey, Version};
