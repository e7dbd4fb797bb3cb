use std::sync::Arc;

use async_trait::async_trait;

use crate::{Result, SagaInstance, SagaKey, SagaQuery, SagaStoreError, Version};

/// Core trait for saga store implementations.
///
/// All implementations must be thread-safe (Send + Sync). Writes are
/// versioned: [`create`](SagaStore::create) stores version 1 and every
/// successful [`compare_and_swap`](SagaStore::compare_and_swap) stores the
/// next version with a fresh `updated_at`.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Stores a new instance.
    ///
    /// Fails with `AlreadyExists` if an instance with the same ID is stored.
    async fn create(&self, instance: SagaInstance) -> Result<SagaInstance>;

    /// Stores a new instance unless one already exists.
    ///
    /// Returns the stored instance and whether this call created it. A
    /// duplicate create is a no-op returning the existing instance.
    async fn get_or_create(&self, instance: SagaInstance) -> Result<(SagaInstance, bool)>;

    /// Loads an instance by ID.
    ///
    /// Fails with `NotFound` if absent.
    async fn get(&self, saga_id: &SagaKey) -> Result<SagaInstance>;

    /// Persists `instance` only if the stored version equals `expected`.
    ///
    /// Fails with `VersionConflict` otherwise and leaves the stored record
    /// untouched. Returns the instance as stored, with the new version.
    async fn compare_and_swap(&self, instance: SagaInstance, expected: Version)
    -> Result<SagaInstance>;

    /// Lists instances matching a query, oldest `updated_at` first.
    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaInstance>>;
}

#[async_trait]
impl<T: SagaStore + ?Sized> SagaStore for Arc<T> {
    async fn create(&self, instance: SagaInstance) -> Result<SagaInstance> {
        (**self).create(instance).await
    }

    async fn get_or_create(&self, instance: SagaInstance) -> Result<(SagaInstance, bool)> {
        (**self).get_or_create(instance).await
    }

    async fn get(&self, saga_id: &SagaKey) -> Result<SagaInstance> {
        (**self).get(saga_id).await
    }

    async fn compare_and_swap(
        &self,
        instance: SagaInstance,
        expected: Version,
    ) -> Result<SagaInstance> {
        (**self).compare_and_swap(instance, expected).await
    }

    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaInstance>> {
        (**self).query(query).await
    }
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Loads an instance, mapping `NotFound` to `None`.
    async fn find(&self, saga_id: &SagaKey) -> Result<Option<SagaInstance>> {
        match self.get(saga_id).await {
            Ok(instance) => Ok(Some(instance)),
            Err(SagaStoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Checks if an instance is stored.
    async fn exists(&self, saga_id: &SagaKey) -> Result<bool> {
        Ok(self.find(saga_id).await?.is_some())
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}
