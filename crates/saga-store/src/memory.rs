use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    Result, SagaInstance, SagaKey, SagaQuery, SagaStoreError, Version, store::SagaStore,
};

/// In-memory saga store for tests and standalone runs.
///
/// Provides the same versioning semantics as the PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    instances: Arc<RwLock<HashMap<SagaKey, SagaInstance>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored instances.
    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Overwrites a stored record without a version check.
    ///
    /// Test hook for simulating crashes and clock skew (e.g. backdating
    /// `updated_at`); the orchestrator never calls it.
    pub async fn put_raw(&self, instance: SagaInstance) {
        self.instances
            .write()
            .await
            .insert(instance.saga_id.clone(), instance);
    }

    fn stamp_created(mut instance: SagaInstance) -> SagaInstance {
        let now = Utc::now();
        instance.version = Version::first();
        instance.created_at = now;
        instance.updated_at = now;
        instance
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn create(&self, instance: SagaInstance) -> Result<SagaInstance> {
        let mut store = self.instances.write().await;
        if store.contains_key(&instance.saga_id) {
            return Err(SagaStoreError::AlreadyExists(instance.saga_id));
        }
        let stored = Self::stamp_created(instance);
        store.insert(stored.saga_id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_or_create(&self, instance: SagaInstance) -> Result<(SagaInstance, bool)> {
        let mut store = self.instances.write().await;
        if let Some(existing) = store.get(&instance.saga_id) {
            return Ok((existing.clone(), false));
        }
        let stored = Self::stamp_created(instance);
        store.insert(stored.saga_id.clone(), stored.clone());
        Ok((stored, true))
    }

    async fn get(&self, saga_id: &SagaKey) -> Result<SagaInstance> {
        self.instances
            .read()
            .await
            .get(saga_id)
            .cloned()
            .ok_or_else(|| SagaStoreError::NotFound(saga_id.clone()))
    }

    async fn compare_and_swap(
        &self,
        mut instance: SagaInstance,
        expected: Version,
    ) -> Result<SagaInstance> {
        let mut store = self.instances.write().await;
        let current = store
            .get(&instance.saga_id)
            .ok_or_else(|| SagaStoreError::NotFound(instance.saga_id.clone()))?;

        if current.version != expected {
            metrics::counter!("saga_version_conflicts_total").increment(1);
            return Err(SagaStoreError::VersionConflict {
                saga_id: instance.saga_id,
                expected,
                actual: current.version,
            });
        }

        instance.version = expected.next();
        instance.created_at = current.created_at;
        instance.updated_at = Utc::now().max(current.updated_at);
        store.insert(instance.saga_id.clone(), instance.clone());
        Ok(instance)
    }

    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaInstance>> {
        let store = self.instances.read().await;
        let mut matched: Vec<_> = store
            .values()
            .filter(|instance| query.matches(instance))
            .cloned()
            .collect();

        matched.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.saga_id.cmp(&b.saga_id))
        });

        if let Some(limit) = query.limit {
            matched.truncate(limit);
        }

        Ok(matched)
    }
}
