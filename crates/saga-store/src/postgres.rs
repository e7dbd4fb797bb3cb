use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    Result, SagaInstance, SagaKey, SagaQuery, SagaStatus, SagaStoreError, StepRecord, Version,
    store::SagaStore,
};

const COLUMNS: &str = "saga_id, definition_name, current_step_index, status, step_outcomes, \
                       payload, failure_reason, version, created_at, updated_at, deadline_at";

/// PostgreSQL-backed saga store.
///
/// Compare-and-swap is a single conditional `UPDATE ... WHERE version = $n`,
/// so a stale writer changes nothing.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_instance(row: PgRow) -> Result<SagaInstance> {
        let status: String = row.try_get("status")?;
        let status: SagaStatus = status.parse().map_err(SagaStoreError::InvalidRecord)?;

        let step_index: i32 = row.try_get("current_step_index")?;
        let current_step_index = usize::try_from(step_index).map_err(|_| {
            SagaStoreError::InvalidRecord(format!("negative step index {step_index}"))
        })?;

        let outcomes: serde_json::Value = row.try_get("step_outcomes")?;
        let step_outcomes: Vec<StepRecord> = serde_json::from_value(outcomes)?;

        Ok(SagaInstance {
            saga_id: SagaKey::new(row.try_get::<String, _>("saga_id")?),
            definition_name: row.try_get("definition_name")?,
            current_step_index,
            status,
            step_outcomes,
            payload: row.try_get("payload")?,
            failure_reason: row.try_get("failure_reason")?,
            version: Version::new(row.try_get("version")?),
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            deadline_at: row.try_get::<Option<DateTime<Utc>>, _>("deadline_at")?,
        })
    }

    /// Inserts version 1 of an instance; returns `None` if the ID is taken.
    async fn insert_if_absent(&self, instance: &SagaInstance) -> Result<Option<SagaInstance>> {
        let now = Utc::now();
        let sql = format!(
            r#"
            INSERT INTO saga_instances ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, $10)
            ON CONFLICT (saga_id) DO NOTHING
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(instance.saga_id.as_str())
            .bind(&instance.definition_name)
            .bind(step_index_column(instance.current_step_index)?)
            .bind(instance.status.as_str())
            .bind(serde_json::to_value(&instance.step_outcomes)?)
            .bind(&instance.payload)
            .bind(&instance.failure_reason)
            .bind(Version::first().as_i64())
            .bind(now)
            .bind(instance.deadline_at)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_instance).transpose()
    }
}

fn step_index_column(index: usize) -> Result<i32> {
    i32::try_from(index)
        .map_err(|_| SagaStoreError::InvalidRecord(format!("step index {index} out of range")))
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    #[tracing::instrument(skip(self, instance), fields(saga_id = %instance.saga_id))]
    async fn create(&self, instance: SagaInstance) -> Result<SagaInstance> {
        self.insert_if_absent(&instance)
            .await?
            .ok_or(SagaStoreError::AlreadyExists(instance.saga_id))
    }

    #[tracing::instrument(skip(self, instance), fields(saga_id = %instance.saga_id))]
    async fn get_or_create(&self, instance: SagaInstance) -> Result<(SagaInstance, bool)> {
        match self.insert_if_absent(&instance).await? {
            Some(created) => Ok((created, true)),
            None => Ok((self.get(&instance.saga_id).await?, false)),
        }
    }

    async fn get(&self, saga_id: &SagaKey) -> Result<SagaInstance> {
        let sql = format!("SELECT {COLUMNS} FROM saga_instances WHERE saga_id = $1");
        let row = sqlx::query(&sql)
            .bind(saga_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Self::row_to_instance(row),
            None => Err(SagaStoreError::NotFound(saga_id.clone())),
        }
    }

    #[tracing::instrument(skip(self, instance), fields(saga_id = %instance.saga_id, %expected))]
    async fn compare_and_swap(
        &self,
        instance: SagaInstance,
        expected: Version,
    ) -> Result<SagaInstance> {
        let started = std::time::Instant::now();
        let sql = format!(
            r#"
            UPDATE saga_instances
            SET current_step_index = $3,
                status = $4,
                step_outcomes = $5,
                payload = $6,
                failure_reason = $7,
                version = version + 1,
                updated_at = GREATEST(updated_at, $8),
                deadline_at = $9
            WHERE saga_id = $1 AND version = $2
            RETURNING {COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(instance.saga_id.as_str())
            .bind(expected.as_i64())
            .bind(step_index_column(instance.current_step_index)?)
            .bind(instance.status.as_str())
            .bind(serde_json::to_value(&instance.step_outcomes)?)
            .bind(&instance.payload)
            .bind(&instance.failure_reason)
            .bind(Utc::now())
            .bind(instance.deadline_at)
            .fetch_optional(&self.pool)
            .await?;

        metrics::histogram!("saga_store_cas_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        if let Some(row) = row {
            return Self::row_to_instance(row);
        }

        // Nothing updated: tell a missing row apart from a stale version.
        let actual: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_instances WHERE saga_id = $1")
                .bind(instance.saga_id.as_str())
                .fetch_optional(&self.pool)
                .await?;

        match actual {
            None => Err(SagaStoreError::NotFound(instance.saga_id)),
            Some(actual) => {
                metrics::counter!("saga_version_conflicts_total").increment(1);
                Err(SagaStoreError::VersionConflict {
                    saga_id: instance.saga_id,
                    expected,
                    actual: Version::new(actual),
                })
            }
        }
    }

    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaInstance>> {
        let mut sql = format!("SELECT {COLUMNS} FROM saga_instances WHERE 1=1");
        let mut param_count = 0;

        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.definition_name.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND definition_name = ${param_count}"));
        }
        if query.updated_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND updated_at < ${param_count}"));
        }
        if query.due_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND deadline_at < ${param_count}"));
        }

        sql.push_str(" ORDER BY updated_at ASC, saga_id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(statuses) = query.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(statuses);
        }
        if let Some(name) = query.definition_name {
            sqlx_query = sqlx_query.bind(name);
        }
        if let Some(cutoff) = query.updated_before {
            sqlx_query = sqlx_query.bind(cutoff);
        }
        if let Some(cutoff) = query.due_before {
            sqlx_query = sqlx_query.bind(cutoff);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_instance).collect()
    }
}
