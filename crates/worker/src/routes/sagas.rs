//! Read-only saga inspection endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use saga_store::{SagaInstance, SagaKey, SagaQuery, SagaStatus, SagaStore, StepRecord};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

/// Shared application state accessible from all handlers.
pub struct AppState<S: SagaStore> {
    pub store: S,
}

impl<S: SagaStore> AppState<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

// -- Request types --

#[derive(Debug, Default, Deserialize)]
pub struct ListSagasParams {
    pub status: Option<String>,
    pub definition: Option<String>,
    pub limit: Option<usize>,
}

// -- Response types --

#[derive(Serialize)]
pub struct StepResponse {
    pub step_index: usize,
    pub step_name: String,
    pub phase: String,
    pub outcome: Option<String>,
    pub attempts: u32,
    pub output: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub dispatched: bool,
}

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: String,
    pub definition_name: String,
    pub status: String,
    pub current_step_index: usize,
    pub steps: Vec<StepResponse>,
    pub payload: serde_json::Value,
    pub failure_reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct SagaSummary {
    pub saga_id: String,
    pub definition_name: String,
    pub status: String,
    pub current_step_index: usize,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&StepRecord> for StepResponse {
    fn from(record: &StepRecord) -> Self {
        Self {
            step_index: record.step_index,
            step_name: record.step_name.clone(),
            phase: label(&record.phase),
            outcome: record.outcome.as_ref().map(label),
            attempts: record.attempts,
            output: record.output.clone(),
            last_error: record.last_error.clone(),
            dispatched: record.dispatched,
        }
    }
}

impl From<SagaInstance> for SagaResponse {
    fn from(saga: SagaInstance) -> Self {
        Self {
            steps: saga.step_outcomes.iter().map(StepResponse::from).collect(),
            saga_id: saga.saga_id.to_string(),
            definition_name: saga.definition_name,
            status: saga.status.to_string(),
            current_step_index: saga.current_step_index,
            payload: saga.payload,
            failure_reason: saga.failure_reason,
            version: saga.version.as_i64(),
            created_at: saga.created_at,
            updated_at: saga.updated_at,
            deadline_at: saga.deadline_at,
        }
    }
}

impl From<SagaInstance> for SagaSummary {
    fn from(saga: SagaInstance) -> Self {
        Self {
            saga_id: saga.saga_id.to_string(),
            definition_name: saga.definition_name,
            status: saga.status.to_string(),
            current_step_index: saga.current_step_index,
            failure_reason: saga.failure_reason,
            updated_at: saga.updated_at,
        }
    }
}

/// Serialized enum name, e.g. `"TIMED_OUT"` or `"compensation"`.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

// -- Handlers --

/// GET /sagas/{saga_id}: load one saga instance with its step history.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(saga_id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    if saga_id.trim().is_empty() {
        return Err(ApiError::BadRequest("saga_id must not be empty".to_string()));
    }
    let saga = state.store.get(&SagaKey::new(saga_id)).await?;
    Ok(Json(SagaResponse::from(saga)))
}

/// GET /sagas?status=failed&definition=...&limit=...: list saga instances,
/// least recently updated first.
#[tracing::instrument(skip(state))]
pub async fn list<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(params): Query<ListSagasParams>,
) -> Result<Json<Vec<SagaSummary>>, ApiError> {
    let mut query = match params.status.as_deref() {
        Some(status) => {
            let status: SagaStatus = status.parse().map_err(ApiError::BadRequest)?;
            SagaQuery::with_status(status)
        }
        None => SagaQuery::new(),
    };
    if let Some(definition) = params.definition {
        query = query.definition(definition);
    }
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    let sagas = state.store.query(query.limit(limit)).await?;
    Ok(Json(sagas.into_iter().map(SagaSummary::from).collect()))
}
