use chrono::{DateTime, Utc};

use crate::{SagaInstance, SagaStatus};

/// Filter for listing saga instances.
///
/// Used by the reconciliation sweep to find stale in-flight instances and
/// by operators to list instances in a given status.
#[derive(Debug, Clone, Default)]
pub struct SagaQuery {
    /// Filter by status (any of these).
    pub statuses: Option<Vec<SagaStatus>>,

    /// Filter by definition name.
    pub definition_name: Option<String>,

    /// Only instances last updated strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,

    /// Only instances whose `deadline_at` is strictly before this instant.
    /// Instances without a deadline never match.
    pub due_before: Option<DateTime<Utc>>,

    /// Maximum number of instances to return.
    pub limit: Option<usize>,
}

impl SagaQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for instances the reconciler must watch.
    pub fn active() -> Self {
        Self {
            statuses: Some(
                SagaStatus::all()
                    .into_iter()
                    .filter(SagaStatus::is_active)
                    .collect(),
            ),
            ..Default::default()
        }
    }

    /// Creates a query for instances with a command in flight.
    pub fn in_flight() -> Self {
        Self {
            statuses: Some(vec![SagaStatus::Running, SagaStatus::Compensating]),
            ..Default::default()
        }
    }

    /// Creates a query for a single status.
    pub fn with_status(status: SagaStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    /// Restricts the query to one definition.
    pub fn definition(mut self, name: impl Into<String>) -> Self {
        self.definition_name = Some(name.into());
        self
    }

    /// Restricts the query to instances not touched since `cutoff`.
    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }

    /// Restricts the query to instances whose deadline passed before `cutoff`.
    pub fn due_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.due_before = Some(cutoff);
        self
    }

    /// Sets the maximum number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the instance satisfies every filter.
    pub fn matches(&self, instance: &SagaInstance) -> bool {
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&instance.status)
        {
            return false;
        }
        if let Some(ref name) = self.definition_name
            && &instance.definition_name != name
        {
            return false;
        }
        if let Some(cutoff) = self.updated_before
            && instance.updated_at >= cutoff
        {
            return false;
        }
        if let Some(cutoff) = self.due_before
            && instance.deadline_at.is_none_or(|deadline| deadline >= cutoff)
        {
            return false;
        }
        true
    }
}
