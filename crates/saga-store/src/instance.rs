//! Saga instance record and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{SagaKey, Version};

/// The status of a saga instance in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Running ──┬──► Completed
///                       └──► Compensating ──┬──► Compensated
///                                           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Instance created, first command not yet emitted.
    #[default]
    Pending,

    /// Forward steps are being executed.
    Running,

    /// All forward steps succeeded (terminal).
    Completed,

    /// A step failed and completed steps are being compensated.
    Compensating,

    /// Every completed step was compensated (terminal).
    Compensated,

    /// A compensation could not be applied; needs manual intervention (terminal).
    Failed,
}

impl SagaStatus {
    /// Returns true if the saga can begin running.
    pub fn can_run(&self) -> bool {
        matches!(self, SagaStatus::Pending)
    }

    /// Returns true if the saga can begin compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Running)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns true for states the reconciliation sweep watches.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SagaStatus::Pending | SagaStatus::Running | SagaStatus::Compensating
        )
    }

    /// The phase whose commands are in flight in this status.
    pub fn phase(&self) -> Option<StepPhase> {
        match self {
            SagaStatus::Running => Some(StepPhase::Forward),
            SagaStatus::Compensating => Some(StepPhase::Compensation),
            _ => None,
        }
    }

    /// Returns the status name as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "PENDING",
            SagaStatus::Running => "RUNNING",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Failed => "FAILED",
        }
    }

    /// All statuses, in lifecycle order.
    pub fn all() -> [SagaStatus; 6] {
        [
            SagaStatus::Pending,
            SagaStatus::Running,
            SagaStatus::Completed,
            SagaStatus::Compensating,
            SagaStatus::Compensated,
            SagaStatus::Failed,
        ]
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SagaStatus::all()
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown saga status '{s}'"))
    }
}

/// The result of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    Success,
    Failed,
    TimedOut,
}

impl StepOutcome {
    /// Returns true for outcomes that count against the retry budget.
    pub fn is_failure(&self) -> bool {
        !matches!(self, StepOutcome::Success)
    }
}

/// Whether a step record tracks the forward action or its compensation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Forward,
    Compensation,
}

/// Progress of one step in one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: usize,
    pub step_name: String,
    pub phase: StepPhase,
    /// Final outcome; `None` while an attempt is in flight.
    pub outcome: Option<StepOutcome>,
    /// Number of commands emitted for this step so far.
    pub attempts: u32,
    /// Output reported by the step executor on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Set once the command for the current attempt reached the broker.
    #[serde(default)]
    pub dispatched: bool,
}

impl StepRecord {
    /// Creates a record for the first attempt of a step.
    pub fn started(step_index: usize, step_name: impl Into<String>, phase: StepPhase) -> Self {
        Self {
            step_index,
            step_name: step_name.into(),
            phase,
            outcome: None,
            attempts: 1,
            output: None,
            last_error: None,
            dispatched: false,
        }
    }

    /// Returns true if the step finished successfully.
    pub fn succeeded(&self) -> bool {
        self.outcome == Some(StepOutcome::Success)
    }
}

/// Durable state of one saga instance.
///
/// The orchestrator is the only writer; every change is persisted through
/// the store's compare-and-swap, which bumps `version` and `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub saga_id: SagaKey,
    pub definition_name: String,
    /// Cursor into the definition's steps. While compensating it points at
    /// the step whose compensation is in flight.
    pub current_step_index: usize,
    pub status: SagaStatus,
    /// Attempted steps, in the order they were first attempted.
    pub step_outcomes: Vec<StepRecord>,
    /// Payload of the triggering event, forwarded to every command.
    pub payload: serde_json::Value,
    pub failure_reason: Option<String>,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the reconciler should next look at this instance. `None` for
    /// pending and terminal instances.
    #[serde(default)]
    pub deadline_at: Option<DateTime<Utc>>,
}

impl SagaInstance {
    /// Creates a pending instance that has not been stored yet.
    pub fn new(
        saga_id: SagaKey,
        definition_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            definition_name: definition_name.into(),
            current_step_index: 0,
            status: SagaStatus::Pending,
            step_outcomes: Vec::new(),
            payload,
            failure_reason: None,
            version: Version::initial(),
            created_at: now,
            updated_at: now,
            deadline_at: None,
        }
    }

    /// Returns true if the instance reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the record for a step in a phase, if it was attempted.
    pub fn record(&self, phase: StepPhase, step_index: usize) -> Option<&StepRecord> {
        self.step_outcomes
            .iter()
            .find(|r| r.phase == phase && r.step_index == step_index)
    }

    /// Mutable access to the record for a step in a phase.
    pub fn record_mut(&mut self, phase: StepPhase, step_index: usize) -> Option<&mut StepRecord> {
        self.step_outcomes
            .iter_mut()
            .find(|r| r.phase == phase && r.step_index == step_index)
    }

    /// The unfinished record the saga is waiting on, if any.
    pub fn in_flight(&self) -> Option<&StepRecord> {
        let phase = self.status.phase()?;
        self.record(phase, self.current_step_index)
            .filter(|r| r.outcome.is_none())
    }

    /// Mutable access to the unfinished record the saga is waiting on.
    pub fn in_flight_mut(&mut self) -> Option<&mut StepRecord> {
        let phase = self.status.phase()?;
        let index = self.current_step_index;
        self.record_mut(phase, index).filter(|r| r.outcome.is_none())
    }

    /// Outcomes of the forward steps in step order.
    pub fn forward_outcomes(&self) -> Vec<Option<StepOutcome>> {
        self.records(StepPhase::Forward).map(|r| r.outcome).collect()
    }

    /// Outcomes of the compensation steps in the order they ran.
    pub fn compensation_outcomes(&self) -> Vec<(usize, Option<StepOutcome>)> {
        self.records(StepPhase::Compensation)
            .map(|r| (r.step_index, r.outcome))
            .collect()
    }

    /// The highest forward step below `before` that completed successfully.
    pub fn last_completed_before(&self, before: usize) -> Option<usize> {
        self.records(StepPhase::Forward)
            .filter(|r| r.step_index < before && r.succeeded())
            .map(|r| r.step_index)
            .max()
    }

    /// Outputs of successful forward steps, keyed by step name.
    pub fn context(&self) -> serde_json::Map<String, serde_json::Value> {
        self.records(StepPhase::Forward)
            .filter(|r| r.succeeded())
            .filter_map(|r| r.output.clone().map(|out| (r.step_name.clone(), out)))
            .collect()
    }

    fn records(&self, phase: StepPhase) -> impl Iterator<Item = &StepRecord> {
        self.step_outcomes.iter().filter(move |r| r.phase == phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> SagaInstance {
        SagaInstance::new(SagaKey::new("booking-1"), "booking-confirmation", serde_json::json!({}))
    }

    fn finished(index: usize, name: &str, phase: StepPhase, outcome: StepOutcome) -> StepRecord {
        StepRecord {
            outcome: Some(outcome),
            ..StepRecord::started(index, name, phase)
        }
    }

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(SagaStatus::default(), SagaStatus::Pending);
        assert_eq!(instance().status, SagaStatus::Pending);
        assert_eq!(instance().version, Version::initial());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SagaStatus::Pending.is_terminal());
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
    }

    #[test]
    fn test_can_run_and_compensate() {
        assert!(SagaStatus::Pending.can_run());
        assert!(!SagaStatus::Running.can_run());
        assert!(SagaStatus::Running.can_compensate());
        assert!(!SagaStatus::Compensating.can_compensate());
    }

    #[test]
    fn test_status_parse_roundtrip() {
        for status in SagaStatus::all() {
            let parsed: SagaStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert_eq!("running".parse::<SagaStatus>().unwrap(), SagaStatus::Running);
        assert!("DONE".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_like_database_column() {
        let json = serde_json::to_string(&SagaStatus::Compensating).unwrap();
        assert_eq!(json, "\"COMPENSATING\"");
    }

    #[test]
    fn test_last_completed_before_skips_failed_steps() {
        let mut saga = instance();
        saga.step_outcomes = vec![
            finished(0, "reserve_seats", StepPhase::Forward, StepOutcome::Success),
            finished(1, "capture_payment", StepPhase::Forward, StepOutcome::Success),
            finished(2, "confirm_booking", StepPhase::Forward, StepOutcome::Failed),
        ];

        assert_eq!(saga.last_completed_before(2), Some(1));
        assert_eq!(saga.last_completed_before(1), Some(0));
        assert_eq!(saga.last_completed_before(0), None);
    }

    #[test]
    fn test_context_collects_successful_outputs() {
        let mut saga = instance();
        let mut reserve = finished(0, "reserve_seats", StepPhase::Forward, StepOutcome::Success);
        reserve.output = Some(serde_json::json!({"reservation_id": "RES-1"}));
        let mut failed = finished(1, "capture_payment", StepPhase::Forward, StepOutcome::Failed);
        failed.output = Some(serde_json::json!({"ignored": true}));
        saga.step_outcomes = vec![reserve, failed];

        let context = saga.context();
        assert_eq!(context.len(), 1);
        assert_eq!(
            context.get("reserve_seats"),
            Some(&serde_json::json!({"reservation_id": "RES-1"}))
        );
    }

    #[test]
    fn test_forward_and_compensation_outcomes_are_separate() {
        let mut saga = instance();
        saga.step_outcomes = vec![
            finished(0, "reserve_seats", StepPhase::Forward, StepOutcome::Success),
            finished(1, "capture_payment", StepPhase::Forward, StepOutcome::TimedOut),
            finished(0, "reserve_seats", StepPhase::Compensation, StepOutcome::Success),
        ];

        assert_eq!(
            saga.forward_outcomes(),
            vec![Some(StepOutcome::Success), Some(StepOutcome::TimedOut)]
        );
        assert_eq!(
            saga.compensation_outcomes(),
            vec![(0, Some(StepOutcome::Success))]
        );
        assert!(saga.record(StepPhase::Compensation, 1).is_none());
    }

    #[test]
    fn test_in_flight_follows_status_and_cursor() {
        let mut saga = instance();
        saga.step_outcomes = vec![
            finished(0, "reserve_seats", StepPhase::Forward, StepOutcome::Success),
            StepRecord::started(1, "capture_payment", StepPhase::Forward),
        ];
        assert!(saga.in_flight().is_none());

        saga.status = SagaStatus::Running;
        saga.current_step_index = 1;
        let record = saga.in_flight().unwrap();
        assert_eq!(record.step_name, "capture_payment");
        assert!(!record.dispatched);

        saga.status = SagaStatus::Compensating;
        assert!(saga.in_flight().is_none());
    }

    #[test]
    fn test_records_without_dispatch_flag_deserialize() {
        let json = r#"{"step_index":0,"step_name":"reserve_seats","phase":"forward","outcome":null,"attempts":1}"#;
        let record: StepRecord = serde_json::from_str(json).unwrap();
        assert!(!record.dispatched);
    }

    #[test]
    fn test_serialization() {
        let mut saga = instance();
        saga.step_outcomes
            .push(StepRecord::started(0, "reserve_seats", StepPhase::Forward));

        let json = serde_json::to_string(&saga).unwrap();
        let deserialized: SagaInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, saga);
    }
}
