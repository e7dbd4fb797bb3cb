//! Pure saga state machine.
//!
//! Each function takes the current instance and returns the next one plus
//! the commands to emit once it is persisted. Nothing here does I/O, so the
//! orchestrator can re-run a decision after losing a compare-and-swap race.

use std::time::Duration;

use chrono::{DateTime, Utc};
use messaging::EventEnvelope;
use saga_store::{SagaInstance, SagaStatus, StepOutcome, StepPhase, StepRecord};

use crate::events::{StepCommand, StepResult};
use crate::{Result, SagaDefinition, SagaError};

/// What a transition decided.
#[derive(Debug)]
pub(crate) enum Decision {
    /// Nothing to write.
    Unchanged(SagaInstance),
    /// Persist `instance`, then emit `commands`.
    Persist {
        instance: SagaInstance,
        commands: Vec<EventEnvelope>,
    },
}

/// Identifies one emitted attempt of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dispatch {
    pub phase: StepPhase,
    pub step_index: usize,
    pub attempt: u32,
}

impl Dispatch {
    /// The attempt the instance is currently waiting on.
    pub fn of(instance: &SagaInstance) -> Option<Self> {
        instance.in_flight().map(|record| Self {
            phase: record.phase,
            step_index: record.step_index,
            attempt: record.attempts,
        })
    }

    fn matches(&self, record: &StepRecord) -> bool {
        record.phase == self.phase
            && record.step_index == self.step_index
            && record.attempts == self.attempt
    }
}

/// Moves a pending instance to running and issues step 0.
pub(crate) fn begin(definition: &SagaDefinition, mut instance: SagaInstance) -> Result<Decision> {
    if instance.status != SagaStatus::Pending {
        return Ok(Decision::Unchanged(instance));
    }

    let first = definition
        .step(0)
        .ok_or_else(|| SagaError::EmptyDefinition {
            name: definition.name().to_string(),
        })?;

    instance.status = SagaStatus::Running;
    instance.current_step_index = 0;
    instance
        .step_outcomes
        .push(StepRecord::started(0, &first.name, StepPhase::Forward));

    let command = StepCommand::for_step(definition, &instance, 0, StepPhase::Forward, 1)?;
    Ok(Decision::Persist {
        instance,
        commands: vec![command],
    })
}

/// Applies a forward step result.
pub(crate) fn forward_result(
    definition: &SagaDefinition,
    mut instance: SagaInstance,
    result: &StepResult,
) -> Result<Decision> {
    if instance.status != SagaStatus::Running {
        return Err(SagaError::stale(
            &instance.saga_id,
            result.step_index,
            format!("saga is {}", instance.status),
        ));
    }
    check_in_flight(&instance, StepPhase::Forward, result)?;

    let index = result.step_index;
    let step = step_spec(definition, index)?;
    let record = in_flight_record(&mut instance, StepPhase::Forward, index)?;

    if result.outcome == StepOutcome::Success {
        record.outcome = Some(StepOutcome::Success);
        record.output = result.output.clone();
        record.last_error = None;

        if definition.is_last(index) {
            instance.status = SagaStatus::Completed;
            return Ok(Decision::Persist {
                instance,
                commands: Vec::new(),
            });
        }

        let next = index + 1;
        let next_step = step_spec(definition, next)?;
        instance.current_step_index = next;
        instance
            .step_outcomes
            .push(StepRecord::started(next, &next_step.name, StepPhase::Forward));
        let command = StepCommand::for_step(definition, &instance, next, StepPhase::Forward, 1)?;
        return Ok(Decision::Persist {
            instance,
            commands: vec![command],
        });
    }

    let error = failure_message(result);
    record.last_error = Some(error.clone());

    if record.attempts < step.max_attempts() {
        record.attempts += 1;
        record.dispatched = false;
        let attempt = record.attempts;
        metrics::counter!("saga_step_retries_total", "step" => step.name.clone()).increment(1);
        tracing::info!(step = %step.name, attempt, %error, "retrying step");
        let command = StepCommand::for_step(definition, &instance, index, StepPhase::Forward, attempt)?;
        return Ok(Decision::Persist {
            instance,
            commands: vec![command],
        });
    }

    record.outcome = Some(result.outcome);
    let reason = format!(
        "step {} {} after {} attempt(s): {error}",
        step.name,
        outcome_verb(result.outcome),
        record.attempts
    );
    tracing::warn!(step = %step.name, %reason, "step exhausted, compensating");
    instance.failure_reason = Some(reason);
    instance.status = SagaStatus::Compensating;
    compensate_from(definition, instance, index)
}

/// Applies a compensation result.
pub(crate) fn compensation_result(
    definition: &SagaDefinition,
    mut instance: SagaInstance,
    result: &StepResult,
) -> Result<Decision> {
    if instance.status != SagaStatus::Compensating {
        return Err(SagaError::stale(
            &instance.saga_id,
            result.step_index,
            format!("saga is {}", instance.status),
        ));
    }
    check_in_flight(&instance, StepPhase::Compensation, result)?;

    let index = result.step_index;
    let step = step_spec(definition, index)?;
    let record = in_flight_record(&mut instance, StepPhase::Compensation, index)?;

    if result.outcome == StepOutcome::Success {
        record.outcome = Some(StepOutcome::Success);
        record.output = result.output.clone();
        record.last_error = None;
        return compensate_from(definition, instance, index);
    }

    let error = failure_message(result);
    record.last_error = Some(error.clone());

    if record.attempts < step.max_attempts() {
        record.attempts += 1;
        record.dispatched = false;
        let attempt = record.attempts;
        metrics::counter!("saga_step_retries_total", "step" => step.name.clone()).increment(1);
        tracing::info!(step = %step.name, attempt, %error, "retrying compensation");
        let command =
            StepCommand::for_step(definition, &instance, index, StepPhase::Compensation, attempt)?;
        return Ok(Decision::Persist {
            instance,
            commands: vec![command],
        });
    }

    record.outcome = Some(result.outcome);
    let reason = format!(
        "compensation of {} {} after {} attempt(s): {error}",
        step.name,
        outcome_verb(result.outcome),
        record.attempts
    );
    tracing::error!(step = %step.name, %reason, "compensation exhausted, saga needs manual intervention");
    instance.failure_reason = Some(match instance.failure_reason.take() {
        Some(original) => format!("{original}; {reason}"),
        None => reason,
    });
    instance.status = SagaStatus::Failed;
    Ok(Decision::Persist {
        instance,
        commands: Vec::new(),
    })
}

/// Issues the compensation of the last successful forward step before
/// `before`, or finishes as compensated when none is left.
fn compensate_from(
    definition: &SagaDefinition,
    mut instance: SagaInstance,
    before: usize,
) -> Result<Decision> {
    let Some(index) = instance.last_completed_before(before) else {
        instance.status = SagaStatus::Compensated;
        return Ok(Decision::Persist {
            instance,
            commands: Vec::new(),
        });
    };

    let step = step_spec(definition, index)?;
    instance.current_step_index = index;
    instance
        .step_outcomes
        .push(StepRecord::started(index, &step.name, StepPhase::Compensation));
    let command = StepCommand::for_step(definition, &instance, index, StepPhase::Compensation, 1)?;
    Ok(Decision::Persist {
        instance,
        commands: vec![command],
    })
}

/// Issues the in-flight command again when its publish was never confirmed.
///
/// The attempt number is unchanged, so no retry budget is spent.
pub(crate) fn redispatch(definition: &SagaDefinition, instance: SagaInstance) -> Result<Decision> {
    let Some(record) = instance.in_flight() else {
        return Err(SagaError::stale(
            &instance.saga_id,
            instance.current_step_index,
            format!("saga is {} with nothing in flight", instance.status),
        ));
    };
    if record.dispatched {
        return Err(SagaError::stale(
            &instance.saga_id,
            record.step_index,
            "command already published",
        ));
    }

    let (phase, index, attempt) = (record.phase, record.step_index, record.attempts);
    tracing::info!(step = %record.step_name, attempt, "publishing unconfirmed command again");
    let command = StepCommand::for_step(definition, &instance, index, phase, attempt)?;
    Ok(Decision::Persist {
        instance,
        commands: vec![command],
    })
}

/// Marks `dispatch` as published if it is still the attempt in flight.
pub(crate) fn confirm_dispatch(mut instance: SagaInstance, dispatch: &Dispatch) -> Decision {
    let confirmed = match instance.in_flight_mut() {
        Some(record) if dispatch.matches(record) && !record.dispatched => {
            record.dispatched = true;
            true
        }
        _ => false,
    };

    if confirmed {
        Decision::Persist {
            instance,
            commands: Vec::new(),
        }
    } else {
        Decision::Unchanged(instance)
    }
}

/// When the reconciler should next act on `instance`.
///
/// A published attempt gets its step timeout; an unconfirmed one only
/// `grace`, after which its command is published again.
pub(crate) fn deadline(
    definition: &SagaDefinition,
    instance: &SagaInstance,
    now: DateTime<Utc>,
    grace: Duration,
) -> Option<DateTime<Utc>> {
    let record = instance.in_flight()?;
    let wait = if record.dispatched {
        definition.step(record.step_index)?.timeout
    } else {
        grace
    };
    now.checked_add_signed(chrono::Duration::from_std(wait).ok()?)
}

/// Rejects results that do not answer the attempt currently in flight.
fn check_in_flight(instance: &SagaInstance, phase: StepPhase, result: &StepResult) -> Result<()> {
    let stale = |reason: String| SagaError::stale(&instance.saga_id, result.step_index, reason);

    if result.step_index != instance.current_step_index {
        return Err(stale(format!(
            "current step is {}",
            instance.current_step_index
        )));
    }

    let record = instance
        .record(phase, result.step_index)
        .ok_or_else(|| stale("step was never started".to_string()))?;

    if let Some(outcome) = record.outcome {
        return Err(stale(format!("step already finished as {outcome:?}")));
    }

    // An unpublished command cannot time out; it is published again instead.
    if result.outcome == StepOutcome::TimedOut && !record.dispatched {
        return Err(stale("command was never published".to_string()));
    }

    if let Some(attempt) = result.attempt
        && attempt != record.attempts
    {
        return Err(stale(format!(
            "attempt {attempt} superseded by attempt {}",
            record.attempts
        )));
    }

    Ok(())
}

fn in_flight_record(
    instance: &mut SagaInstance,
    phase: StepPhase,
    index: usize,
) -> Result<&mut StepRecord> {
    let saga_id = instance.saga_id.clone();
    instance
        .record_mut(phase, index)
        .ok_or_else(|| SagaError::stale(&saga_id, index, "step was never started"))
}

fn step_spec(definition: &SagaDefinition, index: usize) -> Result<&crate::StepSpec> {
    definition.step(index).ok_or_else(|| {
        SagaError::InvalidEvent(format!(
            "step {index} out of range for {}",
            definition.name()
        ))
    })
}

fn failure_message(result: &StepResult) -> String {
    match (&result.error, result.outcome) {
        (Some(error), _) => error.clone(),
        (None, StepOutcome::TimedOut) => "no result before timeout".to_string(),
        (None, _) => "step reported failure".to_string(),
    }
}

fn outcome_verb(outcome: StepOutcome) -> &'static str {
    match outcome {
        StepOutcome::TimedOut => "timed out",
        _ => "failed",
    }
}
