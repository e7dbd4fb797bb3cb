//! Wire contracts between the orchestrator and the outside world.
//!
//! Outbound: one [`StepCommand`] per step attempt, with the event type taken
//! from the step's forward or compensate command. Inbound: triggers that
//! start sagas, and [`StepResult`]s on two separate channels for forward
//! steps and compensations.

use common::SagaKey;
use messaging::EventEnvelope;
use saga_store::{SagaInstance, StepOutcome, StepPhase};
use serde::{Deserialize, Serialize};

use crate::triggers::TriggerBindings;
use crate::{Result, SagaDefinition, SagaError};

/// Event type of forward step results.
pub const STEP_RESULT: &str = "saga.step.result";
/// Event type of compensation results.
pub const COMPENSATION_RESULT: &str = "saga.compensation.result";
/// Event type of explicit start requests naming a definition.
pub const SAGA_START: &str = "saga.start";

/// Instruction to a step executor to run (or undo) one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCommand {
    pub saga_key: SagaKey,
    pub definition: String,
    pub step_index: usize,
    pub step_name: String,
    pub phase: StepPhase,
    /// 1-based attempt number; results must echo it.
    pub attempt: u32,
    /// Payload of the event that started the saga.
    pub payload: serde_json::Value,
    /// Outputs of completed forward steps keyed by step name.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl StepCommand {
    /// Builds the command for the in-flight attempt of a step.
    pub(crate) fn for_step(
        definition: &SagaDefinition,
        instance: &SagaInstance,
        step_index: usize,
        phase: StepPhase,
        attempt: u32,
    ) -> Result<EventEnvelope> {
        let step = definition.step(step_index).ok_or_else(|| {
            SagaError::InvalidEvent(format!(
                "step {step_index} out of range for {}",
                definition.name()
            ))
        })?;

        let event_type = match phase {
            StepPhase::Forward => &step.forward_command,
            StepPhase::Compensation => &step.compensate_command,
        };

        let command = StepCommand {
            saga_key: instance.saga_id.clone(),
            definition: definition.name().to_string(),
            step_index,
            step_name: step.name.clone(),
            phase,
            attempt,
            payload: instance.payload.clone(),
            context: instance.context(),
        };

        Ok(EventEnvelope::from_payload(event_type.as_str(), &command)?)
    }

    /// Event type a result for this command is published under.
    pub fn result_event_type(&self) -> &'static str {
        match self.phase {
            StepPhase::Forward => STEP_RESULT,
            StepPhase::Compensation => COMPENSATION_RESULT,
        }
    }
}

/// Outcome of one step attempt as reported by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub saga_key: SagaKey,
    pub step_index: usize,
    /// Attempt the result answers. Results without it are matched to the
    /// current attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    /// A result answering `command`.
    pub fn answering(command: &StepCommand, outcome: StepOutcome) -> Self {
        Self {
            saga_key: command.saga_key.clone(),
            step_index: command.step_index,
            attempt: Some(command.attempt),
            outcome,
            output: None,
            error: None,
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Body of a [`SAGA_START`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    pub definition: String,
    pub saga_key: SagaKey,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Every inbound event the orchestrator understands.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Start (or idempotently re-start) a saga.
    Start(StartRequest),
    /// Result of a forward step.
    StepResult(StepResult),
    /// Result of a compensation step.
    CompensationResult(StepResult),
    /// An event type nothing is bound to.
    Unknown { event_type: String },
}

impl InboundEvent {
    /// Classifies and decodes an envelope.
    pub fn decode(envelope: &EventEnvelope, triggers: &TriggerBindings) -> Result<Self> {
        let invalid = |e: messaging::MessagingError| {
            SagaError::InvalidEvent(format!("{}: {e}", envelope.event_type))
        };

        match envelope.event_type.as_str() {
            STEP_RESULT => Ok(InboundEvent::StepResult(
                envelope.data_as().map_err(invalid)?,
            )),
            COMPENSATION_RESULT => Ok(InboundEvent::CompensationResult(
                envelope.data_as().map_err(invalid)?,
            )),
            SAGA_START => Ok(InboundEvent::Start(envelope.data_as().map_err(invalid)?)),
            event_type => match triggers.binding_for(event_type) {
                Some(binding) => {
                    let key = envelope.saga_key().map_err(invalid)?;
                    Ok(InboundEvent::Start(StartRequest {
                        definition: binding.definition.clone(),
                        saga_key: binding.scoped_key(&key),
                        payload: envelope.data.clone(),
                    }))
                }
                None => Ok(InboundEvent::Unknown {
                    event_type: event_type.to_string(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::triggers::TriggerBinding;
    use serde_json::json;

    fn triggers() -> TriggerBindings {
        TriggerBindings::new()
            .bind(TriggerBinding::new("payment.succeeded", "booking-confirmation"))
            .bind(TriggerBinding::new("booking.expired", "booking-expiry").scoped("expiry"))
    }

    #[test]
    fn decodes_step_results() {
        let envelope = EventEnvelope::new(
            STEP_RESULT,
            json!({"saga_key": "b-1", "step_index": 2, "outcome": "SUCCESS", "output": {"x": 1}}),
        );
        let event = InboundEvent::decode(&envelope, &triggers()).unwrap();
        let InboundEvent::StepResult(result) = event else {
            panic!("expected step result, got {event:?}");
        };
        assert_eq!(result.step_index, 2);
        assert_eq!(result.outcome, StepOutcome::Success);
        assert_eq!(result.attempt, None);
    }

    #[test]
    fn decodes_compensation_results_separately() {
        let envelope = EventEnvelope::new(
            COMPENSATION_RESULT,
            json!({"saga_key": "b-1", "step_index": 0, "attempt": 2, "outcome": "FAILED"}),
        );
        assert!(matches!(
            InboundEvent::decode(&envelope, &triggers()).unwrap(),
            InboundEvent::CompensationResult(StepResult { attempt: Some(2), .. })
        ));
    }

    #[test]
    fn bound_triggers_become_start_requests() {
        let envelope = EventEnvelope::new(
            "booking.expired",
            json!({"booking_id": "b-1", "seats": ["A1"]}),
        );
        let InboundEvent::Start(start) = InboundEvent::decode(&envelope, &triggers()).unwrap()
        else {
            panic!("expected start");
        };
        assert_eq!(start.definition, "booking-expiry");
        assert_eq!(start.saga_key, SagaKey::new("expiry:b-1"));
        assert_eq!(start.payload["seats"], json!(["A1"]));
    }

    #[test]
    fn unbound_types_are_unknown() {
        let envelope = EventEnvelope::new("seat.viewed", json!({"booking_id": "b-1"}));
        assert_eq!(
            InboundEvent::decode(&envelope, &triggers()).unwrap(),
            InboundEvent::Unknown {
                event_type: "seat.viewed".to_string()
            }
        );
    }

    #[test]
    fn malformed_results_are_invalid() {
        let envelope = EventEnvelope::new(STEP_RESULT, json!({"saga_key": "b-1"}));
        assert!(matches!(
            InboundEvent::decode(&envelope, &triggers()),
            Err(SagaError::InvalidEvent(_))
        ));

        let envelope = EventEnvelope::new("payment.succeeded", json!({"amount": 3}));
        assert!(matches!(
            InboundEvent::decode(&envelope, &triggers()),
            Err(SagaError::InvalidEvent(_))
        ));
    }
}
