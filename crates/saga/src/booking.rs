//! Booking saga definitions and their triggers.

use std::time::Duration;

use crate::events::{COMPENSATION_RESULT, SAGA_START, STEP_RESULT};
use crate::triggers::{TriggerBinding, TriggerBindings};
use crate::{DefinitionRegistry, Result, SagaDefinition};

/// Confirms a paid booking: reserve seats, capture payment, confirm.
pub const BOOKING_CONFIRMATION: &str = "booking-confirmation";
/// Releases an unpaid booking once its hold expires.
pub const BOOKING_EXPIRY: &str = "booking-expiry";
/// Undoes a booking the customer cancelled.
pub const BOOKING_CANCELLATION: &str = "booking-cancellation";

pub const STEP_RESERVE_SEATS: &str = "reserve_seats";
pub const STEP_CAPTURE_PAYMENT: &str = "capture_payment";
pub const STEP_CONFIRM_BOOKING: &str = "confirm_booking";
pub const STEP_RELEASE_SEATS: &str = "release_seats";
pub const STEP_EXPIRE_BOOKING: &str = "expire_booking";
pub const STEP_REFUND_PAYMENT: &str = "refund_payment";
pub const STEP_CANCEL_BOOKING: &str = "cancel_booking";

pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
pub const BOOKING_EXPIRED: &str = "booking.expired";
pub const BOOKING_CANCELLED: &str = "booking.cancelled";

const SHORT: Duration = Duration::from_secs(30);
const PAYMENT: Duration = Duration::from_secs(60);

pub fn booking_confirmation() -> Result<SagaDefinition> {
    SagaDefinition::builder(BOOKING_CONFIRMATION)
        .add_step(STEP_RESERVE_SEATS, "seats.reserve", "seats.release", SHORT, 2)
        .add_step(STEP_CAPTURE_PAYMENT, "payment.capture", "payment.refund", PAYMENT, 3)
        .add_step(STEP_CONFIRM_BOOKING, "booking.confirm", "booking.cancel", SHORT, 2)
        .build()
}

pub fn booking_expiry() -> Result<SagaDefinition> {
    SagaDefinition::builder(BOOKING_EXPIRY)
        .add_step(STEP_RELEASE_SEATS, "seats.release", "seats.reserve", SHORT, 3)
        .add_step(STEP_EXPIRE_BOOKING, "booking.expire", "booking.restore", SHORT, 3)
        .build()
}

pub fn booking_cancellation() -> Result<SagaDefinition> {
    SagaDefinition::builder(BOOKING_CANCELLATION)
        .add_step(STEP_RELEASE_SEATS, "seats.release", "seats.reserve", SHORT, 3)
        .add_step(STEP_REFUND_PAYMENT, "payment.refund", "payment.capture", PAYMENT, 3)
        .add_step(STEP_CANCEL_BOOKING, "booking.cancel", "booking.restore", SHORT, 3)
        .build()
}

/// Registry holding all booking sagas.
pub fn registry() -> Result<DefinitionRegistry> {
    let mut registry = DefinitionRegistry::new();
    registry.register(booking_confirmation()?)?;
    registry.register(booking_expiry()?)?;
    registry.register(booking_cancellation()?)?;
    Ok(registry)
}

/// Expiry and cancellation get their own key scope so they can coexist with
/// the confirmation saga of the same booking.
pub fn trigger_bindings() -> TriggerBindings {
    TriggerBindings::new()
        .bind(TriggerBinding::new(PAYMENT_SUCCEEDED, BOOKING_CONFIRMATION))
        .bind(TriggerBinding::new(BOOKING_EXPIRED, BOOKING_EXPIRY).scoped("expiry"))
        .bind(TriggerBinding::new(BOOKING_CANCELLED, BOOKING_CANCELLATION).scoped("cancel"))
}

/// Every event type the orchestrator consumes: triggers, explicit starts
/// and both result channels.
pub fn orchestrator_event_types(triggers: &TriggerBindings) -> Vec<&str> {
    let mut types: Vec<&str> = triggers.event_types().collect();
    types.extend([SAGA_START, STEP_RESULT, COMPENSATION_RESULT]);
    types
}
