//! Bindings from trigger event types to the sagas they start.

use common::SagaKey;

/// Starts `definition` whenever an event of `event_type` arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerBinding {
    pub event_type: String,
    pub definition: String,
    /// Prefix that keeps several sagas per booking apart, e.g. `expiry`.
    pub key_scope: Option<String>,
}

impl TriggerBinding {
    pub fn new(event_type: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            definition: definition.into(),
            key_scope: None,
        }
    }

    /// Scopes instance keys as `{scope}:{key}`.
    pub fn scoped(mut self, scope: impl Into<String>) -> Self {
        self.key_scope = Some(scope.into());
        self
    }

    /// Key of the instance this binding starts for an event's saga key.
    pub fn scoped_key(&self, key: &SagaKey) -> SagaKey {
        match &self.key_scope {
            Some(scope) => SagaKey::scoped(scope, key.as_str()),
            None => key.clone(),
        }
    }
}

/// Ordered set of trigger bindings; the first match wins.
#[derive(Debug, Clone, Default)]
pub struct TriggerBindings {
    bindings: Vec<TriggerBinding>,
}

impl TriggerBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, binding: TriggerBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn binding_for(&self, event_type: &str) -> Option<&TriggerBinding> {
        self.bindings.iter().find(|b| b.event_type == event_type)
    }

    /// Trigger event types, in binding order.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().map(|b| b.event_type.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unscoped_binding_keeps_key() {
        let binding = TriggerBinding::new("payment.succeeded", "booking-confirmation");
        assert_eq!(binding.scoped_key(&SagaKey::new("b-1")), SagaKey::new("b-1"));
    }

    #[test]
    fn scoped_binding_prefixes_key() {
        let binding = TriggerBinding::new("booking.cancelled", "booking-cancellation").scoped("cancel");
        assert_eq!(
            binding.scoped_key(&SagaKey::new("b-1")),
            SagaKey::new("cancel:b-1")
        );
    }

    #[test]
    fn first_matching_binding_wins() {
        let bindings = TriggerBindings::new()
            .bind(TriggerBinding::new("x", "first"))
            .bind(TriggerBinding::new("x", "second"));
        assert_eq!(bindings.binding_for("x").unwrap().definition, "first");
        assert!(bindings.binding_for("y").is_none());
        assert_eq!(bindings.event_types().collect::<Vec<_>>(), vec!["x", "x"]);
    }
}
