use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Business identifier of a saga instance.
///
/// The key doubles as the saga's identity in the store and as the
/// partition/routing key on the message broker, so every event for one
/// saga lands on the same partition. Usually a booking ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaKey(String);

impl SagaKey {
    /// Creates a saga key from any string-like value.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Creates a key scoped to a logical namespace, e.g. `expiry:booking-1`.
    pub fn scoped(scope: &str, key: &str) -> Self {
        Self(format!("{scope}:{key}"))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the key bytes used for partitioning.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for SagaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SagaKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for SagaKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Globally unique identifier of one event emission; the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Optimistic concurrency token of a persisted saga instance.
///
/// A freshly created instance is at version 1; every successful
/// compare-and-swap moves it to the next version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns version 0, the version of nothing stored yet.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns version 1, assigned on creation.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saga_key_scoped_formats_namespace() {
        let key = SagaKey::scoped("expiry", "booking-1");
        assert_eq!(key.as_str(), "expiry:booking-1");
    }

    #[test]
    fn saga_key_serializes_as_plain_string() {
        let key = SagaKey::new("booking-42");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"booking-42\"");
    }

    #[test]
    fn event_id_new_creates_unique_ids() {
        assert_ne!(EventId::new(), EventId::new());
    }

    #[test]
    fn version_ordering_and_next() {
        let v = Version::first();
        assert_eq!(v.next(), Version::new(2));
        assert!(v.next() > v);
        assert_eq!(Version::initial().as_i64(), 0);
    }
}
