//! The JSON envelope every message on the wire is wrapped in.

use chrono::{DateTime, Utc};
use common::{EventId, SagaKey};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{MessagingError, Result};

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u32 = 1;

/// An event as it travels over the broker.
///
/// Triggers, step commands and step results all share this shape. The
/// `data` object is event-specific; routing only looks at `event_type`
/// and at the saga key found inside `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique ID used for consumer-side deduplication.
    pub event_id: EventId,
    /// Dotted event type, e.g. `payment.succeeded`.
    pub event_type: String,
    /// When the producer created the event.
    pub occurred_at: DateTime<Utc>,
    /// Envelope schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Event-specific body.
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_version() -> u32 {
    ENVELOPE_VERSION
}

impl EventEnvelope {
    /// Creates an envelope with a fresh event ID stamped now.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            occurred_at: Utc::now(),
            version: ENVELOPE_VERSION,
            data,
        }
    }

    /// Creates an envelope by serializing a typed body.
    pub fn from_payload<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    /// Replaces the generated event ID.
    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    /// Deserializes `data` into a typed body.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Extracts the saga key used for partitioning and instance lookup.
    ///
    /// `data.saga_key` wins over `data.booking_id`.
    pub fn saga_key(&self) -> Result<SagaKey> {
        ["saga_key", "booking_id"]
            .iter()
            .find_map(|field| self.data.get(field).and_then(|v| v.as_str()))
            .filter(|key| !key.is_empty())
            .map(SagaKey::from)
            .ok_or(MessagingError::MissingSagaKey {
                event_id: self.event_id,
            })
    }

    /// Encodes the envelope as JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes an envelope from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
