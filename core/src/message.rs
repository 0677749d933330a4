//! Wire-level message envelope.
//!
//! Every payload that crosses the broker or sits in the outbox travels inside a
//! [`Message`]: a unique id, the serialized payload bytes, and string metadata.
//!
//! # Envelope Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Message                                      │
//! │  id:        UUID (unique per publication)    │
//! │  payload:   JSON bytes (header + body)       │
//! │  metadata:  type            → "BookingMade"  │
//! │             correlation_id  → "…"            │
//! │             destination_topic (outbox only)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The `type` entry names the payload so consumers can reject envelopes that
//! do not match the type they deserialize into.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Metadata key holding the payload's logical type name.
pub const TYPE_KEY: &str = "type";

/// Metadata key holding the correlation id of the logical operation.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Metadata key set on outbox rows: the broker topic the row is relayed to.
pub const DESTINATION_TOPIC_KEY: &str = "destination_topic";

/// String metadata attached to a [`Message`].
///
/// Backed by a `BTreeMap` so serialized envelopes are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Create empty metadata.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Get a metadata value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set a metadata value, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Remove a metadata value, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Convert to a JSON object (used by SQL adapters storing `JSONB`).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }

    /// Build metadata from a JSON object.
    ///
    /// Non-string values are stored using their JSON text.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut metadata = Self::new();
        if let serde_json::Value::Object(map) = value {
            for (key, value) in map {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                metadata.set(key.clone(), value);
            }
        }
        metadata
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A message as stored in the outbox and carried by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id of this publication.
    pub id: Uuid,

    /// Serialized payload (header and body).
    pub payload: Vec<u8>,

    /// String metadata (type, correlation id, ...).
    pub metadata: Metadata,
}

impl Message {
    /// Create a message with a fresh id and empty metadata.
    #[must_use]
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            metadata: Metadata::new(),
        }
    }

    /// Create a message with explicit parts.
    #[must_use]
    pub const fn from_parts(id: Uuid, payload: Vec<u8>, metadata: Metadata) -> Self {
        Self {
            id,
            payload,
            metadata,
        }
    }

    /// The payload type name recorded in metadata, if any.
    #[must_use]
    pub fn payload_type(&self) -> Option<&str> {
        self.metadata.get(TYPE_KEY)
    }

    /// The correlation id recorded in metadata, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata
            .get(CORRELATION_ID_KEY)
            .filter(|id| !id.is_empty())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message(id={}, type={}, {} bytes)",
            self.id,
            self.payload_type().unwrap_or("<untyped>"),
            self.payload.len()
        )
    }
}
