//! Message headers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ticketflow_core::environment::Clock;
use uuid::Uuid;

/// Header carried by every event and command.
///
/// Created once per logical business action and never changed after
/// publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Unique id of the action.
    pub id: Uuid,
    /// When the action was published.
    pub published_at: DateTime<Utc>,
    /// Key downstream effects deduplicate on.
    #[serde(default)]
    pub idempotency_key: String,
}

/// Header of an event.
pub type EventHeader = Header;

/// Header of a command.
pub type CommandHeader = Header;

impl Header {
    /// Create a header stamped with the clock's current time.
    #[must_use]
    pub fn new(clock: &dyn Clock, idempotency_key: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            published_at: clock.now(),
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Key the effects triggered by this message are deduplicated on.
    ///
    /// The idempotency key when present, otherwise the header id (which a
    /// redelivered message keeps).
    #[must_use]
    pub fn effect_key(&self) -> String {
        if self.idempotency_key.is_empty() {
            self.id.to_string()
        } else {
            self.idempotency_key.clone()
        }
    }
}

/// Idempotency key of an event fanned out from one request for one entity.
///
/// Deterministic, so a retried request produces the same key. The request
/// key is length-prefixed, so distinct `(request_key, entity_id)` pairs never
/// yield the same key whatever characters the caller's key contains.
#[must_use]
pub fn derived_idempotency_key(request_key: &str, entity_id: &str) -> String {
    format!("{}:{request_key}{entity_id}", request_key.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ticketflow_core::environment::SystemClock;

    #[test]
    fn derived_key_is_deterministic() {
        assert_eq!(derived_idempotency_key("req-1", "t-1"), "5:req-1t-1");
        assert_eq!(
            derived_idempotency_key("req-1", "t-1"),
            derived_idempotency_key("req-1", "t-1")
        );
    }

    #[test]
    fn derived_keys_of_different_splits_differ() {
        assert_ne!(
            derived_idempotency_key("req-1", "1t-1"),
            derived_idempotency_key("req-11", "t-1")
        );
        assert_ne!(
            derived_idempotency_key("1:a", "b"),
            derived_idempotency_key("1", ":ab")
        );
        assert_ne!(derived_idempotency_key("", "5:req-1t-1"), derived_idempotency_key("req-1", "t-1"));
    }

    #[test]
    fn headers_get_distinct_ids() {
        let a = Header::new(&SystemClock, "k");
        let b = Header::new(&SystemClock, "k");
        assert_ne!(a.id, b.id);
        assert_eq!(a.idempotency_key, b.idempotency_key);
    }

    #[test]
    fn effect_key_falls_back_to_header_id() {
        let keyed = Header::new(&SystemClock, "req-1t-1");
        assert_eq!(keyed.effect_key(), "req-1t-1");

        let unkeyed = Header::new(&SystemClock, "");
        assert_eq!(unkeyed.effect_key(), unkeyed.id.to_string());
    }
}
