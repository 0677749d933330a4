//! Document storage for read models.
//!
//! A read model keeps one JSON document per aggregate (e.g. one per booking).
//! Documents are created once and then updated through a merge function that
//! sees the current document and returns the next one:
//!
//! ```text
//! insert_if_absent(key, doc)       first event creates, replays are ignored
//! update(lookup, merge)            read ─► merge ─► write, atomically
//!   lookup = Key(booking_id)
//!          | Member { collection: "tickets", member: ticket_id }
//! ```
//!
//! [`DocumentError::NotFound`] from `update` means the creating event has not
//! been projected yet; callers treat it as retryable.

use serde_json::Value;
use std::future::Future;
use thiserror::Error;

/// Errors from document stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// No document matched the lookup.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// A concurrent update won; the operation can be retried.
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    /// The merge function rejected the document or it could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),
}

impl DocumentError {
    /// Whether retrying the operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

/// How to find the document to update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// By document key.
    Key(String),
    /// By membership: the document whose `collection` object has a `member` key.
    Member {
        /// Top-level field holding a JSON object
        collection: String,
        /// Key inside that object
        member: String,
    },
}

impl Lookup {
    /// Lookup by document key.
    #[must_use]
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    /// Lookup by membership in a top-level object field.
    #[must_use]
    pub fn member(collection: impl Into<String>, member: impl Into<String>) -> Self {
        Self::Member {
            collection: collection.into(),
            member: member.into(),
        }
    }

    /// Whether `document` (stored under `key`) matches.
    #[must_use]
    pub fn matches(&self, key: &str, document: &Value) -> bool {
        match self {
            Self::Key(wanted) => wanted == key,
            Self::Member { collection, member } => document
                .get(collection)
                .and_then(Value::as_object)
                .is_some_and(|members| members.contains_key(member)),
        }
    }
}

impl std::fmt::Display for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key {key}"),
            Self::Member { collection, member } => write!(f, "{collection} member {member}"),
        }
    }
}

/// Storage of JSON documents keyed by aggregate id.
pub trait DocumentStore: Send + Sync {
    /// Store `document` under `key` unless a document already exists.
    /// Returns whether it was inserted.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Storage`] on backend failure.
    fn insert_if_absent(
        &self,
        key: &str,
        document: &Value,
    ) -> impl Future<Output = Result<bool, DocumentError>> + Send;

    /// Fetch the document matching `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Storage`] on backend failure.
    fn get(&self, lookup: &Lookup) -> impl Future<Output = Result<Option<Value>, DocumentError>> + Send;

    /// Atomically replace the document matching `lookup` with
    /// `merge(current)`. Returns the stored document.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::NotFound`] when nothing matches,
    /// [`DocumentError::Conflict`] when a concurrent update won, or the error
    /// returned by `merge`.
    fn update<F>(
        &self,
        lookup: &Lookup,
        merge: F,
    ) -> impl Future<Output = Result<Value, DocumentError>> + Send
    where
        F: FnOnce(Value) -> Result<Value, DocumentError> + Send;

    /// Every stored document, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::Storage`] on backend failure.
    fn all(&self) -> impl Future<Output = Result<Vec<Value>, DocumentError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn member_lookup_checks_object_keys() {
        let document = json!({ "booking_id": "b-1", "tickets": { "t-1": {} } });

        assert!(Lookup::member("tickets", "t-1").matches("b-1", &document));
        assert!(!Lookup::member("tickets", "t-2").matches("b-1", &document));
        assert!(Lookup::key("b-1").matches("b-1", &document));
        assert!(!Lookup::key("b-2").matches("b-1", &document));
    }

    #[test]
    fn only_serialization_errors_are_final() {
        assert!(DocumentError::NotFound("b-1".to_string()).is_retryable());
        assert!(DocumentError::Conflict("b-1".to_string()).is_retryable());
        assert!(!DocumentError::Serialization("bad".to_string()).is_retryable());
    }
}
