//! Transactional outbox contracts.
//!
//! The outbox makes a database mutation and the publication of the message
//! describing it atomic: the message is written as a row in the same
//! transaction, and a forwarder relays committed rows to the broker.
//!
//! ```text
//!  business tx ──┬─► UPDATE/INSERT business rows
//!                └─► OutboxWriter::append(tx, topic, message)
//!                         │ COMMIT
//!                         ▼
//!  forwarder ──► OutboxReader::poll(topic, cursor, limit)
//!                ──► Broker::publish(destination, message)
//!                ──► OutboxReader::advance_cursor(forwarder, offset)
//! ```
//!
//! The writer and reader sides are separate traits: writers are generic over
//! the caller's transaction type, readers are object-safe so the forwarder can
//! hold them behind `Arc<dyn OutboxReader>`.

use crate::message::{DESTINATION_TOPIC_KEY, Message};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from outbox operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// Storage failure (constraint violation, connection loss, ...).
    ///
    /// When returned from `append`, the caller must roll back its transaction.
    #[error("Outbox storage error: {0}")]
    Storage(String),

    /// A stored row could not be decoded.
    #[error("Corrupt outbox row at offset {offset}: {reason}")]
    Corrupt {
        /// Offset of the row
        offset: i64,
        /// What was wrong with it
        reason: String,
    },
}

/// A committed outbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRow {
    /// Monotonically increasing position of the row.
    pub offset: i64,
    /// Outbox topic the row was appended to.
    pub topic: String,
    /// The stored message.
    pub message: Message,
    /// When the row was inserted.
    pub inserted_at: DateTime<Utc>,
}

impl OutboxRow {
    /// Broker topic the row must be relayed to.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.message
            .metadata
            .get(DESTINATION_TOPIC_KEY)
            .filter(|topic| !topic.is_empty())
    }

    /// The message as it should appear on the broker, without outbox-only
    /// metadata.
    #[must_use]
    pub fn into_published(self) -> Message {
        let mut message = self.message;
        message.metadata.remove(DESTINATION_TOPIC_KEY);
        message
    }
}

/// Write side of the outbox: appends rows inside a caller-owned transaction.
pub trait OutboxWriter: Send + Sync {
    /// The transaction (or connection) handle rows are written through.
    type Tx: Send;

    /// Append `message` under `topic` inside `tx`.
    ///
    /// The row becomes visible to readers only when `tx` commits.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the insert fails.
    fn append<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        topic: &'a str,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>>;
}

/// Read side of the outbox: polling and per-forwarder cursors.
pub trait OutboxReader: Send + Sync {
    /// Committed rows of `topic` with offset strictly greater than
    /// `after_offset`, ascending, at most `limit` rows.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError`] if the rows cannot be read.
    fn poll<'a>(
        &'a self,
        topic: &'a str,
        after_offset: i64,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRow>, OutboxError>> + Send + 'a>>;

    /// Last forwarded offset of a forwarder, `0` when it never advanced.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the cursor cannot be read.
    fn cursor<'a>(
        &'a self,
        forwarder_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i64, OutboxError>> + Send + 'a>>;

    /// Move a forwarder's cursor to `offset`.
    ///
    /// Advancing to an offset at or below the current cursor is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the cursor cannot be written.
    fn advance_cursor<'a>(
        &'a self,
        forwarder_id: &'a str,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_message_drops_destination() {
        let mut message = Message::new(b"{}".to_vec());
        message.metadata.set(DESTINATION_TOPIC_KEY, "events.BookingMade");
        message.metadata.set("type", "BookingMade");

        let row = OutboxRow {
            offset: 4,
            topic: "events_to_forward".to_string(),
            message,
            inserted_at: Utc::now(),
        };

        assert_eq!(row.destination(), Some("events.BookingMade"));
        let published = row.into_published();
        assert_eq!(published.metadata.get(DESTINATION_TOPIC_KEY), None);
        assert_eq!(published.payload_type(), Some("BookingMade"));
    }
}
