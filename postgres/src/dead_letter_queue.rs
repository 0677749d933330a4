//! Dead Letter Queue (DLQ) for messages the router gave up on.
//!
//! Provides persistent storage and management of messages that failed
//! processing after exhausting their delivery budget, or failed permanently.
//! Operators list, inspect, replay, resolve or discard entries.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use ticketflow_core::broker::{Broker, BrokerError};
use ticketflow_core::message::{Message, Metadata};
use ticketflow_runtime::{DeadLetter, DeadLetterError, DeadLetterSink};

/// Errors from DLQ operations.
#[derive(Error, Debug)]
pub enum DLQError {
    /// Database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A stored status did not match a known one.
    #[error("Invalid DLQ status: {0}")]
    InvalidStatus(String),

    /// No entry with this id.
    #[error("DLQ entry {0} not found")]
    NotFound(i64),

    /// Replaying the message to the broker failed.
    #[error("Replay failed: {0}")]
    Replay(#[from] BrokerError),
}

/// Status of a failed message in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Message is pending investigation/reprocessing
    Pending,
    /// Message is currently being replayed
    Processing,
    /// Message was successfully reprocessed
    Resolved,
    /// Message was permanently discarded
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::InvalidStatus`] if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, DLQError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DLQError::InvalidStatus(s.to_string())),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedMessage {
    /// Unique identifier for this DLQ entry
    pub id: i64,
    /// Handler that gave up on the message
    pub handler: String,
    /// Topic the message was consumed from
    pub topic: String,
    /// The failed message
    pub message: Message,
    /// Final error
    pub error_message: String,
    /// Delivery attempts made before giving up
    pub retry_count: i32,
    /// When this message first failed
    pub first_failed_at: DateTime<Utc>,
    /// When this entry last changed
    pub last_failed_at: DateTime<Utc>,
    /// Current processing status
    pub status: DLQStatus,
    /// When the failure was resolved (if applicable)
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who/what resolved the failure
    pub resolved_by: Option<String>,
    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

const SELECT_COLUMNS: &str = "id, handler, topic, message_id, payload, metadata, error_message, \
     retry_count, first_failed_at, last_failed_at, status, resolved_at, resolved_by, \
     resolution_notes";

/// `PostgreSQL`-based Dead Letter Queue.
///
/// Plugs into the router as a [`DeadLetterSink`].
///
/// # Example
///
/// ```ignore
/// use ticketflow_postgres::{DeadLetterQueue, DLQStatus};
///
/// let dlq = Arc::new(DeadLetterQueue::new(pool));
/// router.with_dead_letter_sink(dlq.clone());
///
/// for failed in dlq.list_pending(100).await? {
///     dlq.replay(failed.id, broker.as_ref()).await?;
/// }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a failed message to the DLQ.
    ///
    /// Returns the id of the created entry.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Database`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, DLQError> {
        let retry_count = i32::try_from(letter.attempts).unwrap_or(i32::MAX);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_messages (
                handler, topic, message_id, payload, metadata,
                error_message, retry_count, first_failed_at, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING id
            ",
        )
        .bind(&letter.handler)
        .bind(&letter.topic)
        .bind(letter.message.id)
        .bind(&letter.message.payload)
        .bind(letter.message.metadata.to_json())
        .bind(&letter.reason)
        .bind(retry_count)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?;

        tracing::warn!(
            dlq_id = id,
            handler = %letter.handler,
            topic = %letter.topic,
            message_id = %letter.message.id,
            error = %letter.reason,
            retry_count,
            "Message added to Dead Letter Queue"
        );

        metrics::counter!("dlq_messages_stored_total", "handler" => letter.handler.clone())
            .increment(1);

        Ok(id)
    }

    /// List pending failed messages, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Database`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedMessage>, DLQError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List failed messages by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Database`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedMessage>, DLQError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM failed_messages
             WHERE status = $1
             ORDER BY first_failed_at ASC, id ASC
             LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_failed_message).collect()
    }

    /// Get a specific failed message by id.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry, or
    /// [`DLQError::Database`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<FailedMessage, DLQError> {
        let row = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM failed_messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?
        .ok_or(DLQError::NotFound(id))?;

        Self::row_to_failed_message(&row)
    }

    /// Update the status of a failed message.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry, or
    /// [`DLQError::Database`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), DLQError> {
        let updated = sqlx::query(
            r"
            UPDATE failed_messages
            SET status = $1, last_failed_at = NOW()
            WHERE id = $2
            ",
        )
        .bind(status.as_str())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?
        .rows_affected();

        if updated == 0 {
            return Err(DLQError::NotFound(id));
        }

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");
        Ok(())
    }

    /// Mark a failed message as resolved.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry, or
    /// [`DLQError::Database`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DLQError> {
        let updated = sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?
        .rows_affected();

        if updated == 0 {
            return Err(DLQError::NotFound(id));
        }

        tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
        metrics::counter!("dlq_messages_resolved_total", "outcome" => "resolved").increment(1);

        Ok(())
    }

    /// Mark a failed message as discarded.
    ///
    /// Use this when a failure cannot be fixed (malformed payload, retired
    /// handler).
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::NotFound`] if there is no such entry, or
    /// [`DLQError::Database`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DLQError> {
        let updated = sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| DLQError::Database(e.to_string()))?
        .rows_affected();

        if updated == 0 {
            return Err(DLQError::NotFound(id));
        }

        tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
        metrics::counter!("dlq_messages_resolved_total", "outcome" => "discarded").increment(1);

        Ok(())
    }

    /// Get count of pending failures.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Database`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DLQError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_messages WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| DLQError::Database(e.to_string()))?;

        Ok(count)
    }

    /// Republish a failed message to the topic it was consumed from.
    ///
    /// The entry moves to `processing` first and to `resolved` once the
    /// broker accepted the message. If publishing fails it goes back to
    /// `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`DLQError::Replay`] if the broker rejected the message, or a
    /// storage error from the status updates.
    pub async fn replay(&self, id: i64, broker: &dyn Broker) -> Result<(), DLQError> {
        let failed = self.get_by_id(id).await?;
        self.update_status(id, DLQStatus::Processing).await?;

        if let Err(e) = broker.publish(&failed.topic, &failed.message).await {
            tracing::error!(dlq_id = id, topic = %failed.topic, error = %e, "DLQ replay failed");
            self.update_status(id, DLQStatus::Pending).await?;
            return Err(DLQError::Replay(e));
        }

        self.mark_resolved(id, "replay", Some("republished to source topic"))
            .await
    }

    fn row_to_failed_message(row: &sqlx::postgres::PgRow) -> Result<FailedMessage, DLQError> {
        let metadata: serde_json::Value = row.get("metadata");
        let status: String = row.get("status");

        Ok(FailedMessage {
            id: row.get("id"),
            handler: row.get("handler"),
            topic: row.get("topic"),
            message: Message::from_parts(
                row.get("message_id"),
                row.get("payload"),
                Metadata::from_json(&metadata),
            ),
            error_message: row.get("error_message"),
            retry_count: row.get("retry_count"),
            first_failed_at: row.get("first_failed_at"),
            last_failed_at: row.get("last_failed_at"),
            status: DLQStatus::parse(&status)?,
            resolved_at: row.get("resolved_at"),
            resolved_by: row.get("resolved_by"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterSink for DeadLetterQueue {
    fn dead_letter<'a>(
        &'a self,
        letter: &'a DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + 'a>> {
        Box::pin(async move {
            self.add_entry(letter)
                .await
                .map(|_| ())
                .map_err(|e| DeadLetterError::Storage(e.to_string()))
        })
    }
}
