//! `PostgreSQL` transactional outbox.
//!
//! # Schema
//!
//! ```sql
//! outbox_messages (message_offset BIGSERIAL PK, topic, message_id, payload, metadata, inserted_at)
//! outbox_cursors  (forwarder_id PK, last_offset, updated_at)
//! ```
//!
//! # Offset Ordering
//!
//! A `BIGSERIAL` alone is not enough for a reader that polls "offset > cursor":
//! two transactions can draw offsets 7 and 8 and commit in the order 8, 7, so
//! a poll between the commits sees 8, advances past it, and never sees 7.
//! Every append therefore takes `pg_advisory_xact_lock(hashtext(topic))`
//! before drawing its offset. Appenders to one topic serialize until commit,
//! so offsets become visible in ascending order.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool};
use std::future::Future;
use std::pin::Pin;
use ticketflow_core::message::{Message, Metadata};
use ticketflow_core::outbox::{OutboxError, OutboxReader, OutboxRow, OutboxWriter};
use uuid::Uuid;

type OutboxRecord = (i64, String, Uuid, Vec<u8>, serde_json::Value, DateTime<Utc>);

/// `PostgreSQL`-backed outbox.
///
/// # Example
///
/// ```ignore
/// use ticketflow_postgres::PostgresOutbox;
///
/// let outbox = PostgresOutbox::new(pool.clone());
/// let mut tx = pool.begin().await?;
/// sqlx::query("INSERT INTO bookings ...").execute(&mut *tx).await?;
/// events.publish_in_tx(&ctx, &outbox, &mut *tx, &booking_made).await?;
/// tx.commit().await?;
/// ```
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    /// Create an outbox over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl OutboxWriter for PostgresOutbox {
    type Tx = PgConnection;

    fn append<'a>(
        &'a self,
        tx: &'a mut PgConnection,
        topic: &'a str,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(topic)
                .execute(&mut *tx)
                .await
                .map_err(|e| OutboxError::Storage(format!("Failed to lock outbox topic: {e}")))?;

            sqlx::query(
                "INSERT INTO outbox_messages (topic, message_id, payload, metadata)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(topic)
            .bind(message.id)
            .bind(&message.payload)
            .bind(message.metadata.to_json())
            .execute(&mut *tx)
            .await
            .map_err(|e| OutboxError::Storage(format!("Failed to append outbox message: {e}")))?;

            Ok(())
        })
    }
}

impl OutboxReader for PostgresOutbox {
    fn poll<'a>(
        &'a self,
        topic: &'a str,
        after_offset: i64,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRow>, OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let records: Vec<OutboxRecord> = sqlx::query_as(
                "SELECT message_offset, topic, message_id, payload, metadata, inserted_at
                 FROM outbox_messages
                 WHERE topic = $1 AND message_offset > $2
                 ORDER BY message_offset ASC
                 LIMIT $3",
            )
            .bind(topic)
            .bind(after_offset)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(format!("Failed to poll outbox: {e}")))?;

            Ok(records
                .into_iter()
                .map(|(offset, topic, id, payload, metadata, inserted_at)| OutboxRow {
                    offset,
                    topic,
                    message: Message::from_parts(id, payload, Metadata::from_json(&metadata)),
                    inserted_at,
                })
                .collect())
        })
    }

    fn cursor<'a>(
        &'a self,
        forwarder_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i64, OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let cursor: Option<(i64,)> =
                sqlx::query_as("SELECT last_offset FROM outbox_cursors WHERE forwarder_id = $1")
                    .bind(forwarder_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| OutboxError::Storage(format!("Failed to load cursor: {e}")))?;

            Ok(cursor.map_or(0, |(offset,)| offset))
        })
    }

    fn advance_cursor<'a>(
        &'a self,
        forwarder_id: &'a str,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO outbox_cursors (forwarder_id, last_offset, updated_at)
                 VALUES ($1, $2, now())
                 ON CONFLICT (forwarder_id) DO UPDATE
                 SET last_offset = GREATEST(outbox_cursors.last_offset, EXCLUDED.last_offset),
                     updated_at = now()",
            )
            .bind(forwarder_id)
            .bind(offset)
            .execute(&self.pool)
            .await
            .map_err(|e| OutboxError::Storage(format!("Failed to advance cursor: {e}")))?;

            Ok(())
        })
    }
}
