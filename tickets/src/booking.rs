//! Booking allocator: seat allocation without overbooking.
//!
//! ```text
//! BEGIN ISOLATION LEVEL SERIALIZABLE
//!   SELECT capacity, booked seats of the show
//!   ├─ unknown show              ─► ROLLBACK ─► Validation
//!   ├─ capacity - booked < asked ─► ROLLBACK ─► NotEnoughSeatsAvailable
//!   └─ INSERT booking
//!      append BookingMade to the outbox
//! COMMIT  ── 40001 ─► retry the whole transaction
//! ```
//!
//! Concurrent bookings of one show serialize through the database: when two
//! transactions read the same free seats, one of them fails with a
//! serialization failure and is retried against the committed state.

use crate::entities::{BookingMade, Header};
use crate::error::TicketingError;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::sync::Arc;
use thiserror::Error;
use ticketflow_core::Context;
use ticketflow_core::environment::Clock;
use ticketflow_postgres::PostgresOutbox;
use ticketflow_runtime::EventBus;
use ticketflow_runtime::retry::{RetryPolicy, retry_with_predicate};
use uuid::Uuid;

/// SQLSTATE of serialization failures.
const SERIALIZATION_FAILURE: &str = "40001";

/// A request to book seats of a show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    /// Show to book
    pub show_id: Uuid,
    /// Seats requested
    pub number_of_tickets: i32,
    /// Customer contact
    pub customer_email: String,
}

/// Books seats.
#[async_trait]
pub trait BookTickets: Send + Sync {
    /// Book the requested seats, returning the new booking id.
    ///
    /// # Errors
    ///
    /// [`TicketingError::NotEnoughSeatsAvailable`] when the show is full,
    /// [`TicketingError::Validation`] for an unknown show or a non-positive
    /// seat count.
    async fn book_ticket(&self, ctx: &Context, request: BookingRequest) -> Result<Uuid, TicketingError>;
}

#[derive(Error, Debug)]
enum AllocationError {
    #[error("Serialization conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Failed(#[from] TicketingError),
}

fn sql(context: &'static str) -> impl Fn(sqlx::Error) -> AllocationError {
    move |e| {
        let conflict = e
            .as_database_error()
            .and_then(|db| db.code())
            .is_some_and(|code| code == SERIALIZATION_FAILURE);
        if conflict {
            AllocationError::Conflict(format!("{context}: {e}"))
        } else {
            AllocationError::Failed(TicketingError::storage(context, e))
        }
    }
}

/// `PostgreSQL` booking allocator.
pub struct BookingAllocator {
    pool: PgPool,
    outbox: PostgresOutbox,
    events: EventBus,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl BookingAllocator {
    /// Create an allocator.
    ///
    /// `retry` bounds the re-runs of transactions that lost a serialization
    /// conflict.
    #[must_use]
    pub fn new(pool: PgPool, events: EventBus, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            outbox: PostgresOutbox::new(pool.clone()),
            pool,
            events,
            clock,
            retry,
        }
    }

    async fn attempt(
        &self,
        ctx: &Context,
        request: &BookingRequest,
        booking_id: Uuid,
    ) -> Result<(), AllocationError> {
        let mut tx = self.pool.begin().await.map_err(sql("Failed to begin booking"))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(sql("Failed to set isolation level"))?;

        let seats: Option<(i32, i64)> = sqlx::query_as(
            "SELECT s.number_of_tickets, COALESCE(SUM(b.number_of_tickets), 0)::BIGINT \
             FROM shows s \
             LEFT JOIN bookings b ON s.show_id = b.show_id \
             WHERE s.show_id = $1 \
             GROUP BY s.show_id, s.number_of_tickets",
        )
        .bind(request.show_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(sql("Failed to read show capacity"))?;

        let Some((available, booked)) = seats else {
            return Err(TicketingError::Validation(format!("unknown show {}", request.show_id)).into());
        };
        let booked = i32::try_from(booked).unwrap_or(i32::MAX);

        if available - booked < request.number_of_tickets {
            return Err(TicketingError::NotEnoughSeatsAvailable { available, booked }.into());
        }

        sqlx::query(
            "INSERT INTO bookings (booking_id, show_id, number_of_tickets, customer_email) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(booking_id)
        .bind(request.show_id)
        .bind(request.number_of_tickets)
        .bind(&request.customer_email)
        .execute(&mut *tx)
        .await
        .map_err(sql("Failed to insert booking"))?;

        let event = BookingMade {
            header: Header::new(self.clock.as_ref(), booking_id.to_string()),
            number_of_tickets: request.number_of_tickets,
            booking_id,
            customer_email: request.customer_email.clone(),
            show_id: request.show_id,
        };
        self.events
            .publish_in_tx(ctx, &self.outbox, &mut *tx, &event)
            .await
            .map_err(TicketingError::from)?;

        tx.commit().await.map_err(sql("Failed to commit booking"))?;
        Ok(())
    }
}

#[async_trait]
impl BookTickets for BookingAllocator {
    async fn book_ticket(&self, ctx: &Context, request: BookingRequest) -> Result<Uuid, TicketingError> {
        if request.number_of_tickets <= 0 {
            return Err(TicketingError::Validation(format!(
                "number of tickets must be positive, got {}",
                request.number_of_tickets
            )));
        }

        let booking_id = Uuid::new_v4();
        let result = retry_with_predicate(
            &self.retry,
            || self.attempt(ctx, &request, booking_id),
            |e| matches!(e, AllocationError::Conflict(_)),
        )
        .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    %booking_id,
                    show_id = %request.show_id,
                    number_of_tickets = request.number_of_tickets,
                    "Booking made"
                );
                Ok(booking_id)
            },
            Err(AllocationError::Failed(error)) => Err(error),
            Err(AllocationError::Conflict(reason)) => Err(TicketingError::Storage(format!(
                "booking kept conflicting with concurrent bookings: {reason}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_errors_pass_through_allocation_errors() {
        let error: AllocationError = TicketingError::NotEnoughSeatsAvailable {
            available: 2,
            booked: 2,
        }
        .into();
        assert!(matches!(
            error,
            AllocationError::Failed(TicketingError::NotEnoughSeatsAvailable { .. })
        ));
        assert_eq!(error.to_string(), "Not enough seats available: 2 seats, 2 booked");
    }

    #[test]
    fn non_database_errors_are_not_conflicts() {
        let error = sql("Failed to read show capacity")(sqlx::Error::RowNotFound);
        assert!(matches!(error, AllocationError::Failed(TicketingError::Storage(_))));
    }
}
