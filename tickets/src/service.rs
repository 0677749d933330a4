//! Inbound operations of the ticket service.
//!
//! [`TicketService`] turns requests into events and commands. It is what an
//! HTTP layer would call; validation happens here so nothing malformed is
//! ever published.

use crate::booking::{BookTickets, BookingRequest};
use crate::entities::{
    CommandHeader, Header, RefundTicket, TicketBookingCanceled, TicketBookingConfirmed,
    TicketStatusUpdate, derived_idempotency_key,
};
use crate::error::TicketingError;
use std::sync::Arc;
use ticketflow_core::Context;
use ticketflow_core::environment::Clock;
use ticketflow_runtime::{CommandBus, EventBus};
use uuid::Uuid;

/// Status of a confirmed ticket update.
pub const CONFIRMED: &str = "confirmed";
/// Status of a canceled ticket update.
pub const CANCELED: &str = "canceled";

/// Ticket status updates, refunds and bookings.
#[derive(Clone)]
pub struct TicketService {
    events: EventBus,
    commands: CommandBus,
    bookings: Arc<dyn BookTickets>,
    clock: Arc<dyn Clock>,
}

impl TicketService {
    /// Create the service.
    #[must_use]
    pub fn new(
        events: EventBus,
        commands: CommandBus,
        bookings: Arc<dyn BookTickets>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            commands,
            bookings,
            clock,
        }
    }

    /// Publish the event of a ticket status update.
    ///
    /// The event's idempotency key is derived from `idempotency_key` and the
    /// ticket id, so a retried request fans out to the same keys.
    ///
    /// # Errors
    ///
    /// [`TicketingError::Validation`] for an unknown status,
    /// [`TicketingError::Transport`] if publishing fails.
    pub async fn update_ticket_status(
        &self,
        ctx: &Context,
        idempotency_key: &str,
        update: TicketStatusUpdate,
    ) -> Result<(), TicketingError> {
        let header = Header::new(
            self.clock.as_ref(),
            derived_idempotency_key(idempotency_key, &update.ticket_id),
        );

        match update.status.as_str() {
            CONFIRMED => {
                let event = TicketBookingConfirmed {
                    header,
                    ticket_id: update.ticket_id,
                    customer_email: update.customer_email,
                    price: update.price,
                    booking_id: update.booking_id,
                };
                self.events.publish(ctx, &event).await?;
            },
            CANCELED => {
                let event = TicketBookingCanceled {
                    header,
                    ticket_id: update.ticket_id,
                    customer_email: update.customer_email,
                    price: update.price,
                };
                self.events.publish(ctx, &event).await?;
            },
            other => {
                return Err(TicketingError::Validation(format!(
                    "unknown ticket status {other:?} for ticket {}",
                    update.ticket_id
                )));
            },
        }
        Ok(())
    }

    /// Send a refund command for a ticket.
    ///
    /// # Errors
    ///
    /// [`TicketingError::Validation`] without an idempotency key,
    /// [`TicketingError::Transport`] if sending fails.
    pub async fn refund_ticket(&self, ctx: &Context, ticket_id: &str, idempotency_key: &str) -> Result<(), TicketingError> {
        if idempotency_key.is_empty() {
            return Err(TicketingError::Validation(
                "refund requires an idempotency key".to_string(),
            ));
        }

        let command = RefundTicket {
            header: CommandHeader::new(self.clock.as_ref(), idempotency_key),
            ticket_id: ticket_id.to_string(),
        };
        self.commands.send(ctx, &command).await?;
        tracing::info!(ticket_id, "Refund requested");
        Ok(())
    }

    /// Book seats of a show.
    ///
    /// # Errors
    ///
    /// See [`BookTickets::book_ticket`].
    pub async fn book_ticket(&self, ctx: &Context, request: BookingRequest) -> Result<Uuid, TicketingError> {
        self.bookings.book_ticket(ctx, request).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entities::Money;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use ticketflow_core::marshal::unmarshal;
    use ticketflow_core::payload::{Command, Event};
    use ticketflow_testing::{InMemoryBroker, test_clock};

    #[derive(Default)]
    struct RecordingBookings {
        requests: Mutex<Vec<BookingRequest>>,
    }

    #[async_trait]
    impl BookTickets for RecordingBookings {
        async fn book_ticket(&self, _ctx: &Context, request: BookingRequest) -> Result<Uuid, TicketingError> {
            self.requests.lock().unwrap().push(request);
            Ok(Uuid::nil())
        }
    }

    fn service() -> (TicketService, Arc<InMemoryBroker>, Arc<RecordingBookings>) {
        let broker = Arc::new(InMemoryBroker::new());
        let bookings = Arc::new(RecordingBookings::default());
        let service = TicketService::new(
            EventBus::new(broker.clone()),
            CommandBus::new(broker.clone()),
            bookings.clone(),
            Arc::new(test_clock()),
        );
        (service, broker, bookings)
    }

    fn update(status: &str) -> TicketStatusUpdate {
        TicketStatusUpdate {
            ticket_id: "t-1".to_string(),
            status: status.to_string(),
            customer_email: "fan@example.com".to_string(),
            price: Money::new("50.00", ""),
            booking_id: Some("b-1".to_string()),
        }
    }

    #[tokio::test]
    async fn confirmed_update_publishes_with_derived_key() {
        let (service, broker, _) = service();

        service
            .update_ticket_status(&Context::background(), "req-1", update(CONFIRMED))
            .await
            .unwrap();

        let published = broker.published(&TicketBookingConfirmed::topic());
        assert_eq!(published.len(), 1);
        let event: TicketBookingConfirmed = unmarshal(&published[0]).unwrap();
        assert_eq!(event.header.idempotency_key, "5:req-1t-1");
        assert_eq!(event.price.currency(), "USD");
        assert_eq!(event.booking_id.as_deref(), Some("b-1"));
    }

    #[tokio::test]
    async fn canceled_update_publishes_cancellation() {
        let (service, broker, _) = service();

        service
            .update_ticket_status(&Context::background(), "req-2", update(CANCELED))
            .await
            .unwrap();

        assert_eq!(broker.published(&TicketBookingCanceled::topic()).len(), 1);
        assert!(broker.published(&TicketBookingConfirmed::topic()).is_empty());
    }

    #[tokio::test]
    async fn unknown_status_is_rejected() {
        let (service, broker, _) = service();

        let result = service
            .update_ticket_status(&Context::background(), "req-3", update("lost"))
            .await;

        assert!(matches!(result, Err(TicketingError::Validation(_))));
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn refund_requires_idempotency_key() {
        let (service, broker, _) = service();
        let ctx = Context::background();

        let rejected = service.refund_ticket(&ctx, "t-1", "").await;
        assert!(matches!(rejected, Err(TicketingError::Validation(_))));

        service.refund_ticket(&ctx, "t-1", "refund-1").await.unwrap();
        let sent = broker.published(&RefundTicket::topic());
        assert_eq!(sent.len(), 1);
        let command: RefundTicket = unmarshal(&sent[0]).unwrap();
        assert_eq!(command.header.idempotency_key, "refund-1");
    }

    #[tokio::test]
    async fn booking_is_delegated() {
        let (service, _, bookings) = service();
        let request = BookingRequest {
            show_id: Uuid::new_v4(),
            number_of_tickets: 2,
            customer_email: "fan@example.com".to_string(),
        };

        service
            .book_ticket(&Context::background(), request.clone())
            .await
            .unwrap();

        assert_eq!(*bookings.requests.lock().unwrap(), vec![request]);
    }
}
