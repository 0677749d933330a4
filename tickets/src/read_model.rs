//! Operations read model: one [`OpsBooking`] document per booking.
//!
//! Each event is folded in by a pure merge function; [`OpsBookingReadModel`]
//! runs the merges through a [`DocumentStore`].
//!
//! | event | lookup | merge |
//! |---|---|---|
//! | `BookingMade` | insert-if-absent by booking id | [`booking_made`] |
//! | `TicketBookingConfirmed` | booking id | [`ticket_confirmed`] |
//! | `TicketPrinted` | ticket membership | [`ticket_printed`] |
//! | `TicketReceiptIssued` | ticket membership | [`receipt_issued`] |
//! | `TicketRefunded` | ticket membership | [`ticket_refunded`] |
//!
//! An event that arrives before the document (or ticket) it updates fails
//! with [`TicketingError::NotYetProjectable`]. That error is transient: the
//! router's retry stage re-runs the handler a bounded number of times, then
//! the message is nacked and redelivered, so the document converges whatever
//! order the events arrive in.
//!
//! Merges only ever set fields, and `last_update` keeps the latest event time
//! seen, so applying an event twice or out of order yields the same document.

use crate::entities::{
    BookingMade, OpsBooking, STATUS_CONFIRMED, STATUS_REFUNDED, TicketBookingConfirmed,
    TicketPrinted, TicketReceiptIssued, TicketRefunded,
};
use crate::error::TicketingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use ticketflow_core::Context;
use ticketflow_projections::{DocumentError, DocumentStore, Lookup};
use ticketflow_runtime::{EventHandler, HandlerError};

/// Table of the read model.
pub const OPS_BOOKINGS_TABLE: &str = "read_model_ops_bookings";
/// Key column of the read model table.
pub const OPS_BOOKINGS_KEY: &str = "booking_id";

/// Document created by `BookingMade`.
#[must_use]
pub fn booking_made(event: &BookingMade) -> OpsBooking {
    OpsBooking {
        booking_id: event.booking_id.to_string(),
        booked_at: event.header.published_at,
        last_update: event.header.published_at,
        tickets: std::collections::BTreeMap::new(),
    }
}

fn touch(booking: &mut OpsBooking, at: DateTime<Utc>) {
    booking.last_update = booking.last_update.max(at);
}

/// Record a confirmed ticket. A refunded ticket stays refunded.
#[must_use]
pub fn ticket_confirmed(mut booking: OpsBooking, event: &TicketBookingConfirmed) -> OpsBooking {
    let ticket = booking.tickets.entry(event.ticket_id.clone()).or_default();
    ticket.price_amount = event.price.amount().to_string();
    ticket.price_currency = event.price.currency().to_string();
    ticket.customer_email.clone_from(&event.customer_email);
    if ticket.status != STATUS_REFUNDED {
        ticket.status = STATUS_CONFIRMED.to_string();
    }
    touch(&mut booking, event.header.published_at);
    booking
}

/// Record the ticket file.
#[must_use]
pub fn ticket_printed(mut booking: OpsBooking, event: &TicketPrinted) -> OpsBooking {
    if let Some(ticket) = booking.tickets.get_mut(&event.ticket_id) {
        ticket.printed_at = Some(event.header.published_at);
        ticket.printed_file_name.clone_from(&event.file_name);
    }
    touch(&mut booking, event.header.published_at);
    booking
}

/// Record the receipt.
#[must_use]
pub fn receipt_issued(mut booking: OpsBooking, event: &TicketReceiptIssued) -> OpsBooking {
    if let Some(ticket) = booking.tickets.get_mut(&event.ticket_id) {
        ticket.receipt_issued_at = Some(event.issued_at);
        ticket.receipt_number.clone_from(&event.receipt_number);
    }
    touch(&mut booking, event.header.published_at);
    booking
}

/// Mark the ticket refunded.
#[must_use]
pub fn ticket_refunded(mut booking: OpsBooking, event: &TicketRefunded) -> OpsBooking {
    if let Some(ticket) = booking.tickets.get_mut(&event.ticket_id) {
        ticket.status = STATUS_REFUNDED.to_string();
    }
    touch(&mut booking, event.header.published_at);
    booking
}

fn decode(document: Value) -> Result<OpsBooking, DocumentError> {
    serde_json::from_value(document).map_err(|e| DocumentError::Serialization(e.to_string()))
}

fn encode(booking: &OpsBooking) -> Result<Value, DocumentError> {
    serde_json::to_value(booking).map_err(|e| DocumentError::Serialization(e.to_string()))
}

/// Lift a merge over [`OpsBooking`] to one over stored JSON.
fn merge_with<F>(merge: F) -> impl FnOnce(Value) -> Result<Value, DocumentError> + Send
where
    F: FnOnce(OpsBooking) -> OpsBooking + Send,
{
    move |document| encode(&merge(decode(document)?))
}

/// Projects ticket events into [`OpsBooking`] documents.
pub struct OpsBookingReadModel<S> {
    store: Arc<S>,
}

impl<S> Clone for OpsBookingReadModel<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: DocumentStore> OpsBookingReadModel<S> {
    /// Create a read model over `store`.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The booking's document, if projected.
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::Storage`] if the store fails.
    pub async fn reservation(&self, booking_id: &str) -> Result<Option<OpsBooking>, TicketingError> {
        self.store
            .get(&Lookup::key(booking_id))
            .await?
            .map(decode)
            .transpose()
            .map_err(TicketingError::from)
    }

    /// Every projected booking, ordered by booking id.
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::Storage`] if the store fails.
    pub async fn all_reservations(&self) -> Result<Vec<OpsBooking>, TicketingError> {
        self.store
            .all()
            .await?
            .into_iter()
            .map(|document| decode(document).map_err(TicketingError::from))
            .collect()
    }

    /// Create the booking's document unless it exists.
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::Storage`] if the store fails.
    pub async fn on_booking_made(&self, event: &BookingMade) -> Result<(), TicketingError> {
        let booking = booking_made(event);
        let inserted = self
            .store
            .insert_if_absent(&booking.booking_id, &encode(&booking)?)
            .await?;
        if !inserted {
            tracing::debug!(booking_id = %booking.booking_id, "Booking already projected");
        }
        Ok(())
    }

    /// Add a confirmed ticket to its booking.
    ///
    /// A confirmation without a booking id cannot be placed and is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::NotYetProjectable`] if the booking document
    /// does not exist yet.
    pub async fn on_ticket_booking_confirmed(&self, event: &TicketBookingConfirmed) -> Result<(), TicketingError> {
        let Some(booking_id) = event.booking_id.as_deref().filter(|id| !id.is_empty()) else {
            tracing::warn!(ticket_id = %event.ticket_id, "Confirmed ticket has no booking id, not projecting");
            return Ok(());
        };
        self.store
            .update(&Lookup::key(booking_id), merge_with(|b| ticket_confirmed(b, event)))
            .await?;
        Ok(())
    }

    /// Record a printed ticket.
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::NotYetProjectable`] if no booking holds the
    /// ticket yet.
    pub async fn on_ticket_printed(&self, event: &TicketPrinted) -> Result<(), TicketingError> {
        self.update_ticket(&event.ticket_id, merge_with(|b| ticket_printed(b, event)))
            .await
    }

    /// Record an issued receipt.
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::NotYetProjectable`] if no booking holds the
    /// ticket yet.
    pub async fn on_ticket_receipt_issued(&self, event: &TicketReceiptIssued) -> Result<(), TicketingError> {
        self.update_ticket(&event.ticket_id, merge_with(|b| receipt_issued(b, event)))
            .await
    }

    /// Record a refund.
    ///
    /// # Errors
    ///
    /// Returns [`TicketingError::NotYetProjectable`] if no booking holds the
    /// ticket yet.
    pub async fn on_ticket_refunded(&self, event: &TicketRefunded) -> Result<(), TicketingError> {
        self.update_ticket(&event.ticket_id, merge_with(|b| ticket_refunded(b, event)))
            .await
    }

    async fn update_ticket<F>(&self, ticket_id: &str, merge: F) -> Result<(), TicketingError>
    where
        F: FnOnce(Value) -> Result<Value, DocumentError> + Send,
    {
        self.store
            .update(&Lookup::member("tickets", ticket_id), merge)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> EventHandler<BookingMade> for OpsBookingReadModel<S> {
    async fn handle(&self, _ctx: &Context, event: BookingMade) -> Result<(), HandlerError> {
        self.on_booking_made(&event).await.map_err(HandlerError::from)
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> EventHandler<TicketBookingConfirmed> for OpsBookingReadModel<S> {
    async fn handle(&self, _ctx: &Context, event: TicketBookingConfirmed) -> Result<(), HandlerError> {
        self.on_ticket_booking_confirmed(&event).await.map_err(HandlerError::from)
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> EventHandler<TicketPrinted> for OpsBookingReadModel<S> {
    async fn handle(&self, _ctx: &Context, event: TicketPrinted) -> Result<(), HandlerError> {
        self.on_ticket_printed(&event).await.map_err(HandlerError::from)
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> EventHandler<TicketReceiptIssued> for OpsBookingReadModel<S> {
    async fn handle(&self, _ctx: &Context, event: TicketReceiptIssued) -> Result<(), HandlerError> {
        self.on_ticket_receipt_issued(&event).await.map_err(HandlerError::from)
    }
}

#[async_trait]
impl<S: DocumentStore + 'static> EventHandler<TicketRefunded> for OpsBookingReadModel<S> {
    async fn handle(&self, _ctx: &Context, event: TicketRefunded) -> Result<(), HandlerError> {
        self.on_ticket_refunded(&event).await.map_err(HandlerError::from)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::entities::{Header, Money};
    use ticketflow_core::environment::Clock;
    use ticketflow_testing::{InMemoryDocumentStore, test_clock};
    use uuid::Uuid;

    fn model() -> OpsBookingReadModel<InMemoryDocumentStore> {
        OpsBookingReadModel::new(Arc::new(InMemoryDocumentStore::new()))
    }

    fn booking(booking_id: Uuid) -> BookingMade {
        BookingMade {
            header: Header::new(&test_clock(), "b-1"),
            number_of_tickets: 1,
            booking_id,
            customer_email: "fan@example.com".to_string(),
            show_id: Uuid::new_v4(),
        }
    }

    fn confirmed(booking_id: Option<String>) -> TicketBookingConfirmed {
        TicketBookingConfirmed {
            header: Header::new(&test_clock(), "req-1t-1"),
            ticket_id: "t-1".to_string(),
            customer_email: "fan@example.com".to_string(),
            price: Money::new("50.00", "EUR"),
            booking_id,
        }
    }

    #[tokio::test]
    async fn confirmation_before_booking_is_not_yet_projectable() {
        let model = model();
        let booking_id = Uuid::new_v4();

        let early = model
            .on_ticket_booking_confirmed(&confirmed(Some(booking_id.to_string())))
            .await;
        assert!(matches!(early, Err(TicketingError::NotYetProjectable(_))));

        model.on_booking_made(&booking(booking_id)).await.unwrap();
        model
            .on_ticket_booking_confirmed(&confirmed(Some(booking_id.to_string())))
            .await
            .unwrap();

        let projected = model.reservation(&booking_id.to_string()).await.unwrap().unwrap();
        let ticket = &projected.tickets["t-1"];
        assert_eq!(ticket.status, STATUS_CONFIRMED);
        assert_eq!(ticket.price_currency, "EUR");
    }

    #[tokio::test]
    async fn confirmation_without_booking_id_is_skipped() {
        let model = model();
        assert!(model.on_ticket_booking_confirmed(&confirmed(None)).await.is_ok());
        assert!(model.all_reservations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_booking_made_keeps_first_document() {
        let model = model();
        let booking_id = Uuid::new_v4();
        model.on_booking_made(&booking(booking_id)).await.unwrap();
        model
            .on_ticket_booking_confirmed(&confirmed(Some(booking_id.to_string())))
            .await
            .unwrap();

        model.on_booking_made(&booking(booking_id)).await.unwrap();

        let projected = model.reservation(&booking_id.to_string()).await.unwrap().unwrap();
        assert_eq!(projected.tickets.len(), 1);
    }

    #[test]
    fn refunded_ticket_stays_refunded_on_late_confirmation() {
        let booking_id = Uuid::new_v4();
        let confirmed = confirmed(Some(booking_id.to_string()));
        let refunded = TicketRefunded {
            header: Header::new(&test_clock(), "refund-1"),
            ticket_id: "t-1".to_string(),
        };

        let doc = ticket_confirmed(booking_made(&booking(booking_id)), &confirmed);
        let doc = ticket_refunded(doc, &refunded);
        let doc = ticket_confirmed(doc, &confirmed);

        assert!(doc.tickets["t-1"].is_refunded());
    }

    #[test]
    fn last_update_keeps_latest_event_time() {
        let booking_id = Uuid::new_v4();
        let mut late = confirmed(Some(booking_id.to_string()));
        late.header.published_at = test_clock().now() + chrono::Duration::minutes(5);
        let printed = TicketPrinted {
            header: Header::new(&test_clock(), "req-1t-1"),
            ticket_id: "t-1".to_string(),
            file_name: "t-1-ticket.html".to_string(),
        };

        let doc = ticket_confirmed(booking_made(&booking(booking_id)), &late);
        let doc = ticket_printed(doc, &printed);

        assert_eq!(doc.last_update, late.header.published_at);
        assert_eq!(doc.tickets["t-1"].printed_file_name, "t-1-ticket.html");
    }
}
