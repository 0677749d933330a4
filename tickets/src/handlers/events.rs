//! Event handlers.

use super::{
    APPEND_TO_REFUNDS, APPEND_TO_TRACKER, BOOK_EXTERNAL_SEAT, ISSUE_RECEIPT, PRINT_TICKET,
    TICKETS_TO_PRINT_SHEET, TICKETS_TO_REFUND_SHEET, log_outcome,
};
use crate::capabilities::{
    AppendSpreadsheetRow, BookExternalSeat, ExternalSeatBooking, IssueReceipt,
    IssueReceiptRequest, StoreTicketFile,
};
use crate::entities::{
    BookingMade, Header, Ticket, TicketBookingCanceled, TicketBookingConfirmed, TicketPrinted,
    TicketReceiptIssued,
};
use crate::error::TicketingError;
use crate::repository::{ShowsRepository, TicketsRepository};
use async_trait::async_trait;
use std::sync::Arc;
use ticketflow_core::Context;
use ticketflow_core::dedup::{DedupLedger, dedup_key};
use ticketflow_core::environment::Clock;
use ticketflow_runtime::{EventBus, EventHandler, HandlerError};

/// Issues a receipt for every confirmed ticket and announces it with
/// `TicketReceiptIssued`.
pub struct IssueReceiptHandler<L> {
    ledger: Arc<L>,
    receipts: Arc<dyn IssueReceipt>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl<L: DedupLedger> IssueReceiptHandler<L> {
    /// Create the handler.
    #[must_use]
    pub fn new(
        ledger: Arc<L>,
        receipts: Arc<dyn IssueReceipt>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            receipts,
            events,
            clock,
        }
    }
}

#[async_trait]
impl<L: DedupLedger + 'static> EventHandler<TicketBookingConfirmed> for IssueReceiptHandler<L> {
    async fn handle(&self, ctx: &Context, event: TicketBookingConfirmed) -> Result<(), HandlerError> {
        let idempotency_key = event.header.effect_key();
        let key = dedup_key(ISSUE_RECEIPT, &idempotency_key);
        let event = &event;

        let outcome = self
            .ledger
            .apply_once(&key, move || async move {
                let issued = self
                    .receipts
                    .issue_receipt(
                        ctx,
                        IssueReceiptRequest {
                            ticket_id: event.ticket_id.clone(),
                            price: event.price.clone(),
                            idempotency_key,
                        },
                    )
                    .await?;

                let receipt_issued = TicketReceiptIssued {
                    header: Header::new(self.clock.as_ref(), event.header.idempotency_key.clone()),
                    ticket_id: event.ticket_id.clone(),
                    receipt_number: issued.receipt_number,
                    issued_at: issued.issued_at,
                };
                self.events.publish(ctx, &receipt_issued).await?;
                Ok::<(), TicketingError>(())
            })
            .await?;

        log_outcome(ISSUE_RECEIPT, &key, outcome);
        Ok(())
    }
}

/// Appends every confirmed ticket to the print tracker sheet.
pub struct AppendToTrackerHandler<L> {
    ledger: Arc<L>,
    sheets: Arc<dyn AppendSpreadsheetRow>,
}

impl<L: DedupLedger> AppendToTrackerHandler<L> {
    /// Create the handler.
    #[must_use]
    pub fn new(ledger: Arc<L>, sheets: Arc<dyn AppendSpreadsheetRow>) -> Self {
        Self { ledger, sheets }
    }
}

#[async_trait]
impl<L: DedupLedger + 'static> EventHandler<TicketBookingConfirmed> for AppendToTrackerHandler<L> {
    async fn handle(&self, ctx: &Context, event: TicketBookingConfirmed) -> Result<(), HandlerError> {
        let key = dedup_key(APPEND_TO_TRACKER, &event.header.effect_key());
        let row = event.spreadsheet_row();

        let outcome = self
            .ledger
            .apply_once(&key, move || async move {
                self.sheets.append_row(ctx, TICKETS_TO_PRINT_SHEET, row).await
            })
            .await?;

        log_outcome(APPEND_TO_TRACKER, &key, outcome);
        Ok(())
    }
}

/// Name of the stored file of a ticket.
#[must_use]
pub fn ticket_file_name(ticket_id: &str) -> String {
    format!("{ticket_id}-ticket.html")
}

fn ticket_html(event: &TicketBookingConfirmed) -> String {
    format!(
        "<html>\n<head>\n<title>Ticket</title>\n</head>\n<body>\n\
         <h1>Ticket {}</h1>\n<p>Price: {} {}</p>\n</body>\n</html>",
        event.ticket_id,
        event.price.amount(),
        event.price.currency()
    )
}

/// Renders the ticket file of every confirmed ticket and announces it with
/// `TicketPrinted`.
pub struct PrintTicketHandler<L> {
    ledger: Arc<L>,
    files: Arc<dyn StoreTicketFile>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl<L: DedupLedger> PrintTicketHandler<L> {
    /// Create the handler.
    #[must_use]
    pub fn new(
        ledger: Arc<L>,
        files: Arc<dyn StoreTicketFile>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            files,
            events,
            clock,
        }
    }
}

#[async_trait]
impl<L: DedupLedger + 'static> EventHandler<TicketBookingConfirmed> for PrintTicketHandler<L> {
    async fn handle(&self, ctx: &Context, event: TicketBookingConfirmed) -> Result<(), HandlerError> {
        let key = dedup_key(PRINT_TICKET, &event.header.effect_key());
        let event = &event;

        let outcome = self
            .ledger
            .apply_once(&key, move || async move {
                let file_name = ticket_file_name(&event.ticket_id);
                self.files
                    .store_file(ctx, &file_name, ticket_html(event))
                    .await?;

                let printed = TicketPrinted {
                    header: Header::new(self.clock.as_ref(), event.header.idempotency_key.clone()),
                    ticket_id: event.ticket_id.clone(),
                    file_name,
                };
                self.events.publish(ctx, &printed).await?;
                Ok::<(), TicketingError>(())
            })
            .await?;

        log_outcome(PRINT_TICKET, &key, outcome);
        Ok(())
    }
}

/// Stores every confirmed ticket in the `tickets` table.
pub struct StoreTicketHandler {
    tickets: Arc<dyn TicketsRepository>,
}

impl StoreTicketHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(tickets: Arc<dyn TicketsRepository>) -> Self {
        Self { tickets }
    }
}

#[async_trait]
impl EventHandler<TicketBookingConfirmed> for StoreTicketHandler {
    async fn handle(&self, _ctx: &Context, event: TicketBookingConfirmed) -> Result<(), HandlerError> {
        self.tickets
            .add_ticket(&Ticket {
                ticket_id: event.ticket_id,
                price: event.price,
                customer_email: event.customer_email,
            })
            .await?;
        Ok(())
    }
}

/// Appends every canceled ticket to the refund tracker sheet.
pub struct AppendToRefundsHandler<L> {
    ledger: Arc<L>,
    sheets: Arc<dyn AppendSpreadsheetRow>,
}

impl<L: DedupLedger> AppendToRefundsHandler<L> {
    /// Create the handler.
    #[must_use]
    pub fn new(ledger: Arc<L>, sheets: Arc<dyn AppendSpreadsheetRow>) -> Self {
        Self { ledger, sheets }
    }
}

#[async_trait]
impl<L: DedupLedger + 'static> EventHandler<TicketBookingCanceled> for AppendToRefundsHandler<L> {
    async fn handle(&self, ctx: &Context, event: TicketBookingCanceled) -> Result<(), HandlerError> {
        let key = dedup_key(APPEND_TO_REFUNDS, &event.header.effect_key());
        let row = event.spreadsheet_row();

        let outcome = self
            .ledger
            .apply_once(&key, move || async move {
                self.sheets.append_row(ctx, TICKETS_TO_REFUND_SHEET, row).await
            })
            .await?;

        log_outcome(APPEND_TO_REFUNDS, &key, outcome);
        Ok(())
    }
}

/// Deletes every canceled ticket from the `tickets` table.
pub struct RemoveTicketHandler {
    tickets: Arc<dyn TicketsRepository>,
}

impl RemoveTicketHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(tickets: Arc<dyn TicketsRepository>) -> Self {
        Self { tickets }
    }
}

#[async_trait]
impl EventHandler<TicketBookingCanceled> for RemoveTicketHandler {
    async fn handle(&self, _ctx: &Context, event: TicketBookingCanceled) -> Result<(), HandlerError> {
        self.tickets.remove_ticket(&event.ticket_id).await?;
        Ok(())
    }
}

/// Books the seats of every booking at the external ticket partner.
pub struct BookExternalSeatHandler<L> {
    ledger: Arc<L>,
    shows: Arc<dyn ShowsRepository>,
    partner: Arc<dyn BookExternalSeat>,
}

impl<L: DedupLedger> BookExternalSeatHandler<L> {
    /// Create the handler.
    #[must_use]
    pub fn new(ledger: Arc<L>, shows: Arc<dyn ShowsRepository>, partner: Arc<dyn BookExternalSeat>) -> Self {
        Self {
            ledger,
            shows,
            partner,
        }
    }
}

#[async_trait]
impl<L: DedupLedger + 'static> EventHandler<BookingMade> for BookExternalSeatHandler<L> {
    async fn handle(&self, ctx: &Context, event: BookingMade) -> Result<(), HandlerError> {
        let show = self.shows.show(event.show_id).await?.ok_or_else(|| {
            TicketingError::Validation(format!("booking {} is for unknown show {}", event.booking_id, event.show_id))
        })?;

        let key = dedup_key(BOOK_EXTERNAL_SEAT, &event.booking_id.to_string());
        let booking = ExternalSeatBooking {
            customer_email: event.customer_email,
            event_id: show.dead_nation_id,
            number_of_tickets: event.number_of_tickets,
            booking_id: event.booking_id,
        };

        let outcome = self
            .ledger
            .apply_once(&key, move || async move { self.partner.book_seat(ctx, booking).await })
            .await?;

        log_outcome(BOOK_EXTERNAL_SEAT, &key, outcome);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::capabilities::{Capability, InMemoryServices};
    use crate::entities::{Money, Show};
    use crate::repository::InMemoryRepository;
    use ticketflow_core::payload::{Event, Payload};
    use ticketflow_testing::{InMemoryBroker, InMemoryDedupLedger, test_clock};
    use uuid::Uuid;

    fn confirmed(ticket_id: &str) -> TicketBookingConfirmed {
        TicketBookingConfirmed {
            header: Header::new(&test_clock(), format!("req-1{ticket_id}")),
            ticket_id: ticket_id.to_string(),
            customer_email: "fan@example.com".to_string(),
            price: Money::new("50.00", "EUR"),
            booking_id: None,
        }
    }

    #[tokio::test]
    async fn failed_receipt_is_issued_on_redelivery() {
        let services = Arc::new(InMemoryServices::new());
        let broker = Arc::new(InMemoryBroker::new());
        let handler = IssueReceiptHandler::new(
            Arc::new(InMemoryDedupLedger::new()),
            services.clone(),
            EventBus::new(broker.clone()),
            Arc::new(test_clock()),
        );
        services.fail_next(Capability::IssueReceipt, 1);
        let ctx = Context::background();

        let first = handler.handle(&ctx, confirmed("t-1")).await;
        assert!(matches!(first, Err(ref e) if e.is_retryable()));
        assert!(services.issued_receipts().is_empty());

        handler.handle(&ctx, confirmed("t-1")).await.unwrap();
        assert_eq!(services.issued_receipts().len(), 1);
        assert_eq!(broker.published(&TicketReceiptIssued::topic()).len(), 1);
    }

    #[tokio::test]
    async fn failed_publish_redoes_the_print() {
        let services = Arc::new(InMemoryServices::new());
        let broker = Arc::new(InMemoryBroker::new());
        let handler = PrintTicketHandler::new(
            Arc::new(InMemoryDedupLedger::new()),
            services.clone(),
            EventBus::new(broker.clone()),
            Arc::new(test_clock()),
        );
        broker.fail_publishes(1);
        let ctx = Context::background();
        let event = confirmed("t-1");

        assert!(handler.handle(&ctx, event.clone()).await.is_err());
        handler.handle(&ctx, event).await.unwrap();

        assert_eq!(services.file("t-1-ticket.html").map(|f| f.contains("50.00 EUR")), Some(true));
        let printed = broker.published(&TicketPrinted::topic());
        assert_eq!(printed.len(), 1);
        assert_eq!(printed[0].payload_type(), Some(TicketPrinted::NAME));
    }

    #[tokio::test]
    async fn canceled_ticket_is_tracked_and_removed() {
        let services = Arc::new(InMemoryServices::new());
        let repo = Arc::new(InMemoryRepository::new());
        let ledger = Arc::new(InMemoryDedupLedger::new());
        let ctx = Context::background();

        let store = StoreTicketHandler::new(repo.clone());
        store.handle(&ctx, confirmed("t-1")).await.unwrap();
        assert_eq!(repo.all_tickets().await.unwrap().len(), 1);

        let canceled = TicketBookingCanceled {
            header: Header::new(&test_clock(), "req-2t-1"),
            ticket_id: "t-1".to_string(),
            customer_email: "fan@example.com".to_string(),
            price: Money::new("50.00", ""),
        };
        let refunds = AppendToRefundsHandler::new(ledger, services.clone());
        refunds.handle(&ctx, canceled.clone()).await.unwrap();
        refunds.handle(&ctx, canceled.clone()).await.unwrap();
        RemoveTicketHandler::new(repo.clone())
            .handle(&ctx, canceled)
            .await
            .unwrap();

        assert_eq!(
            services.sheet_rows(TICKETS_TO_REFUND_SHEET),
            vec![vec![
                "t-1".to_string(),
                "fan@example.com".to_string(),
                "50.00".to_string(),
                "USD".to_string()
            ]]
        );
        assert!(repo.all_tickets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn external_seats_use_the_partner_show_id() {
        let services = Arc::new(InMemoryServices::new());
        let repo = Arc::new(InMemoryRepository::new());
        let show = Show {
            show_id: Uuid::new_v4(),
            dead_nation_id: Uuid::new_v4(),
            number_of_tickets: 10,
            start_time: test_clock().now(),
            title: "Moon Safari".to_string(),
            venue: "Hall 1".to_string(),
        };
        repo.add_show(&show).await.unwrap();
        let handler = BookExternalSeatHandler::new(Arc::new(InMemoryDedupLedger::new()), repo, services.clone());

        let booking = BookingMade {
            header: Header::new(&test_clock(), "b-key"),
            number_of_tickets: 2,
            booking_id: Uuid::new_v4(),
            customer_email: "fan@example.com".to_string(),
            show_id: show.show_id,
        };
        let ctx = Context::background();
        handler.handle(&ctx, booking.clone()).await.unwrap();
        handler.handle(&ctx, booking).await.unwrap();

        let booked = services.external_bookings();
        assert_eq!(booked.len(), 1);
        assert_eq!(booked[0].event_id, show.dead_nation_id);
        assert_eq!(booked[0].number_of_tickets, 2);
    }

    #[tokio::test]
    async fn booking_for_unknown_show_is_permanent() {
        let handler = BookExternalSeatHandler::new(
            Arc::new(InMemoryDedupLedger::new()),
            Arc::new(InMemoryRepository::new()),
            Arc::new(InMemoryServices::new()),
        );
        let booking = BookingMade {
            header: Header::new(&test_clock(), "b-key"),
            number_of_tickets: 1,
            booking_id: Uuid::new_v4(),
            customer_email: "fan@example.com".to_string(),
            show_id: Uuid::new_v4(),
        };

        let result = handler.handle(&Context::background(), booking).await;
        assert!(matches!(result, Err(ref e) if e.is_permanent()));
    }
}
