//! Idempotent handlers of the ticket service.
//!
//! Every handler may see the same message more than once. Effects visible
//! outside the service (receipts, spreadsheet rows, files, partner bookings,
//! payment refunds) run through [`DedupLedger::apply_once`] keyed by
//! `<handler>:<effect key>`, so redelivery never repeats them. Writes that are
//! idempotent on their own (ticket rows) skip the ledger.
//!
//! Events a handler emits as part of its effect are published inside the
//! effect: if publishing fails the key stays unrecorded and the redelivery
//! redoes both.
//!
//! [`DedupLedger::apply_once`]: ticketflow_core::dedup::DedupLedger::apply_once

mod commands;
mod events;

pub use commands::RefundTicketHandler;
pub use events::{
    AppendToRefundsHandler, AppendToTrackerHandler, BookExternalSeatHandler, IssueReceiptHandler,
    PrintTicketHandler, RemoveTicketHandler, StoreTicketHandler,
};

use ticketflow_core::dedup::Dedup;

/// Router name of [`IssueReceiptHandler`].
pub const ISSUE_RECEIPT: &str = "issue-receipt";
/// Router name of [`AppendToTrackerHandler`].
pub const APPEND_TO_TRACKER: &str = "append-to-tracker";
/// Router name of [`PrintTicketHandler`].
pub const PRINT_TICKET: &str = "print-ticket";
/// Router name of [`StoreTicketHandler`].
pub const STORE_TICKET: &str = "store-ticket";
/// Router name of [`AppendToRefundsHandler`].
pub const APPEND_TO_REFUNDS: &str = "append-to-refunds";
/// Router name of [`RemoveTicketHandler`].
pub const REMOVE_TICKET: &str = "remove-ticket";
/// Router name of [`BookExternalSeatHandler`].
pub const BOOK_EXTERNAL_SEAT: &str = "book-external-seat";
/// Router name of [`RefundTicketHandler`].
pub const REFUND_TICKET: &str = "refund-ticket";

/// Sheet confirmed tickets are appended to.
pub const TICKETS_TO_PRINT_SHEET: &str = "tickets-to-print";
/// Sheet canceled tickets are appended to.
pub const TICKETS_TO_REFUND_SHEET: &str = "tickets-to-refund";

/// Reason given when a refund voids a receipt or refunds a payment.
pub const REFUND_REASON: &str = "ticket refunded";

fn log_outcome(handler: &str, key: &str, outcome: Dedup) {
    match outcome {
        Dedup::Applied => tracing::debug!(handler, key, "Effect applied"),
        Dedup::AlreadyApplied => {
            tracing::info!(handler, key, "Effect already applied, skipping duplicate");
        },
    }
}
