//! Outbound capabilities: the external services handlers call.
//!
//! Each capability is a narrow trait. Handlers depend on the traits only;
//! concrete clients are chosen in the composition root. [`InMemoryServices`]
//! implements all of them in-process, records every call and can be told to
//! fail, for tests and local runs.
//!
//! Failures are reported as [`TicketingError`]. Adapters classify them:
//! `Transport` (retried) unless the service rejected the request as invalid
//! (`Validation`, not retried).

use crate::entities::Money;
use crate::error::TicketingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use ticketflow_core::Context;
use ticketflow_core::environment::{Clock, SystemClock};
use uuid::Uuid;

/// Receipt request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueReceiptRequest {
    /// Ticket the receipt is for
    pub ticket_id: String,
    /// Amount charged
    pub price: Money,
    /// Key the receipts service deduplicates on
    pub idempotency_key: String,
}

/// Issued receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueReceiptResponse {
    /// Receipt number
    pub receipt_number: String,
    /// Issue time
    pub issued_at: DateTime<Utc>,
}

/// Receipt void request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoidReceiptRequest {
    /// Ticket whose receipt is voided
    pub ticket_id: String,
    /// Why
    pub reason: String,
    /// Key the receipts service deduplicates on
    pub idempotency_key: String,
}

/// Payment refund request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRefundRequest {
    /// Ticket whose payment is refunded
    pub ticket_id: String,
    /// Why
    pub reason: String,
    /// Key the payments service deduplicates on
    pub idempotency_key: String,
}

/// Seat booking at the external ticket partner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSeatBooking {
    /// Customer contact
    pub customer_email: String,
    /// Partner's id of the show
    pub event_id: Uuid,
    /// Seats
    pub number_of_tickets: i32,
    /// Our booking id
    pub booking_id: Uuid,
}

/// Issues receipts.
#[async_trait]
pub trait IssueReceipt: Send + Sync {
    /// Issue a receipt.
    async fn issue_receipt(
        &self,
        ctx: &Context,
        request: IssueReceiptRequest,
    ) -> Result<IssueReceiptResponse, TicketingError>;
}

/// Voids receipts.
#[async_trait]
pub trait VoidReceipt: Send + Sync {
    /// Void the receipt of a ticket.
    async fn void_receipt(&self, ctx: &Context, request: VoidReceiptRequest) -> Result<(), TicketingError>;
}

/// Appends rows to shared spreadsheets.
#[async_trait]
pub trait AppendSpreadsheetRow: Send + Sync {
    /// Append `row` to the sheet named `sheet`.
    async fn append_row(&self, ctx: &Context, sheet: &str, row: Vec<String>) -> Result<(), TicketingError>;
}

/// Stores ticket files.
#[async_trait]
pub trait StoreTicketFile: Send + Sync {
    /// Store `content` as `file_name`. Storing an existing file succeeds.
    async fn store_file(&self, ctx: &Context, file_name: &str, content: String) -> Result<(), TicketingError>;
}

/// Books seats at the external ticket partner.
#[async_trait]
pub trait BookExternalSeat: Send + Sync {
    /// Book the seats of a booking.
    async fn book_seat(&self, ctx: &Context, booking: ExternalSeatBooking) -> Result<(), TicketingError>;
}

/// Refunds payments.
#[async_trait]
pub trait RefundPayment: Send + Sync {
    /// Refund the payment of a ticket.
    async fn refund_payment(&self, ctx: &Context, request: PaymentRefundRequest) -> Result<(), TicketingError>;
}

/// The capabilities handlers are built from.
#[derive(Clone)]
pub struct Capabilities {
    /// Receipt issuing
    pub receipts: Arc<dyn IssueReceipt>,
    /// Receipt voiding
    pub receipt_voids: Arc<dyn VoidReceipt>,
    /// Spreadsheet rows
    pub spreadsheets: Arc<dyn AppendSpreadsheetRow>,
    /// Ticket files
    pub files: Arc<dyn StoreTicketFile>,
    /// External seat bookings
    pub partner: Arc<dyn BookExternalSeat>,
    /// Payment refunds
    pub payments: Arc<dyn RefundPayment>,
}

impl Capabilities {
    /// Every capability served by one [`InMemoryServices`].
    #[must_use]
    pub fn in_memory(services: &Arc<InMemoryServices>) -> Self {
        Self {
            receipts: services.clone(),
            receipt_voids: services.clone(),
            spreadsheets: services.clone(),
            files: services.clone(),
            partner: services.clone(),
            payments: services.clone(),
        }
    }
}

/// Capability names, for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// [`IssueReceipt`]
    IssueReceipt,
    /// [`VoidReceipt`]
    VoidReceipt,
    /// [`AppendSpreadsheetRow`]
    AppendSpreadsheetRow,
    /// [`StoreTicketFile`]
    StoreTicketFile,
    /// [`BookExternalSeat`]
    BookExternalSeat,
    /// [`RefundPayment`]
    RefundPayment,
}

#[derive(Debug, Default)]
struct Recorded {
    receipts: Vec<IssueReceiptRequest>,
    voided: Vec<VoidReceiptRequest>,
    rows: BTreeMap<String, Vec<Vec<String>>>,
    files: BTreeMap<String, String>,
    file_writes: usize,
    seats: Vec<ExternalSeatBooking>,
    refunds: Vec<PaymentRefundRequest>,
    failures: HashMap<Capability, usize>,
}

/// In-process implementation of every capability.
#[derive(Clone)]
pub struct InMemoryServices {
    recorded: Arc<Mutex<Recorded>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryServices {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryServices {
    /// Create services stamped by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create services stamped by `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            recorded: Arc::new(Mutex::new(Recorded::default())),
            clock,
        }
    }

    // Poisoning only follows a panic while the lock is held, which none of
    // the short critical sections below can produce.
    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make the next `count` calls of `capability` fail with a transport error.
    pub fn fail_next(&self, capability: Capability, count: usize) {
        self.lock().failures.insert(capability, count);
    }

    fn check(recorded: &mut Recorded, capability: Capability) -> Result<(), TicketingError> {
        match recorded.failures.get_mut(&capability) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(TicketingError::Transport(format!(
                    "{capability:?} unavailable (injected)"
                )))
            },
            _ => Ok(()),
        }
    }

    /// Receipts issued so far.
    #[must_use]
    pub fn issued_receipts(&self) -> Vec<IssueReceiptRequest> {
        self.lock().receipts.clone()
    }

    /// Receipts voided so far.
    #[must_use]
    pub fn voided_receipts(&self) -> Vec<VoidReceiptRequest> {
        self.lock().voided.clone()
    }

    /// Rows appended to `sheet`.
    #[must_use]
    pub fn sheet_rows(&self, sheet: &str) -> Vec<Vec<String>> {
        self.lock().rows.get(sheet).cloned().unwrap_or_default()
    }

    /// Content of a stored file.
    #[must_use]
    pub fn file(&self, file_name: &str) -> Option<String> {
        self.lock().files.get(file_name).cloned()
    }

    /// Number of file store calls, including ones for existing files.
    #[must_use]
    pub fn file_writes(&self) -> usize {
        self.lock().file_writes
    }

    /// External seat bookings made so far.
    #[must_use]
    pub fn external_bookings(&self) -> Vec<ExternalSeatBooking> {
        self.lock().seats.clone()
    }

    /// Payment refunds made so far.
    #[must_use]
    pub fn refunds(&self) -> Vec<PaymentRefundRequest> {
        self.lock().refunds.clone()
    }
}

#[async_trait]
impl IssueReceipt for InMemoryServices {
    async fn issue_receipt(
        &self,
        _ctx: &Context,
        request: IssueReceiptRequest,
    ) -> Result<IssueReceiptResponse, TicketingError> {
        let mut recorded = self.lock();
        Self::check(&mut recorded, Capability::IssueReceipt)?;
        recorded.receipts.push(request);
        Ok(IssueReceiptResponse {
            receipt_number: format!("receipt-{}", recorded.receipts.len()),
            issued_at: self.clock.now(),
        })
    }
}

#[async_trait]
impl VoidReceipt for InMemoryServices {
    async fn void_receipt(&self, _ctx: &Context, request: VoidReceiptRequest) -> Result<(), TicketingError> {
        let mut recorded = self.lock();
        Self::check(&mut recorded, Capability::VoidReceipt)?;
        recorded.voided.push(request);
        Ok(())
    }
}

#[async_trait]
impl AppendSpreadsheetRow for InMemoryServices {
    async fn append_row(&self, _ctx: &Context, sheet: &str, row: Vec<String>) -> Result<(), TicketingError> {
        let mut recorded = self.lock();
        Self::check(&mut recorded, Capability::AppendSpreadsheetRow)?;
        recorded.rows.entry(sheet.to_string()).or_default().push(row);
        Ok(())
    }
}

#[async_trait]
impl StoreTicketFile for InMemoryServices {
    async fn store_file(&self, _ctx: &Context, file_name: &str, content: String) -> Result<(), TicketingError> {
        let mut recorded = self.lock();
        Self::check(&mut recorded, Capability::StoreTicketFile)?;
        recorded.file_writes += 1;
        if recorded.files.contains_key(file_name) {
            tracing::info!(file_name, "File already exists");
        } else {
            recorded.files.insert(file_name.to_string(), content);
        }
        Ok(())
    }
}

#[async_trait]
impl BookExternalSeat for InMemoryServices {
    async fn book_seat(&self, _ctx: &Context, booking: ExternalSeatBooking) -> Result<(), TicketingError> {
        let mut recorded = self.lock();
        Self::check(&mut recorded, Capability::BookExternalSeat)?;
        recorded.seats.push(booking);
        Ok(())
    }
}

#[async_trait]
impl RefundPayment for InMemoryServices {
    async fn refund_payment(&self, _ctx: &Context, request: PaymentRefundRequest) -> Result<(), TicketingError> {
        let mut recorded = self.lock();
        Self::check(&mut recorded, Capability::RefundPayment)?;
        recorded.refunds.push(request);
        Ok(())
    }
}
