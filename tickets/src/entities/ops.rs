//! Operations read model: one document per booking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of a confirmed ticket.
pub const STATUS_CONFIRMED: &str = "confirmed";

/// Status of a refunded ticket.
pub const STATUS_REFUNDED: &str = "refunded";

/// A booking as operations see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsBooking {
    /// Booking id
    pub booking_id: String,
    /// When the booking was made
    pub booked_at: DateTime<Utc>,
    /// Last time any event changed this document
    pub last_update: DateTime<Utc>,
    /// Tickets of the booking by ticket id
    #[serde(default)]
    pub tickets: BTreeMap<String, OpsTicket>,
}

/// A ticket inside an [`OpsBooking`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsTicket {
    /// Price amount
    pub price_amount: String,
    /// Price currency
    pub price_currency: String,
    /// Customer contact
    pub customer_email: String,
    /// `confirmed` or `refunded`; empty until the confirmation is projected
    pub status: String,
    /// When the ticket file was generated
    pub printed_at: Option<DateTime<Utc>>,
    /// Ticket file name
    pub printed_file_name: String,
    /// When the receipt was issued
    pub receipt_issued_at: Option<DateTime<Utc>>,
    /// Receipt number
    pub receipt_number: String,
}

impl OpsTicket {
    /// Whether the ticket has been refunded.
    #[must_use]
    pub fn is_refunded(&self) -> bool {
        self.status == STATUS_REFUNDED
    }
}
