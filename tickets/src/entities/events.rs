//! Domain events of the ticket service.
//!
//! Each event is published on `events.<Name>` and carries a [`Header`].

use super::{Header, Money};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ticketflow_core::payload::{Event, Payload};
use uuid::Uuid;

macro_rules! event {
    ($ty:ident) => {
        impl Payload for $ty {
            const NAME: &'static str = stringify!($ty);
        }
        impl Event for $ty {}
    };
}

/// A booking was accepted for a show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingMade {
    /// Event header
    pub header: Header,
    /// Seats booked
    pub number_of_tickets: i32,
    /// Booking id
    pub booking_id: Uuid,
    /// Customer contact
    pub customer_email: String,
    /// Show the seats were booked for
    pub show_id: Uuid,
}
event!(BookingMade);

/// A ticket of a booking was confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketBookingConfirmed {
    /// Event header
    pub header: Header,
    /// Ticket id
    pub ticket_id: String,
    /// Customer contact
    pub customer_email: String,
    /// Ticket price
    pub price: Money,
    /// Booking the ticket belongs to, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<String>,
}
event!(TicketBookingConfirmed);

impl TicketBookingConfirmed {
    /// Row appended to the print tracker.
    #[must_use]
    pub fn spreadsheet_row(&self) -> Vec<String> {
        vec![
            self.ticket_id.clone(),
            self.customer_email.clone(),
            self.price.amount().to_string(),
            self.price.currency().to_string(),
        ]
    }
}

/// A ticket booking was canceled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketBookingCanceled {
    /// Event header
    pub header: Header,
    /// Ticket id
    pub ticket_id: String,
    /// Customer contact
    pub customer_email: String,
    /// Ticket price
    pub price: Money,
}
event!(TicketBookingCanceled);

impl TicketBookingCanceled {
    /// Row appended to the refund tracker.
    #[must_use]
    pub fn spreadsheet_row(&self) -> Vec<String> {
        vec![
            self.ticket_id.clone(),
            self.customer_email.clone(),
            self.price.amount().to_string(),
            self.price.currency().to_string(),
        ]
    }
}

/// A ticket file was generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketPrinted {
    /// Event header
    pub header: Header,
    /// Ticket id
    pub ticket_id: String,
    /// Stored file name
    pub file_name: String,
}
event!(TicketPrinted);

/// A receipt was issued for a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketReceiptIssued {
    /// Event header
    pub header: Header,
    /// Ticket id
    pub ticket_id: String,
    /// Receipt number assigned by the receipts service
    pub receipt_number: String,
    /// When the receipt was issued
    pub issued_at: DateTime<Utc>,
}
event!(TicketReceiptIssued);

/// A ticket refund completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRefunded {
    /// Event header
    pub header: Header,
    /// Ticket id
    pub ticket_id: String,
}
event!(TicketRefunded);
