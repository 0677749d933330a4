//! Ticket domain types: money, headers, events, commands and the ops read
//! model.

mod commands;
mod events;
mod header;
mod money;
mod ops;

pub use commands::RefundTicket;
pub use events::{
    BookingMade, TicketBookingCanceled, TicketBookingConfirmed, TicketPrinted, TicketReceiptIssued,
    TicketRefunded,
};
pub use header::{CommandHeader, EventHeader, Header, derived_idempotency_key};
pub use money::{DEFAULT_CURRENCY, Money};
pub use ops::{OpsBooking, OpsTicket, STATUS_CONFIRMED, STATUS_REFUNDED};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A show tickets can be booked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Show {
    /// Show id
    pub show_id: Uuid,
    /// Id of the show at the external ticket partner
    pub dead_nation_id: Uuid,
    /// Seat capacity
    pub number_of_tickets: i32,
    /// Start time
    pub start_time: DateTime<Utc>,
    /// Title
    pub title: String,
    /// Venue
    pub venue: String,
}

/// A stored ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket id
    pub ticket_id: String,
    /// Price
    pub price: Money,
    /// Customer contact
    pub customer_email: String,
}

/// A ticket status change reported by the booking provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketStatusUpdate {
    /// Ticket id
    pub ticket_id: String,
    /// `confirmed` or `canceled`
    pub status: String,
    /// Customer contact
    pub customer_email: String,
    /// Ticket price
    pub price: Money,
    /// Booking the ticket belongs to
    #[serde(default)]
    pub booking_id: Option<String>,
}
