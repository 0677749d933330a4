//! # Tickets
//!
//! Ticket booking service built on the Ticketflow messaging core.
//!
//! Requests enter through [`service::TicketService`] and become events and
//! commands. Handlers registered by [`app::register_handlers`] react to them:
//!
//! - `TicketBookingConfirmed` issues a receipt, tracks the ticket for
//!   printing, prints it and stores it
//! - `TicketBookingCanceled` tracks the refund and removes the ticket
//! - `BookingMade` books the seats with the partner
//! - `RefundTicket` voids the receipt and refunds the payment
//!
//! Every external effect runs at most once per idempotency key through the
//! dedup ledger. The ops read model in [`read_model`] folds the lifecycle
//! events of a booking into one document. [`booking::BookingAllocator`]
//! allocates seats without overbooking and appends `BookingMade` to the
//! outbox in the same transaction.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Composition root
pub mod app;

/// Seat allocation
pub mod booking;

/// Outbound capabilities and their in-process implementations
pub mod capabilities;

/// Environment configuration
pub mod config;

/// Events, commands and value types
pub mod entities;

/// Error type
pub mod error;

/// Event and command handlers
pub mod handlers;

/// Ops bookings read model
pub mod read_model;

/// Ticket and show storage
pub mod repository;

/// Inbound operations
pub mod service;

pub use app::{Application, Dependencies, register_handlers, serve};
pub use config::Config;
pub use error::TicketingError;
pub use service::TicketService;
