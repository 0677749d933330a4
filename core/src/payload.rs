//! Typed payloads and topic generation.
//!
//! A payload is any serde type with a stable logical name. Events and commands
//! share the same mechanism and differ only in the topic namespace:
//!
//! | Kind    | Topic                | Handlers        |
//! |---------|----------------------|-----------------|
//! | Event   | `events.<Name>`      | zero or more    |
//! | Command | `commands.<Name>`    | exactly one     |
//!
//! # Example
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use ticketflow_core::payload::{Event, Payload};
//!
//! #[derive(Serialize, Deserialize)]
//! struct TicketPrinted {
//!     ticket_id: String,
//! }
//!
//! impl Payload for TicketPrinted {
//!     const NAME: &'static str = "TicketPrinted";
//! }
//! impl Event for TicketPrinted {}
//!
//! assert_eq!(TicketPrinted::topic(), "events.TicketPrinted");
//! ```

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// Topic namespace of a payload kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Facts that already happened; fan out to many handlers.
    Events,
    /// Requests for work; exactly one handler.
    Commands,
}

impl Namespace {
    /// Topic prefix for this namespace.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Commands => "commands",
        }
    }

    /// Generate the topic for a payload name.
    #[must_use]
    pub fn topic(self, name: &str) -> String {
        format!("{}.{name}", self.prefix())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A serializable payload with a stable logical name.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical name, recorded as the envelope `type` and used for the topic.
    const NAME: &'static str;
}

/// Marker for payloads published on the event namespace.
pub trait Event: Payload {
    /// Topic this event is published on.
    #[must_use]
    fn topic() -> String {
        Namespace::Events.topic(Self::NAME)
    }
}

/// Marker for payloads sent on the command namespace.
pub trait Command: Payload {
    /// Topic this command is sent on.
    #[must_use]
    fn topic() -> String {
        Namespace::Commands.topic(Self::NAME)
    }
}
