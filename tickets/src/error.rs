//! Error taxonomy of the ticket service.
//!
//! | error | retried | surfaced as |
//! |---|---|---|
//! | `Validation` | never | permanent handler failure, 4xx |
//! | `NotEnoughSeatsAvailable` | never | business rejection, 4xx |
//! | `NotYetProjectable` | yes | transient handler failure |
//! | `Storage` / `Transport` | yes | transient handler failure |

use std::fmt::Display;
use thiserror::Error;
use ticketflow_core::dedup::LedgerError;
use ticketflow_core::outbox::OutboxError;
use ticketflow_projections::DocumentError;
use ticketflow_runtime::{BusError, HandlerError};

/// Errors of ticket operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TicketingError {
    /// Bad input, such as a missing idempotency key.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The show has fewer free seats than requested.
    #[error("Not enough seats available: {available} seats, {booked} booked")]
    NotEnoughSeatsAvailable {
        /// Seat capacity of the show
        available: i32,
        /// Seats already booked
        booked: i32,
    },

    /// An event arrived before the read model it updates exists.
    #[error("Not yet projectable: {0}")]
    NotYetProjectable(String),

    /// Database failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Broker or external service failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl TicketingError {
    /// Whether retrying the operation can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotYetProjectable(_) | Self::Storage(_) | Self::Transport(_)
        )
    }

    /// Wrap a storage failure with the operation that hit it.
    pub fn storage(context: &str, error: impl Display) -> Self {
        Self::Storage(format!("{context}: {error}"))
    }

    /// Wrap a transport failure with the operation that hit it.
    pub fn transport(context: &str, error: impl Display) -> Self {
        Self::Transport(format!("{context}: {error}"))
    }
}

impl From<TicketingError> for HandlerError {
    fn from(error: TicketingError) -> Self {
        if error.is_retryable() {
            Self::transient(error)
        } else {
            Self::permanent(error)
        }
    }
}

impl From<LedgerError> for TicketingError {
    fn from(error: LedgerError) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<OutboxError> for TicketingError {
    fn from(error: OutboxError) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<BusError> for TicketingError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::Marshal(e) => Self::Validation(e.to_string()),
            BusError::Outbox(e) => Self::Storage(e.to_string()),
            BusError::Broker(e) => Self::Transport(e.to_string()),
        }
    }
}

impl From<DocumentError> for TicketingError {
    fn from(error: DocumentError) -> Self {
        match error {
            DocumentError::NotFound(what) => Self::NotYetProjectable(what),
            DocumentError::Serialization(reason) => Self::Validation(reason),
            DocumentError::Conflict(_) | DocumentError::Storage(_) => {
                Self::Storage(error.to_string())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert!(!TicketingError::Validation("missing key".into()).is_retryable());
        assert!(
            !TicketingError::NotEnoughSeatsAvailable {
                available: 2,
                booked: 2
            }
            .is_retryable()
        );
        assert!(TicketingError::NotYetProjectable("b-1".into()).is_retryable());
        assert!(TicketingError::Storage("db".into()).is_retryable());
        assert!(TicketingError::Transport("broker".into()).is_retryable());
    }

    #[test]
    fn converts_into_handler_errors() {
        let transient: HandlerError = TicketingError::NotYetProjectable("b-1".into()).into();
        assert!(transient.is_retryable());

        let permanent: HandlerError = TicketingError::Validation("no key".into()).into();
        assert!(permanent.is_permanent());
    }

    #[test]
    fn missing_document_is_not_yet_projectable() {
        let error: TicketingError = DocumentError::NotFound("ticket t-1".into()).into();
        assert!(matches!(error, TicketingError::NotYetProjectable(_)));

        let conflict: TicketingError = DocumentError::Conflict("40001".into()).into();
        assert!(conflict.is_retryable());
    }
}
