//! Commands of the ticket service, sent on `commands.<Name>`.

use super::CommandHeader;
use serde::{Deserialize, Serialize};
use ticketflow_core::payload::{Command, Payload};

/// Refund a ticket: void its receipt and refund the payment.
///
/// The header's idempotency key is required; it keys both effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundTicket {
    /// Command header
    pub header: CommandHeader,
    /// Ticket to refund
    pub ticket_id: String,
}

impl Payload for RefundTicket {
    const NAME: &'static str = "RefundTicket";
}

impl Command for RefundTicket {}
