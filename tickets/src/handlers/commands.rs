//! Command handlers.

use super::{REFUND_REASON, REFUND_TICKET, log_outcome};
use crate::capabilities::{PaymentRefundRequest, RefundPayment, VoidReceipt, VoidReceiptRequest};
use crate::entities::{Header, RefundTicket, TicketRefunded};
use crate::error::TicketingError;
use async_trait::async_trait;
use std::sync::Arc;
use ticketflow_core::Context;
use ticketflow_core::dedup::{DedupLedger, dedup_key};
use ticketflow_core::environment::Clock;
use ticketflow_runtime::{CommandHandler, EventBus, HandlerError};

/// Ledger operation of the receipt void.
const VOID_RECEIPT: &str = "void-receipt";
/// Ledger operation of the payment refund.
const REFUND_PAYMENT: &str = "refund-payment";

/// Refunds a ticket: voids its receipt, refunds its payment, then publishes
/// `TicketRefunded`.
///
/// The command's idempotency key is mandatory. Each effect has its own ledger
/// entry, so a replay after a partial failure only redoes what did not
/// complete.
pub struct RefundTicketHandler<L> {
    ledger: Arc<L>,
    receipts: Arc<dyn VoidReceipt>,
    payments: Arc<dyn RefundPayment>,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl<L: DedupLedger> RefundTicketHandler<L> {
    /// Create the handler.
    #[must_use]
    pub fn new(
        ledger: Arc<L>,
        receipts: Arc<dyn VoidReceipt>,
        payments: Arc<dyn RefundPayment>,
        events: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            receipts,
            payments,
            events,
            clock,
        }
    }

    async fn refund(&self, ctx: &Context, command: &RefundTicket) -> Result<(), TicketingError> {
        let idempotency_key = command.header.idempotency_key.as_str();
        if idempotency_key.is_empty() {
            return Err(TicketingError::Validation(format!(
                "refund of ticket {} has no idempotency key",
                command.ticket_id
            )));
        }

        let void_key = dedup_key(VOID_RECEIPT, idempotency_key);
        let voided = self
            .ledger
            .apply_once(&void_key, || {
                self.receipts.void_receipt(
                    ctx,
                    VoidReceiptRequest {
                        ticket_id: command.ticket_id.clone(),
                        reason: REFUND_REASON.to_string(),
                        idempotency_key: idempotency_key.to_string(),
                    },
                )
            })
            .await?;
        log_outcome(REFUND_TICKET, &void_key, voided);

        let refund_key = dedup_key(REFUND_PAYMENT, idempotency_key);
        let refunded = self
            .ledger
            .apply_once(&refund_key, || {
                self.payments.refund_payment(
                    ctx,
                    PaymentRefundRequest {
                        ticket_id: command.ticket_id.clone(),
                        reason: REFUND_REASON.to_string(),
                        idempotency_key: idempotency_key.to_string(),
                    },
                )
            })
            .await?;
        log_outcome(REFUND_TICKET, &refund_key, refunded);

        let event = TicketRefunded {
            header: Header::new(self.clock.as_ref(), idempotency_key),
            ticket_id: command.ticket_id.clone(),
        };
        self.events.publish(ctx, &event).await?;

        tracing::info!(ticket_id = %command.ticket_id, "Ticket refunded");
        Ok(())
    }
}

#[async_trait]
impl<L: DedupLedger + 'static> CommandHandler<RefundTicket> for RefundTicketHandler<L> {
    async fn handle(&self, ctx: &Context, command: RefundTicket) -> Result<(), HandlerError> {
        self.refund(ctx, &command).await?;
        Ok(())
    }
}
