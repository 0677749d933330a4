//! Router middleware: decorators around a [`MessageHandler`].
//!
//! The router wraps every handler in a fixed chain, outermost first:
//!
//! ```text
//! ┌─ Recoverer ─────────────────────────────────────────────┐
//! │ panic → HandlerError::Panicked (router nacks)           │
//! │ ┌─ CorrelationId ─────────────────────────────────────┐ │
//! │ │ metadata correlation_id or minted → Context + span  │ │
//! │ │ ┌─ Logging ───────────────────────────────────────┐ │ │
//! │ │ │ "Handling a message" / "Message handling error" │ │ │
//! │ │ │ ┌─ Retry ─────────────────────────────────────┐ │ │ │
//! │ │ │ │ exponential backoff, cancelled on shutdown  │ │ │ │
//! │ │ │ │            handler body                     │ │ │ │
//! │ │ │ └─────────────────────────────────────────────┘ │ │ │
//! │ │ └─────────────────────────────────────────────────┘ │ │
//! │ └─────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────┘
//! ```

use crate::handler::{HandlerError, HandlerFuture, MessageHandler};
use crate::retry::{RetryPolicy, retry_until_cancelled};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::Instrument;
use ticketflow_core::{Context, Message, Uuid};

/// A decorator producing a new handler around `next`.
pub trait Middleware: Send + Sync {
    /// Wrap `next`.
    fn wrap(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler>;
}

/// Wrap `handler` in `chain`, where `chain[0]` ends up outermost.
#[must_use]
pub fn apply(chain: &[Arc<dyn Middleware>], handler: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
    chain
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware.wrap(next))
}

/// The router's chain: recoverer, correlation id, logging, retry.
#[must_use]
pub fn default_chain(retry: RetryPolicy) -> Vec<Arc<dyn Middleware>> {
    vec![
        Arc::new(Recoverer),
        Arc::new(CorrelationId),
        Arc::new(Logging),
        Arc::new(Retry::new(retry)),
    ]
}

/// Converts panics in inner layers into [`HandlerError::Panicked`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Recoverer;

impl Middleware for Recoverer {
    fn wrap(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        Arc::new(RecovererHandler { next })
    }
}

struct RecovererHandler {
    next: Arc<dyn MessageHandler>,
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

impl MessageHandler for RecovererHandler {
    fn handle<'a>(&'a self, ctx: &'a Context, message: &'a Message) -> HandlerFuture<'a> {
        Box::pin(async move {
            match AssertUnwindSafe(self.next.handle(ctx, message))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let reason = panic_reason(panic.as_ref());
                    tracing::error!(
                        handler = ctx.handler().unwrap_or_default(),
                        message_id = %message.id,
                        panic = %reason,
                        "Handler panicked, message will be redelivered"
                    );
                    metrics::counter!("router_handler_panics_total").increment(1);
                    Err(HandlerError::Panicked(reason))
                },
            }
        })
    }
}

/// Reads the correlation id from message metadata (minting one when absent),
/// attaches it to the [`Context`] and to a tracing span around inner layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrelationId;

impl Middleware for CorrelationId {
    fn wrap(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        Arc::new(CorrelationIdHandler { next })
    }
}

struct CorrelationIdHandler {
    next: Arc<dyn MessageHandler>,
}

impl MessageHandler for CorrelationIdHandler {
    fn handle<'a>(&'a self, ctx: &'a Context, message: &'a Message) -> HandlerFuture<'a> {
        let correlation_id = message
            .correlation_id()
            .map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);

        let span = tracing::info_span!(
            "message",
            correlation_id = %correlation_id,
            message_id = %message.id,
            handler = ctx.handler().unwrap_or_default(),
        );
        let ctx = ctx.clone().with_correlation_id(correlation_id);

        Box::pin(async move { self.next.handle(&ctx, message).await }.instrument(span))
    }
}

/// Structured start and error log per message.
#[derive(Debug, Clone, Copy, Default)]
pub struct Logging;

impl Middleware for Logging {
    fn wrap(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        Arc::new(LoggingHandler { next })
    }
}

struct LoggingHandler {
    next: Arc<dyn MessageHandler>,
}

impl MessageHandler for LoggingHandler {
    fn handle<'a>(&'a self, ctx: &'a Context, message: &'a Message) -> HandlerFuture<'a> {
        Box::pin(async move {
            tracing::info!(
                message_type = message.payload_type().unwrap_or_default(),
                "Handling a message"
            );

            let result = self.next.handle(ctx, message).await;
            if let Err(error) = &result {
                tracing::error!(error = %error, "Message handling error");
            }
            result
        })
    }
}

/// Re-invokes inner layers on retryable errors with exponential backoff.
///
/// The backoff sleep ends early when the context is cancelled; the last error
/// is then returned so the router nacks the message.
#[derive(Debug, Clone)]
pub struct Retry {
    policy: RetryPolicy,
}

impl Retry {
    /// Create a retry middleware with the given policy.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Middleware for Retry {
    fn wrap(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        Arc::new(RetryHandler {
            next,
            policy: self.policy.clone(),
        })
    }
}

struct RetryHandler {
    next: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
}

impl MessageHandler for RetryHandler {
    fn handle<'a>(&'a self, ctx: &'a Context, message: &'a Message) -> HandlerFuture<'a> {
        Box::pin(retry_until_cancelled(
            &self.policy,
            move || self.next.handle(ctx, message),
            HandlerError::is_retryable,
            ctx.cancelled(),
        ))
    }
}
