//! Dead-letter extension point.
//!
//! Messages the router gives up on (permanent failures, or deliveries that
//! keep failing past the delivery budget) are handed to a [`DeadLetterSink`]
//! before being acknowledged. The default sink only logs; the Postgres crate
//! provides a persistent queue with status management for operators.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use ticketflow_core::Message;

/// Errors from dead-letter sinks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// The sink could not store the message.
    #[error("Dead letter storage error: {0}")]
    Storage(String),
}

/// A message the router gave up on.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Handler that failed.
    pub handler: String,
    /// Topic the message was consumed from.
    pub topic: String,
    /// The failed message.
    pub message: Message,
    /// Final error.
    pub reason: String,
    /// Delivery attempts made.
    pub attempts: u32,
    /// When the router gave up.
    pub failed_at: DateTime<Utc>,
}

/// Destination for messages the router gives up on.
///
/// If the sink fails, the router nacks the message instead of dropping it.
pub trait DeadLetterSink: Send + Sync {
    /// Store a dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the letter was not stored.
    fn dead_letter<'a>(
        &'a self,
        letter: &'a DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + 'a>>;
}

/// Sink that reports dead letters through the error log and a counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDeadLetterSink;

impl DeadLetterSink for LoggingDeadLetterSink {
    fn dead_letter<'a>(
        &'a self,
        letter: &'a DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + 'a>> {
        Box::pin(async move {
            tracing::error!(
                handler = %letter.handler,
                topic = %letter.topic,
                message_id = %letter.message.id,
                attempts = letter.attempts,
                reason = %letter.reason,
                "Message dead-lettered"
            );
            metrics::counter!("router_dead_letters_total", "handler" => letter.handler.clone())
                .increment(1);
            Ok(())
        })
    }
}
