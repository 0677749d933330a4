//! Broker abstraction for publishing and consuming messages.
//!
//! The [`Broker`] trait is the only way the core talks to the message
//! transport. Publishing is fire-and-forget from the caller's perspective;
//! consuming yields [`Delivery`] values that must be acknowledged.
//!
//! # Delivery Semantics
//!
//! ```text
//!   broker ──► Delivery ──► handler
//!                 │
//!        ┌────────┴────────┐
//!        ▼                 ▼
//!      ack()             nack() / drop
//!   (removed from     (redelivered to the
//!    pending set)      same consumer group)
//! ```
//!
//! - **At-least-once**: a message stays pending until acked. A nacked or
//!   dropped delivery is redelivered with an incremented attempt count.
//! - **Consumer groups**: subscribers sharing a group compete for messages;
//!   different groups each receive every message.
//! - **Ordering**: per topic and group, deliveries are handed out one at a time
//!   in publish order; a nack redelivers before later messages are seen.
//!
//! # Implementations
//!
//! - `InMemoryBroker` (ticketflow-testing) - for tests
//! - `RedpandaBroker` (ticketflow-redpanda) - Kafka-compatible production broker

use crate::message::Message;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}' (group '{group}'): {reason}")]
    SubscriptionFailed {
        /// The topic
        topic: String,
        /// The consumer group
        group: String,
        /// The reason for failure
        reason: String,
    },

    /// A received record could not be decoded into a [`Message`]
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Transport-level error while consuming
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Outcome reported back to the broker for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Processing succeeded; remove the message from the pending set.
    Ack,
    /// Processing failed; redeliver the message.
    Nack,
}

/// A message handed to a consumer, awaiting acknowledgement.
///
/// Dropping a delivery without calling [`Delivery::ack`] counts as a nack.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    attempt: u32,
    reply: oneshot::Sender<Acknowledgement>,
}

impl Delivery {
    /// Create a delivery together with the receiver the broker listens on.
    ///
    /// `attempt` starts at 1 for the first delivery of a message.
    #[must_use]
    pub fn new(message: Message, attempt: u32) -> (Self, oneshot::Receiver<Acknowledgement>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                message,
                attempt,
                reply,
            },
            rx,
        )
    }

    /// The delivered message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// How many times this message has been delivered to the group, this one
    /// included.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Acknowledge successful processing.
    pub fn ack(self) {
        let _ = self.reply.send(Acknowledgement::Ack);
    }

    /// Reject the message so the broker redelivers it.
    pub fn nack(self) {
        let _ = self.reply.send(Acknowledgement::Nack);
    }
}

/// Stream of deliveries for one subscription.
pub type Subscription = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Message broker used by the forwarder, the buses and the router.
///
/// Implementations must be safe to share across tasks.
pub trait Broker: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] if the broker did not accept the
    /// message.
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>>;

    /// Subscribe to a topic as a member of a consumer group.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] if the subscription cannot be
    /// established.
    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        consumer_group: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, BrokerError>> + Send + 'a>>;
}
