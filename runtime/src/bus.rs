//! Event and command buses.
//!
//! Both buses marshal a typed payload into a [`Message`] and either publish it
//! straight to the broker or append it to the outbox inside the caller's
//! transaction. Outbox appends record the broker topic under
//! [`DESTINATION_TOPIC_KEY`] so the forwarder knows where to relay the row.
//!
//! ```text
//! publish(ctx, event)                 ──► broker  "events.<Name>"
//! publish_in_tx(ctx, outbox, tx, ev)  ──► outbox  "events_to_forward"
//!                                           └─ metadata.destination_topic = "events.<Name>"
//! ```

use std::sync::Arc;
use thiserror::Error;
use ticketflow_core::broker::{Broker, BrokerError};
use ticketflow_core::marshal::{self, MarshalError};
use ticketflow_core::message::DESTINATION_TOPIC_KEY;
use ticketflow_core::outbox::{OutboxError, OutboxWriter};
use ticketflow_core::payload::{Command, Event, Payload};
use ticketflow_core::{Context, Message};

/// Outbox topic used when none is configured.
pub const DEFAULT_OUTBOX_TOPIC: &str = "events_to_forward";

/// Errors from bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The payload could not be marshaled.
    #[error(transparent)]
    Marshal(#[from] MarshalError),

    /// The broker rejected the message.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The outbox append failed; the caller must roll back.
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// Shared publishing logic of both buses.
#[derive(Clone)]
struct Publisher {
    broker: Arc<dyn Broker>,
    outbox_topic: String,
}

impl Publisher {
    async fn publish<P: Payload>(&self, ctx: &Context, topic: &str, payload: &P) -> Result<(), BusError> {
        let message = marshal::marshal(ctx, payload)?;
        self.broker.publish(topic, &message).await?;
        tracing::debug!(
            topic,
            message_id = %message.id,
            message_type = P::NAME,
            "Message published"
        );
        Ok(())
    }

    async fn publish_in_tx<P, W>(
        &self,
        ctx: &Context,
        outbox: &W,
        tx: &mut W::Tx,
        destination: &str,
        payload: &P,
    ) -> Result<(), BusError>
    where
        P: Payload,
        W: OutboxWriter,
    {
        let mut message: Message = marshal::marshal(ctx, payload)?;
        message.metadata.set(DESTINATION_TOPIC_KEY, destination);
        outbox.append(tx, &self.outbox_topic, &message).await?;
        metrics::counter!("outbox_messages_appended_total").increment(1);
        tracing::debug!(
            outbox_topic = %self.outbox_topic,
            destination,
            message_id = %message.id,
            message_type = P::NAME,
            "Message appended to outbox"
        );
        Ok(())
    }
}

/// Publishes events.
#[derive(Clone)]
pub struct EventBus {
    inner: Publisher,
}

impl EventBus {
    /// Create a bus publishing to `broker`, with the default outbox topic.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_outbox_topic(broker, DEFAULT_OUTBOX_TOPIC)
    }

    /// Create a bus appending transactional publications under `outbox_topic`.
    #[must_use]
    pub fn with_outbox_topic(broker: Arc<dyn Broker>, outbox_topic: impl Into<String>) -> Self {
        Self {
            inner: Publisher {
                broker,
                outbox_topic: outbox_topic.into(),
            },
        }
    }

    /// The outbox topic transactional publications are appended under.
    #[must_use]
    pub fn outbox_topic(&self) -> &str {
        &self.inner.outbox_topic
    }

    /// Publish an event directly to `events.<Name>`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Marshal`] or [`BusError::Broker`].
    pub async fn publish<E: Event>(&self, ctx: &Context, event: &E) -> Result<(), BusError> {
        self.inner.publish(ctx, &E::topic(), event).await
    }

    /// Append an event to the outbox inside `tx`; it reaches the broker once
    /// `tx` commits and the forwarder relays it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Marshal`] or [`BusError::Outbox`]; on the latter the
    /// caller must roll back `tx`.
    pub async fn publish_in_tx<E, W>(
        &self,
        ctx: &Context,
        outbox: &W,
        tx: &mut W::Tx,
        event: &E,
    ) -> Result<(), BusError>
    where
        E: Event,
        W: OutboxWriter,
    {
        self.inner
            .publish_in_tx(ctx, outbox, tx, &E::topic(), event)
            .await
    }
}

/// Sends commands.
#[derive(Clone)]
pub struct CommandBus {
    inner: Publisher,
}

impl CommandBus {
    /// Create a bus sending to `broker`, with the default outbox topic.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_outbox_topic(broker, DEFAULT_OUTBOX_TOPIC)
    }

    /// Create a bus appending transactional sends under `outbox_topic`.
    #[must_use]
    pub fn with_outbox_topic(broker: Arc<dyn Broker>, outbox_topic: impl Into<String>) -> Self {
        Self {
            inner: Publisher {
                broker,
                outbox_topic: outbox_topic.into(),
            },
        }
    }

    /// Send a command directly to `commands.<Name>`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Marshal`] or [`BusError::Broker`].
    pub async fn send<C: Command>(&self, ctx: &Context, command: &C) -> Result<(), BusError> {
        self.inner.publish(ctx, &C::topic(), command).await
    }

    /// Append a command to the outbox inside `tx`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Marshal`] or [`BusError::Outbox`].
    pub async fn send_in_tx<C, W>(
        &self,
        ctx: &Context,
        outbox: &W,
        tx: &mut W::Tx,
        command: &C,
    ) -> Result<(), BusError>
    where
        C: Command,
        W: OutboxWriter,
    {
        self.inner
            .publish_in_tx(ctx, outbox, tx, &C::topic(), command)
            .await
    }
}
