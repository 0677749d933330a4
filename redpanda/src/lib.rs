//! Redpanda broker implementation for Ticketflow.
//!
//! This crate provides the production [`Broker`] backed by rdkafka, so it
//! works with Redpanda or any other Kafka-compatible cluster.
//!
//! # Wire Format
//!
//! Each Kafka record carries the JSON encoding of a [`Message`] (`id`,
//! `payload`, `metadata`). The record key is the payload type, so messages of
//! one type land on one partition and keep their publish order.
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//!
//! ```text
//!  recv(record) ──► Delivery{attempt} ──► router
//!                        │
//!              ┌─────────┴──────────┐
//!              ▼                    ▼
//!            ack                 nack / drop
//!   commit(offset + 1)      seek(partition, offset)
//!                           (same record again, attempt + 1)
//! ```
//!
//! - One delivery per subscription is in flight at a time; the next record is
//!   read only after the previous one was settled.
//! - Consumer groups: subscriptions sharing a group split the partitions of a
//!   topic between them; every group receives every message.
//! - A record that does not decode is reported as
//!   [`BrokerError::Malformed`] and committed, so it cannot block the
//!   partition.
//! - Attempt counts live in the subscription. A restart or a rebalance starts
//!   counting again at 1.
//!
//! # Example
//!
//! ```no_run
//! use ticketflow_redpanda::RedpandaBroker;
//! use ticketflow_core::broker::Broker;
//! use ticketflow_core::Message;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::new("localhost:9092")?;
//!
//! broker.publish("events.TicketPrinted", &Message::new(b"{}".to_vec())).await?;
//!
//! let mut subscription = broker
//!     .subscribe("events.TicketPrinted", "svc-tickets.store_ticket")
//!     .await?;
//! while let Some(delivery) = subscription.next().await {
//!     let delivery = delivery?;
//!     println!("Received: {}", delivery.message());
//!     delivery.ack();
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use ticketflow_core::broker::{Acknowledgement, Broker, BrokerError, Delivery, Subscription};
use ticketflow_core::message::Message;
use tokio::sync::mpsc;

/// Redpanda-backed [`Broker`].
///
/// # Configuration
///
/// - **Broker addresses**: Bootstrap servers (required)
/// - **Producer settings**: Acks, compression, timeout
/// - **Offset reset**: Where new consumer groups start reading
///   (default: `"earliest"`, so a group sees messages published before its
///   first subscription)
///
/// # Example
///
/// ```no_run
/// use ticketflow_redpanda::RedpandaBroker;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaBroker::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")  // Wait for all replicas
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBroker {
    /// Kafka producer for publishing messages
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout
    timeout: Duration,
    /// Auto offset reset policy
    auto_offset_reset: String,
    /// Consumer session timeout
    session_timeout: Duration,
}

impl RedpandaBroker {
    /// Create a new Redpanda broker with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be
    /// created (invalid broker addresses or configuration).
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the broker.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    fn consumer(&self, topic: &str, group: &str) -> Result<StreamConsumer, BrokerError> {
        let subscription_failed = |reason: String| BrokerError::SubscriptionFailed {
            topic: topic.to_string(),
            group: group.to_string(),
            reason,
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| subscription_failed(format!("Failed to create consumer: {e}")))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| subscription_failed(format!("Failed to subscribe to topic: {e}")))?;

        Ok(consumer)
    }
}

/// Builder for configuring a [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    auto_offset_reset: Option<String>,
    session_timeout: Option<Duration>,
}

impl RedpandaBrokerBuilder {
    /// Set the broker addresses (comma-separated, e.g. `"localhost:9092"`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: `"0"`, `"1"` or `"all"`.
    ///
    /// Default: `"all"`
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: `"none"`, `"gzip"`, `"snappy"`, `"lz4"`, `"zstd"`.
    ///
    /// Default: `"none"`
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set where new consumer groups start reading: `"earliest"` or `"latest"`.
    ///
    /// Default: `"earliest"`
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Set the consumer session timeout.
    ///
    /// Default: 6 seconds
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Build the [`RedpandaBroker`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                BrokerError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| "earliest".to_string());

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaBroker created successfully"
        );

        Ok(RedpandaBroker {
            producer,
            brokers,
            timeout,
            auto_offset_reset,
            session_timeout: self.session_timeout.unwrap_or(Duration::from_secs(6)),
        })
    }
}

impl Broker for RedpandaBroker {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let payload = serde_json::to_vec(message).map_err(|e| BrokerError::PublishFailed {
                topic: topic.to_string(),
                reason: format!("Failed to encode message: {e}"),
            })?;
            let key = message.payload_type().unwrap_or_default();

            let record = FutureRecord::to(topic).payload(&payload).key(key);

            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic,
                        partition,
                        offset,
                        message_id = %message.id,
                        "Message published"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(topic, error = %kafka_error, "Failed to publish message");
                    Err(BrokerError::PublishFailed {
                        topic: topic.to_string(),
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        consumer_group: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let consumer = self.consumer(topic, consumer_group)?;

            tracing::info!(
                topic,
                consumer_group,
                auto_offset_reset = %self.auto_offset_reset,
                "Subscribed to topic"
            );

            // Capacity 1: the consumer task waits for each delivery to be
            // settled before reading the next record.
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(consume(consumer, tx));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as Subscription)
        })
    }
}

/// Position and content of a received record, detached from the consumer.
struct Record {
    topic: String,
    partition: i32,
    offset: i64,
    payload: Option<Vec<u8>>,
}

impl Record {
    fn from_kafka(message: &impl rdkafka::message::Message) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
        }
    }

    fn decode(&self) -> Result<Message, BrokerError> {
        let payload = self.payload.as_deref().ok_or_else(|| {
            BrokerError::Malformed(format!(
                "Record {}/{}@{} has no payload",
                self.topic, self.partition, self.offset
            ))
        })?;

        serde_json::from_slice(payload).map_err(|e| {
            BrokerError::Malformed(format!(
                "Record {}/{}@{} is not a message: {e}",
                self.topic, self.partition, self.offset
            ))
        })
    }
}

fn commit(consumer: &StreamConsumer, record: &Record) {
    let mut offsets = TopicPartitionList::new();
    let committed = offsets
        .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
        .and_then(|()| consumer.commit(&offsets, CommitMode::Async));

    if let Err(e) = committed {
        tracing::warn!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    }
}

/// Consumer task: owns the consumer, hands out one delivery at a time and
/// settles it.
///
/// Exits when the subscription is dropped, or when a nacked record cannot be
/// rewound. In the second case the subscription ends and the router
/// resubscribes from the last committed offset.
async fn consume(consumer: StreamConsumer, tx: mpsc::Sender<Result<Delivery, BrokerError>>) {
    let mut attempts: HashMap<(i32, i64), u32> = HashMap::new();

    loop {
        let received = tokio::select! {
            () = tx.closed() => break,
            received = consumer.recv() => received.map(|message| Record::from_kafka(&message)),
        };

        let record = match received {
            Ok(record) => record,
            Err(e) => {
                let error = BrokerError::Transport(format!("Failed to receive message: {e}"));
                if tx.send(Err(error)).await.is_err() {
                    break;
                }
                continue;
            },
        };

        let message = match record.decode() {
            Ok(message) => message,
            Err(error) => {
                tracing::error!(error = %error, "Skipping malformed record");
                commit(&consumer, &record);
                if tx.send(Err(error)).await.is_err() {
                    break;
                }
                continue;
            },
        };

        let position = (record.partition, record.offset);
        let attempt = attempts.entry(position).or_insert(0);
        *attempt += 1;

        let (delivery, reply) = Delivery::new(message, *attempt);
        if tx.send(Ok(delivery)).await.is_err() {
            tracing::debug!("Subscription dropped, exiting consumer task");
            break;
        }

        if let Ok(Acknowledgement::Ack) = reply.await {
            attempts.remove(&position);
            commit(&consumer, &record);
        } else {
            tracing::debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Message nacked, rewinding"
            );
            let rewound = consumer.seek(
                &record.topic,
                record.partition,
                Offset::Offset(record.offset),
                Duration::from_secs(5),
            );
            if let Err(e) = rewound {
                tracing::warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    error = %e,
                    "Failed to rewind after nack, closing subscription"
                );
                break;
            }
        }
    }

    tracing::debug!("Consumer task exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redpanda_broker_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBroker>();
        assert_sync::<RedpandaBroker>();
    }

    #[test]
    fn builder_requires_brokers() {
        assert!(matches!(
            RedpandaBroker::builder().build(),
            Err(BrokerError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn record_decodes_json_message() {
        let mut message = Message::new(b"{\"ticket_id\":\"t-1\"}".to_vec());
        message.metadata.set("type", "TicketPrinted");
        let record = Record {
            topic: "events.TicketPrinted".to_string(),
            partition: 0,
            offset: 12,
            payload: Some(serde_json::to_vec(&message).unwrap_or_default()),
        };

        assert_eq!(record.decode(), Ok(message));
    }

    #[test]
    fn record_without_payload_is_malformed() {
        let record = Record {
            topic: "events.TicketPrinted".to_string(),
            partition: 0,
            offset: 3,
            payload: None,
        };

        assert!(matches!(record.decode(), Err(BrokerError::Malformed(_))));
    }
}
