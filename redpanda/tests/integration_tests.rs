//! Integration tests for [`RedpandaBroker`] with a real Kafka-compatible instance.
//!
//! These tests use testcontainers to spin up Kafka and validate:
//! - Publish/subscribe round-trip
//! - Nack redelivery with increasing attempt counts
//! - Independent consumer groups
//! - Ordering within a topic
//!
//! # Running These Tests
//!
//! These tests are marked as `#[ignore]` by default because they require
//! Docker and take 15-60 seconds per test to spin up Kafka.
//!
//! ```bash
//! cargo test -p ticketflow-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};
use ticketflow_core::broker::{Broker, Delivery, Subscription};
use ticketflow_core::message::Message;
use ticketflow_redpanda::RedpandaBroker;

fn message(body: &str) -> Message {
    let mut message = Message::new(body.as_bytes().to_vec());
    message.metadata.set("type", "TicketPrinted");
    message
}

async fn start_kafka() -> (ContainerAsync<Kafka>, RedpandaBroker) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    let brokers = format!("{host}:{port}");

    let broker = RedpandaBroker::builder()
        .brokers(&brokers)
        .build()
        .expect("Failed to create broker");

    for attempt in 1..=60 {
        if broker.publish("warmup", &message("warmup")).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return (kafka, broker);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Kafka failed to become ready");
    }
    panic!("Kafka failed to become ready");
}

async fn next_delivery(subscription: &mut Subscription) -> Delivery {
    tokio::time::timeout(Duration::from_secs(30), subscription.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Subscription ended")
        .expect("Delivery error")
}

#[tokio::test]
#[ignore]
async fn publish_and_subscribe_round_trip() {
    let (_kafka, broker) = start_kafka().await;
    let sent = message("{\"ticket_id\":\"t-1\"}");
    broker
        .publish("events.TicketPrinted", &sent)
        .await
        .expect("Failed to publish");

    let mut subscription = broker
        .subscribe("events.TicketPrinted", "svc-tickets.round-trip")
        .await
        .expect("Failed to subscribe");

    let delivery = next_delivery(&mut subscription).await;
    assert_eq!(delivery.message(), &sent);
    assert_eq!(delivery.attempt(), 1);
    delivery.ack();
}

#[tokio::test]
#[ignore]
async fn nacked_message_is_redelivered() {
    let (_kafka, broker) = start_kafka().await;
    let sent = message("{\"ticket_id\":\"t-nack\"}");
    broker
        .publish("events.TicketPrinted", &sent)
        .await
        .expect("Failed to publish");

    let mut subscription = broker
        .subscribe("events.TicketPrinted", "svc-tickets.nack")
        .await
        .expect("Failed to subscribe");

    let first = next_delivery(&mut subscription).await;
    assert_eq!(first.attempt(), 1);
    first.nack();

    let second = next_delivery(&mut subscription).await;
    assert_eq!(second.message().id, sent.id);
    assert_eq!(second.attempt(), 2);

    // Dropping counts as a nack too.
    drop(second);
    let third = next_delivery(&mut subscription).await;
    assert_eq!(third.attempt(), 3);
    third.ack();
}

#[tokio::test]
#[ignore]
async fn each_consumer_group_receives_every_message() {
    let (_kafka, broker) = start_kafka().await;
    let sent = message("{\"ticket_id\":\"t-groups\"}");
    broker
        .publish("events.TicketPrinted", &sent)
        .await
        .expect("Failed to publish");

    for group in ["svc-tickets.store_ticket", "svc-tickets.append_to_tracker"] {
        let mut subscription = broker
            .subscribe("events.TicketPrinted", group)
            .await
            .expect("Failed to subscribe");
        let delivery = next_delivery(&mut subscription).await;
        assert_eq!(delivery.message().id, sent.id, "group {group}");
        delivery.ack();
    }
}

#[tokio::test]
#[ignore]
async fn messages_arrive_in_publish_order() {
    let (_kafka, broker) = start_kafka().await;
    let sent: Vec<_> = (0..10).map(|i| message(&format!("{{\"n\":{i}}}"))).collect();
    for message in &sent {
        broker
            .publish("events.TicketPrinted", message)
            .await
            .expect("Failed to publish");
    }

    let mut subscription = broker
        .subscribe("events.TicketPrinted", "svc-tickets.ordering")
        .await
        .expect("Failed to subscribe");

    let mut received = Vec::new();
    for _ in 0..sent.len() {
        let delivery = next_delivery(&mut subscription).await;
        received.push(delivery.message().id);
        delivery.ack();
    }

    let expected: Vec<_> = sent.iter().map(|m| m.id).collect();
    assert_eq!(received, expected);
}
