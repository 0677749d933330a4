//! In-memory broker for fast, deterministic tests.
//!
//! Every topic is an append-only log. Each consumer group keeps its own
//! position in the log, starting at the beginning; subscribers sharing a group
//! compete for messages, and a group has at most one delivery in flight. A
//! nacked (or dropped) delivery is redelivered to the group before any later
//! message, with its attempt count incremented.

#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use futures::Stream;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use ticketflow_core::Message;
use ticketflow_core::broker::{Acknowledgement, Broker, BrokerError, Delivery, Subscription};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Group {
    next: usize,
    redeliver: Option<usize>,
    in_flight: bool,
    attempts: HashMap<usize, u32>,
    acked: usize,
}

#[derive(Debug, Default)]
struct Topic {
    log: Vec<Message>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Topic>,
    publish_failures: usize,
    publish_delay: Duration,
    publish_attempts: usize,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Hand the group its next message, if none is in flight.
    fn claim(&self, topic: &str, group: &str) -> Option<(usize, Message, u32)> {
        let mut state = self.lock();
        let topic = state.topics.entry(topic.to_string()).or_default();
        let log = &topic.log;
        let group = topic.groups.entry(group.to_string()).or_default();

        if group.in_flight {
            return None;
        }
        let index = match group.redeliver.take() {
            Some(index) => index,
            None if group.next < log.len() => {
                group.next += 1;
                group.next - 1
            },
            None => return None,
        };

        group.in_flight = true;
        let attempt = group.attempts.entry(index).or_insert(0);
        *attempt += 1;
        Some((index, log[index].clone(), *attempt))
    }

    fn settle(&self, topic: &str, group: &str, index: usize, ack: Option<Acknowledgement>) {
        {
            let mut state = self.lock();
            if let Some(group) = state
                .topics
                .get_mut(topic)
                .and_then(|t| t.groups.get_mut(group))
            {
                group.in_flight = false;
                if ack == Some(Acknowledgement::Ack) {
                    group.attempts.remove(&index);
                    group.acked += 1;
                } else {
                    group.redeliver = Some(index);
                }
            }
        }
        self.notify.notify_waiters();
    }
}

/// In-memory [`Broker`].
///
/// # Example
///
/// ```
/// use ticketflow_testing::InMemoryBroker;
/// use ticketflow_core::{Message, broker::Broker};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.publish("events.TicketPrinted", &Message::new(b"{}".to_vec())).await?;
/// assert_eq!(broker.published("events.TicketPrinted").len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published to `topic`, in publish order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<Message> {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map(|t| t.log.clone())
            .unwrap_or_default()
    }

    /// Names of topics that received at least one message.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .shared
            .lock()
            .topics
            .iter()
            .filter(|(_, t)| !t.log.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Number of messages `group` acknowledged on `topic`.
    #[must_use]
    pub fn acked(&self, topic: &str, group: &str) -> usize {
        self.shared
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map_or(0, |g| g.acked)
    }

    /// Make the next `count` publishes fail.
    pub fn fail_publishes(&self, count: usize) {
        self.shared.lock().publish_failures = count;
    }

    /// Make every publish take `delay` before the message lands.
    pub fn delay_publishes(&self, delay: Duration) {
        self.shared.lock().publish_delay = delay;
    }

    /// Number of publishes started, including failed and in-flight ones.
    #[must_use]
    pub fn publish_attempts(&self) -> usize {
        self.shared.lock().publish_attempts
    }
}

impl Broker for InMemoryBroker {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), BrokerError>> + Send + 'a>> {
        Box::pin(async move {
            let delay = {
                let mut state = self.shared.lock();
                state.publish_attempts += 1;
                if state.publish_failures > 0 {
                    state.publish_failures -= 1;
                    return Err(BrokerError::PublishFailed {
                        topic: topic.to_string(),
                        reason: "injected failure".to_string(),
                    });
                }
                state.publish_delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            {
                self.shared
                    .lock()
                    .topics
                    .entry(topic.to_string())
                    .or_default()
                    .log
                    .push(message.clone());
            }
            self.shared.notify.notify_waiters();
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        topic: &'a str,
        consumer_group: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Subscription, BrokerError>> + Send + 'a>> {
        let shared = Arc::clone(&self.shared);
        let topic = topic.to_string();
        let group = consumer_group.to_string();
        Box::pin(async move {
            let stream: Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>> =
                Box::pin(async_stream::stream! {
                    loop {
                        let notified = shared.notify.notified();
                        match shared.claim(&topic, &group) {
                            Some((index, message, attempt)) => {
                                let (delivery, reply) = Delivery::new(message, attempt);
                                let settle = Arc::clone(&shared);
                                let (topic, group) = (topic.clone(), group.clone());
                                tokio::spawn(async move {
                                    let ack = reply.await.ok();
                                    settle.settle(&topic, &group, index, ack);
                                });
                                yield Ok(delivery);
                            },
                            None => notified.await,
                        }
                    }
                });
            Ok(stream)
        })
    }
}
