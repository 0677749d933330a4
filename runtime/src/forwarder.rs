//! Outbox forwarder: relays committed outbox rows to the broker.
//!
//! # Algorithm
//!
//! ```text
//! loop {
//!     cursor = reader.cursor(forwarder_id)
//!     rows   = reader.poll(outbox_topic, cursor, batch_size)
//!     for row in rows (ascending offset) {
//!         broker.publish(row.destination, row.message)   // failure: back off, re-poll
//!         reader.advance_cursor(forwarder_id, row.offset) // failure: fatal
//!     }
//!     if rows.is_empty() { sleep(poll_interval) }
//! }
//! ```
//!
//! The cursor only moves after the broker accepted a row, so a crash between
//! publish and cursor update republishes that row on restart (at-least-once).
//! Rows are never published out of offset order.
//!
//! Shutdown is observed between rows only: an in-flight publish and its cursor
//! update always complete before the task exits.

use crate::metrics::ForwarderMetrics;
use crate::retry::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use ticketflow_core::broker::Broker;
use ticketflow_core::outbox::{OutboxError, OutboxReader, OutboxRow};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Fatal forwarder errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ForwarderError {
    /// The outbox could not be read or the cursor could not be stored.
    #[error(transparent)]
    Storage(#[from] OutboxError),

    /// The forwarder task panicked or was aborted.
    #[error("Forwarder task failed: {0}")]
    Join(String),
}

/// Forwarder settings.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Identity of the cursor row.
    pub forwarder_id: String,
    /// Outbox topic to relay.
    pub outbox_topic: String,
    /// Maximum rows per poll.
    pub batch_size: usize,
    /// Pause between polls that returned nothing.
    pub poll_interval: Duration,
    /// Backoff between failed publishes; `max_retries` is ignored, broker
    /// unavailability is retried until shutdown.
    pub backoff: RetryPolicy,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            forwarder_id: "forwarder".to_string(),
            outbox_topic: crate::bus::DEFAULT_OUTBOX_TOPIC.to_string(),
            batch_size: 100,
            poll_interval: Duration::from_millis(10),
            backoff: RetryPolicy::default(),
        }
    }
}

/// Relays outbox rows to the broker.
pub struct Forwarder {
    reader: Arc<dyn OutboxReader>,
    broker: Arc<dyn Broker>,
    config: ForwarderConfig,
}

/// How a batch ended.
enum BatchOutcome {
    /// Every row was relayed (possibly none).
    Drained(usize),
    /// A publish failed; the failed row is the next to retry.
    PublishFailed,
    /// Shutdown was requested between rows.
    Stopped,
}

impl Forwarder {
    /// Create a forwarder.
    #[must_use]
    pub fn new(reader: Arc<dyn OutboxReader>, broker: Arc<dyn Broker>, config: ForwarderConfig) -> Self {
        Self {
            reader,
            broker,
            config,
        }
    }

    /// Run the forwarder on its own task.
    #[must_use]
    pub fn spawn(self) -> ForwarderHandle {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(async move { self.run(rx).await });
        ForwarderHandle {
            shutdown,
            task: Some(task),
        }
    }

    /// Run until `shutdown` carries `true` (or its sender is dropped).
    ///
    /// # Errors
    ///
    /// Returns [`ForwarderError::Storage`] when the outbox cannot be read or
    /// the cursor cannot be advanced.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ForwarderError> {
        tracing::info!(
            forwarder_id = %self.config.forwarder_id,
            outbox_topic = %self.config.outbox_topic,
            "Forwarder started"
        );
        let mut failures = 0usize;

        loop {
            if is_stopping(&shutdown) {
                break;
            }

            let outcome = match self.forward_batch(&shutdown).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::error!(
                        forwarder_id = %self.config.forwarder_id,
                        error = %error,
                        "Forwarder stopped on storage error"
                    );
                    ForwarderMetrics::record_storage_error(&self.config.forwarder_id);
                    return Err(error);
                },
            };

            let pause = match outcome {
                BatchOutcome::Stopped => break,
                BatchOutcome::Drained(0) => {
                    failures = 0;
                    self.config.poll_interval
                },
                BatchOutcome::Drained(_) => {
                    failures = 0;
                    continue;
                },
                BatchOutcome::PublishFailed => {
                    let delay = self.config.backoff.delay_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    delay
                },
            };

            tokio::select! {
                () = tokio::time::sleep(pause) => {},
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                },
            }
        }

        tracing::info!(forwarder_id = %self.config.forwarder_id, "Forwarder stopped");
        Ok(())
    }

    async fn forward_batch(&self, shutdown: &watch::Receiver<bool>) -> Result<BatchOutcome, ForwarderError> {
        let id = self.config.forwarder_id.as_str();
        let cursor = self.reader.cursor(id).await?;
        let rows = self
            .reader
            .poll(&self.config.outbox_topic, cursor, self.config.batch_size)
            .await?;

        let count = rows.len();
        for row in rows {
            if is_stopping(shutdown) {
                return Ok(BatchOutcome::Stopped);
            }
            if !self.forward_row(row).await? {
                return Ok(BatchOutcome::PublishFailed);
            }
        }
        Ok(BatchOutcome::Drained(count))
    }

    /// Publish one row and advance the cursor past it. Returns `false` when
    /// the broker rejected the row.
    async fn forward_row(&self, row: OutboxRow) -> Result<bool, ForwarderError> {
        let id = self.config.forwarder_id.as_str();
        let offset = row.offset;

        let Some(destination) = row.destination().map(ToString::to_string) else {
            tracing::error!(
                forwarder_id = %id,
                offset,
                message_id = %row.message.id,
                "Outbox row has no destination topic, skipping"
            );
            ForwarderMetrics::record_skipped(id);
            self.reader.advance_cursor(id, offset).await?;
            return Ok(true);
        };

        let message = row.into_published();
        if let Err(e) = self.broker.publish(&destination, &message).await {
            tracing::warn!(
                forwarder_id = %id,
                offset,
                destination = %destination,
                error = %e,
                "Failed to forward outbox row, backing off"
            );
            ForwarderMetrics::record_publish_error(id);
            return Ok(false);
        }

        self.reader.advance_cursor(id, offset).await?;
        ForwarderMetrics::record_forwarded(id, offset);
        tracing::debug!(
            forwarder_id = %id,
            offset,
            destination = %destination,
            message_id = %message.id,
            "Outbox row forwarded"
        );
        Ok(true)
    }
}

fn is_stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Handle to a spawned [`Forwarder`].
pub struct ForwarderHandle {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Result<(), ForwarderError>>>,
}

impl ForwarderHandle {
    /// Whether the task has ended (cleanly or not).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Request shutdown and wait for the in-flight row to finish.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the task, if any.
    pub async fn stop(mut self) -> Result<(), ForwarderError> {
        self.shutdown.send_replace(true);
        self.join().await
    }

    /// Wait for the task to end without requesting shutdown. Used by
    /// supervisors to surface fatal storage errors.
    ///
    /// Cancel-safe: dropping the future keeps the task attached, so a later
    /// [`stop`](Self::stop) still waits for it.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the task, if any.
    pub async fn join(&mut self) -> Result<(), ForwarderError> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let result = task.await;
        self.task = None;
        result.map_err(|e| ForwarderError::Join(e.to_string()))?
    }
}
