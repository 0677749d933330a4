//! Prometheus metrics for the messaging pipeline.
//!
//! Metric families:
//! - `router_*`: message handling outcomes per handler
//! - `forwarder_*`: outbox relay progress and publish failures
//! - `outbox_*`: rows appended through the buses
//! - `dlq_*`: dead-lettered messages
//!
//! # Example
//!
//! ```rust,no_run
//! use ticketflow_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Installs the global recorder and serves `/metrics` on `addr` from a
/// background task. Must be started inside a tokio runtime.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions, install the recorder and start serving.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or the recorder cannot be
    /// installed. A recorder installed earlier (e.g. by another test) is
    /// tolerated with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(async move {
                    if let Err(error) = exporter.await {
                        tracing::error!(error = ?error, "Metrics exporter stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Router
    describe_counter!(
        "router_messages_handled_total",
        "Messages acknowledged after successful handling"
    );
    describe_counter!(
        "router_messages_nacked_total",
        "Messages negatively acknowledged for redelivery"
    );
    describe_counter!(
        "router_dead_letters_total",
        "Messages handed to the dead-letter sink"
    );
    describe_counter!("router_handler_panics_total", "Handler panics recovered");
    describe_histogram!(
        "router_handle_duration_seconds",
        "Time taken to run a message through the middleware chain"
    );

    // Forwarder
    describe_counter!(
        "forwarder_messages_forwarded_total",
        "Outbox rows published to the broker"
    );
    describe_counter!(
        "forwarder_publish_errors_total",
        "Failed publishes of outbox rows"
    );
    describe_counter!(
        "forwarder_rows_skipped_total",
        "Outbox rows skipped for missing destination topic"
    );
    describe_counter!(
        "forwarder_storage_errors_total",
        "Outbox storage errors that stopped the forwarder"
    );
    describe_gauge!(
        "forwarder_cursor_offset",
        "Last forwarded outbox offset per forwarder"
    );

    // Outbox
    describe_counter!(
        "outbox_messages_appended_total",
        "Messages appended to the outbox"
    );

    // Dead-letter queue
    describe_counter!(
        "dlq_messages_stored_total",
        "Messages persisted to the dead-letter queue"
    );
    describe_counter!(
        "dlq_messages_resolved_total",
        "Dead letters marked resolved"
    );
}

/// Router metrics recorder.
pub struct RouterMetrics;

impl RouterMetrics {
    /// Record an acknowledged message.
    pub fn record_handled(handler: &str, duration: Duration) {
        counter!("router_messages_handled_total", "handler" => handler.to_string()).increment(1);
        histogram!("router_handle_duration_seconds", "handler" => handler.to_string())
            .record(duration.as_secs_f64());
    }

    /// Record a nack.
    pub fn record_nack(handler: &str) {
        counter!("router_messages_nacked_total", "handler" => handler.to_string()).increment(1);
    }
}

/// Forwarder metrics recorder.
pub struct ForwarderMetrics;

impl ForwarderMetrics {
    /// Record a forwarded row and the new cursor.
    #[allow(clippy::cast_precision_loss)] // Offsets stay far below 2^52
    pub fn record_forwarded(forwarder_id: &str, offset: i64) {
        counter!("forwarder_messages_forwarded_total", "forwarder" => forwarder_id.to_string())
            .increment(1);
        gauge!("forwarder_cursor_offset", "forwarder" => forwarder_id.to_string())
            .set(offset as f64);
    }

    /// Record a publish failure.
    pub fn record_publish_error(forwarder_id: &str) {
        counter!("forwarder_publish_errors_total", "forwarder" => forwarder_id.to_string())
            .increment(1);
    }

    /// Record a skipped row.
    pub fn record_skipped(forwarder_id: &str) {
        counter!("forwarder_rows_skipped_total", "forwarder" => forwarder_id.to_string())
            .increment(1);
    }

    /// Record the storage error that stopped the forwarder.
    pub fn record_storage_error(forwarder_id: &str) {
        counter!("forwarder_storage_errors_total", "forwarder" => forwarder_id.to_string())
            .increment(1);
    }
}
