//! Per-operation context passed to publishers and handlers.
//!
//! A [`Context`] carries the correlation id of the logical operation, the name
//! of the handler currently processing (if any) and the shutdown signal of the
//! component that owns the work. It is cheap to clone.

use tokio::sync::watch;
use uuid::Uuid;

/// Context of a single logical operation.
#[derive(Debug, Clone, Default)]
pub struct Context {
    correlation_id: Option<String>,
    handler: Option<String>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Context {
    /// An empty context for callers outside the router (HTTP layer, jobs).
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach the name of the handler processing the current message.
    #[must_use]
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Attach a shutdown signal. The context counts as cancelled once the
    /// signal carries `true` or its sender is dropped.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// The correlation id, if one was attached.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The correlation id, or a freshly minted one.
    #[must_use]
    pub fn correlation_id_or_new(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string())
    }

    /// Name of the handler processing the current message, if any.
    #[must_use]
    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|rx| *rx.borrow() || rx.has_changed().is_err())
    }

    /// Resolve once shutdown is requested. Never resolves for a context
    /// without a shutdown signal.
    pub async fn cancelled(&self) {
        match &self.shutdown {
            Some(rx) => {
                let mut rx = rx.clone();
                loop {
                    let stopping = *rx.borrow_and_update();
                    // A dropped sender also ends the wait.
                    if stopping || rx.changed().await.is_err() {
                        return;
                    }
                }
            }
            None => futures::future::pending::<()>().await,
        }
    }
}
