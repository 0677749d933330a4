//! # Ticketflow Runtime
//!
//! Runtime components of the Ticketflow messaging core.
//!
//! ## Core Components
//!
//! - **Buses**: [`bus::EventBus`] and [`bus::CommandBus`] publish typed payloads
//!   directly or through the transactional outbox
//! - **Router**: [`router::Router`] consumes subscriptions and runs every
//!   delivery through the middleware chain
//! - **Forwarder**: [`forwarder::Forwarder`] relays committed outbox rows to
//!   the broker in offset order
//! - **Retry**: [`retry::RetryPolicy`], shared by the retry middleware, the
//!   forwarder backoff and serialization-failure retries
//! - **Metrics**: Prometheus exporter and recorders
//!
//! ## Example
//!
//! ```ignore
//! use ticketflow_runtime::{EventBus, Forwarder, ForwarderConfig, Router, RouterConfig};
//!
//! let events = EventBus::new(Arc::clone(&broker));
//! let forwarder = Forwarder::new(outbox, Arc::clone(&broker), ForwarderConfig::default()).spawn();
//!
//! let mut router = Router::new(broker, RouterConfig::default());
//! router.add_event_handler::<TicketBookingConfirmed, _>("issue-receipt", handler)?;
//! router.run().await?;
//! ```

/// Event and command buses
pub mod bus;

/// Dead-letter extension point
pub mod dead_letter;

/// Outbox forwarder
pub mod forwarder;

/// Untyped and typed message handlers
pub mod handler;

/// Prometheus metrics for observability
pub mod metrics;

/// Router middleware chain
pub mod middleware;

/// Retry logic with exponential backoff
pub mod retry;

/// Message router
pub mod router;

pub use bus::{BusError, CommandBus, EventBus};
pub use dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink, LoggingDeadLetterSink};
pub use forwarder::{Forwarder, ForwarderConfig, ForwarderError, ForwarderHandle};
pub use handler::{CommandHandler, EventHandler, HandlerError, MessageHandler};
pub use retry::RetryPolicy;
pub use router::{HandlerState, Router, RouterConfig, RouterError, RunningSignal};
