//! # Ticketflow Testing
//!
//! Testing utilities for the Ticketflow messaging core.
//!
//! This crate provides:
//! - A deterministic [`Clock`] implementation
//! - In-memory implementations of every storage and transport seam:
//!   [`InMemoryBroker`], [`InMemoryOutbox`], [`InMemoryDedupLedger`] and
//!   [`InMemoryDocumentStore`], each with fault injection for failure tests
//! - A tracing subscriber helper for tests
//!
//! ## Example
//!
//! ```ignore
//! use ticketflow_testing::{InMemoryBroker, InMemoryOutbox, test_clock};
//!
//! #[tokio::test]
//! async fn forwards_committed_rows() {
//!     let broker = Arc::new(InMemoryBroker::new());
//!     let outbox = Arc::new(InMemoryOutbox::new());
//!     let forwarder = Forwarder::new(outbox.clone(), broker.clone(), ForwarderConfig::default()).spawn();
//!     // ...
//! }
//! ```

use chrono::{DateTime, Utc};
use ticketflow_core::environment::Clock;

pub mod broker;
pub mod dedup;
pub mod documents;
pub mod outbox;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use ticketflow_testing::mocks::FixedClock;
    /// use ticketflow_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a `tracing` subscriber writing to the test output.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use broker::InMemoryBroker;
pub use dedup::InMemoryDedupLedger;
pub use documents::InMemoryDocumentStore;
pub use mocks::{FixedClock, test_clock};
pub use outbox::{InMemoryOutbox, InMemoryTx};
