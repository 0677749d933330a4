//! # Ticketflow Core
//!
//! Core traits and types for the Ticketflow transactional messaging core.
//!
//! This crate holds the contracts every other crate builds on: the wire
//! envelope, typed payloads and their topics, the broker, the transactional
//! outbox and the dedup ledger. It has no storage or transport dependency.
//!
//! ## Modules
//!
//! - [`message`]: Wire envelope `{id, payload, metadata}`
//! - [`payload`]: `Payload`/`Event`/`Command` traits and topic generation
//! - [`marshal`]: JSON marshaling with envelope type checks
//! - [`context`]: Correlation id and shutdown signal of an operation
//! - [`broker`]: Broker trait with ack/nack deliveries
//! - [`outbox`]: Outbox writer/reader contracts
//! - [`dedup`]: Dedup ledger for idempotent effects
//! - [`environment`]: Injected clock

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod context;
pub mod dedup;
pub mod environment;
pub mod marshal;
pub mod message;
pub mod outbox;
pub mod payload;

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use context::Context;
pub use message::{Message, Metadata};
pub use uuid::Uuid;
