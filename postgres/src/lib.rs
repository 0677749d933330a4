//! `PostgreSQL` storage for the Ticketflow messaging core.
//!
//! This crate provides the production implementations of the storage seams
//! defined in `ticketflow-core`, all on one sqlx connection pool:
//!
//! - [`PostgresOutbox`]: transactional outbox with commit-ordered offsets and
//!   per-forwarder cursors
//! - [`PostgresDedupLedger`]: ledger of applied effect keys
//! - [`DeadLetterQueue`]: persistent dead-letter sink with operator workflows
//!
//! # Example
//!
//! ```ignore
//! use ticketflow_postgres::{migrate, PostgresOutbox};
//!
//! let pool = sqlx::PgPool::connect("postgres://localhost/tickets").await?;
//! migrate(&pool).await?;
//! let outbox = PostgresOutbox::new(pool.clone());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;
pub mod dedup;
pub mod outbox;

pub use dead_letter_queue::{DLQError, DLQStatus, DeadLetterQueue, FailedMessage};
pub use dedup::PostgresDedupLedger;
pub use outbox::PostgresOutbox;

/// Run this crate's migrations (outbox, cursors, dedup keys, DLQ).
///
/// Migrations applied by other crates on the same database are tolerated.
///
/// # Errors
///
/// Returns [`sqlx::migrate::MigrateError`] if a migration fails.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}
