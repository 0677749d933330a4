//! Read-model storage for Ticketflow.
//!
//! # Overview
//!
//! Read models keep one JSON document per aggregate. This crate provides:
//! - **[`DocumentStore`]**: the storage contract (insert-once, merge-update,
//!   lookup by key or by membership)
//! - **`PostgreSQL`**: [`PostgresDocumentStore`], a JSONB table per read model
//!
//! The in-memory implementation lives in `ticketflow-testing`.
//!
//! # Example
//!
//! ```ignore
//! use ticketflow_projections::{DocumentStore, Lookup, PostgresDocumentStore};
//!
//! let store = PostgresDocumentStore::new(pool, "read_model_ops_bookings", "booking_id");
//! store.insert_if_absent("b-1", &booking).await?;
//! store
//!     .update(&Lookup::member("tickets", "t-1"), |mut doc| {
//!         doc["last_update"] = json!(now);
//!         Ok(doc)
//!     })
//!     .await?;
//! ```

pub mod document;
pub mod postgres;

pub use document::{DocumentError, DocumentStore, Lookup};
pub use postgres::PostgresDocumentStore;
