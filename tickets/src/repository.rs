//! Relational storage of tickets and shows.
//!
//! Handlers and the booking allocator go through the [`TicketsRepository`] and
//! [`ShowsRepository`] traits. `PostgreSQL` implementations back production;
//! the in-memory ones back unit tests and local runs.
//!
//! Both writes are idempotent: adding a stored ticket or show is a no-op, and
//! removing a missing ticket succeeds.

use crate::entities::{Money, Show, Ticket};
use crate::error::TicketingError;
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Stored tickets.
#[async_trait]
pub trait TicketsRepository: Send + Sync {
    /// Store a ticket unless it exists.
    async fn add_ticket(&self, ticket: &Ticket) -> Result<(), TicketingError>;

    /// Delete a ticket if it exists.
    async fn remove_ticket(&self, ticket_id: &str) -> Result<(), TicketingError>;

    /// Every stored ticket, ordered by id.
    async fn all_tickets(&self) -> Result<Vec<Ticket>, TicketingError>;
}

/// Stored shows.
#[async_trait]
pub trait ShowsRepository: Send + Sync {
    /// Store a show unless it exists.
    async fn add_show(&self, show: &Show) -> Result<(), TicketingError>;

    /// Look up a show.
    async fn show(&self, show_id: Uuid) -> Result<Option<Show>, TicketingError>;
}

/// Run the ticket service migrations (tickets, shows, bookings, ops read model).
///
/// Migrations of the infrastructure crates on the same database are tolerated.
///
/// # Errors
///
/// Returns [`sqlx::migrate::MigrateError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}

fn parse_ticket_id(ticket_id: &str) -> Result<Uuid, TicketingError> {
    Uuid::parse_str(ticket_id)
        .map_err(|e| TicketingError::Validation(format!("invalid ticket id {ticket_id}: {e}")))
}

/// Tickets in the `tickets` table.
#[derive(Clone)]
pub struct PostgresTicketsRepository {
    pool: PgPool,
}

impl PostgresTicketsRepository {
    /// Create a repository over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketsRepository for PostgresTicketsRepository {
    async fn add_ticket(&self, ticket: &Ticket) -> Result<(), TicketingError> {
        let ticket_id = parse_ticket_id(&ticket.ticket_id)?;
        sqlx::query(
            "INSERT INTO tickets (ticket_id, price_amount, price_currency, customer_email) \
             VALUES ($1, $2::numeric, $3, $4) \
             ON CONFLICT (ticket_id) DO NOTHING",
        )
        .bind(ticket_id)
        .bind(ticket.price.amount())
        .bind(ticket.price.currency())
        .bind(&ticket.customer_email)
        .execute(&self.pool)
        .await
        .map_err(|e| TicketingError::storage("Failed to save ticket", e))?;
        Ok(())
    }

    async fn remove_ticket(&self, ticket_id: &str) -> Result<(), TicketingError> {
        let ticket_id = parse_ticket_id(ticket_id)?;
        sqlx::query("DELETE FROM tickets WHERE ticket_id = $1")
            .bind(ticket_id)
            .execute(&self.pool)
            .await
            .map_err(|e| TicketingError::storage("Failed to remove ticket", e))?;
        Ok(())
    }

    async fn all_tickets(&self) -> Result<Vec<Ticket>, TicketingError> {
        let rows: Vec<(Uuid, String, String, String)> = sqlx::query_as(
            "SELECT ticket_id, price_amount::text, price_currency, customer_email \
             FROM tickets ORDER BY ticket_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TicketingError::storage("Failed to load tickets", e))?;

        Ok(rows
            .into_iter()
            .map(|(ticket_id, amount, currency, customer_email)| Ticket {
                ticket_id: ticket_id.to_string(),
                price: Money::new(amount, currency.trim()),
                customer_email,
            })
            .collect())
    }
}

/// Shows in the `shows` table.
#[derive(Clone)]
pub struct PostgresShowsRepository {
    pool: PgPool,
}

impl PostgresShowsRepository {
    /// Create a repository over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ShowsRepository for PostgresShowsRepository {
    async fn add_show(&self, show: &Show) -> Result<(), TicketingError> {
        sqlx::query(
            "INSERT INTO shows (show_id, dead_nation_id, number_of_tickets, start_time, title, venue) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (show_id) DO NOTHING",
        )
        .bind(show.show_id)
        .bind(show.dead_nation_id)
        .bind(show.number_of_tickets)
        .bind(show.start_time)
        .bind(&show.title)
        .bind(&show.venue)
        .execute(&self.pool)
        .await
        .map_err(|e| TicketingError::storage("Failed to save show", e))?;
        Ok(())
    }

    async fn show(&self, show_id: Uuid) -> Result<Option<Show>, TicketingError> {
        let row: Option<(Uuid, Uuid, i32, chrono::DateTime<chrono::Utc>, String, String)> = sqlx::query_as(
            "SELECT show_id, dead_nation_id, number_of_tickets, start_time, title, venue \
             FROM shows WHERE show_id = $1",
        )
        .bind(show_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TicketingError::storage("Failed to load show", e))?;

        Ok(row.map(
            |(show_id, dead_nation_id, number_of_tickets, start_time, title, venue)| Show {
                show_id,
                dead_nation_id,
                number_of_tickets,
                start_time,
                title,
                venue,
            },
        ))
    }
}

#[derive(Debug, Default)]
struct Tables {
    tickets: BTreeMap<String, Ticket>,
    shows: BTreeMap<Uuid, Show>,
}

/// In-memory tickets and shows.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl TicketsRepository for InMemoryRepository {
    async fn add_ticket(&self, ticket: &Ticket) -> Result<(), TicketingError> {
        self.lock()
            .tickets
            .entry(ticket.ticket_id.clone())
            .or_insert_with(|| ticket.clone());
        Ok(())
    }

    async fn remove_ticket(&self, ticket_id: &str) -> Result<(), TicketingError> {
        self.lock().tickets.remove(ticket_id);
        Ok(())
    }

    async fn all_tickets(&self) -> Result<Vec<Ticket>, TicketingError> {
        Ok(self.lock().tickets.values().cloned().collect())
    }
}

#[async_trait]
impl ShowsRepository for InMemoryRepository {
    async fn add_show(&self, show: &Show) -> Result<(), TicketingError> {
        self.lock()
            .shows
            .entry(show.show_id)
            .or_insert_with(|| show.clone());
        Ok(())
    }

    async fn show(&self, show_id: Uuid) -> Result<Option<Show>, TicketingError> {
        Ok(self.lock().shows.get(&show_id).cloned())
    }
}
