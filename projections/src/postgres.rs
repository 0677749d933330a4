//! `PostgreSQL` document store for read models.
//!
//! # Schema
//!
//! One table per read model, one row per document:
//!
//! ```sql
//! CREATE TABLE read_model_ops_bookings (
//!     booking_id TEXT PRIMARY KEY,
//!     payload    JSONB NOT NULL
//! );
//! ```
//!
//! # Concurrency
//!
//! `update` runs read-merge-write inside a `REPEATABLE READ` transaction. When
//! two updates race on one document, the loser fails with a serialization
//! failure (SQLSTATE `40001`), reported as [`DocumentError::Conflict`] so the
//! caller retries against the winner's result.

use crate::document::{DocumentError, DocumentStore, Lookup};
use serde_json::Value;
use sqlx::postgres::PgPool;

/// SQLSTATE of serialization failures.
const SERIALIZATION_FAILURE: &str = "40001";

fn is_serialization_failure(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == SERIALIZATION_FAILURE)
}

fn map_sqlx(context: &'static str) -> impl Fn(sqlx::Error) -> DocumentError {
    move |e| {
        if is_serialization_failure(&e) {
            DocumentError::Conflict(format!("{context}: {e}"))
        } else {
            DocumentError::Storage(format!("{context}: {e}"))
        }
    }
}

/// PostgreSQL-backed [`DocumentStore`].
///
/// # Example
///
/// ```ignore
/// use ticketflow_projections::PostgresDocumentStore;
///
/// let store = PostgresDocumentStore::new(pool, "read_model_ops_bookings", "booking_id");
/// store.insert_if_absent("b-1", &document).await?;
/// let updated = store.update(&Lookup::member("tickets", "t-1"), |doc| Ok(doc)).await?;
/// ```
#[derive(Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    table_name: String,
    key_column: String,
}

impl PostgresDocumentStore {
    /// Create a store over `table_name`, whose primary key is `key_column` and
    /// whose document column is `payload`.
    ///
    /// Table and column names are interpolated into SQL and must be trusted
    /// identifiers.
    #[must_use]
    pub fn new(pool: PgPool, table_name: impl Into<String>, key_column: impl Into<String>) -> Self {
        Self {
            pool,
            table_name: table_name.into(),
            key_column: key_column.into(),
        }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Get the table name for this store.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn find<'e, E>(&self, executor: E, lookup: &Lookup) -> Result<Option<(String, Value)>, sqlx::Error>
    where
        E: sqlx::PgExecutor<'e>,
    {
        match lookup {
            Lookup::Key(key) => {
                let query = format!(
                    "SELECT {key_col}, payload FROM {table} WHERE {key_col} = $1",
                    key_col = self.key_column,
                    table = self.table_name,
                );
                sqlx::query_as(&query).bind(key).fetch_optional(executor).await
            },
            Lookup::Member { collection, member } => {
                let query = format!(
                    "SELECT {key_col}, payload FROM {table} WHERE payload -> $1 ? $2 LIMIT 1",
                    key_col = self.key_column,
                    table = self.table_name,
                );
                sqlx::query_as(&query)
                    .bind(collection)
                    .bind(member)
                    .fetch_optional(executor)
                    .await
            },
        }
    }
}

impl DocumentStore for PostgresDocumentStore {
    async fn insert_if_absent(&self, key: &str, document: &Value) -> Result<bool, DocumentError> {
        let query = format!(
            "INSERT INTO {table} ({key_col}, payload) VALUES ($1, $2)
             ON CONFLICT ({key_col}) DO NOTHING",
            key_col = self.key_column,
            table = self.table_name,
        );

        let result = sqlx::query(&query)
            .bind(key)
            .bind(document)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx("Failed to insert document"))?;

        let inserted = result.rows_affected() == 1;
        tracing::debug!(table = %self.table_name, key, inserted, "Document inserted if absent");
        Ok(inserted)
    }

    async fn get(&self, lookup: &Lookup) -> Result<Option<Value>, DocumentError> {
        let row = self
            .find(&self.pool, lookup)
            .await
            .map_err(map_sqlx("Failed to get document"))?;
        Ok(row.map(|(_, payload)| payload))
    }

    async fn update<F>(&self, lookup: &Lookup, merge: F) -> Result<Value, DocumentError>
    where
        F: FnOnce(Value) -> Result<Value, DocumentError> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(map_sqlx("Failed to begin transaction"))?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx("Failed to set isolation level"))?;

        let Some((key, current)) = self
            .find(&mut *tx, lookup)
            .await
            .map_err(map_sqlx("Failed to read document"))?
        else {
            return Err(DocumentError::NotFound(lookup.to_string()));
        };

        let next = merge(current)?;

        let query = format!(
            "INSERT INTO {table} ({key_col}, payload) VALUES ($1, $2)
             ON CONFLICT ({key_col}) DO UPDATE SET payload = excluded.payload",
            key_col = self.key_column,
            table = self.table_name,
        );
        sqlx::query(&query)
            .bind(&key)
            .bind(&next)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx("Failed to write document"))?;

        tx.commit().await.map_err(|e| {
            let error = map_sqlx("Failed to commit document update")(e);
            if matches!(error, DocumentError::Conflict(_)) {
                tracing::debug!(table = %self.table_name, key = %key, "Document update lost a concurrent race");
            }
            error
        })?;

        tracing::debug!(table = %self.table_name, key = %key, lookup = %lookup, "Document updated");
        Ok(next)
    }

    async fn all(&self) -> Result<Vec<Value>, DocumentError> {
        let query = format!(
            "SELECT payload FROM {table} ORDER BY {key_col}",
            key_col = self.key_column,
            table = self.table_name,
        );

        let rows: Vec<(Value,)> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx("Failed to list documents"))?;

        Ok(rows.into_iter().map(|(payload,)| payload).collect())
    }
}
