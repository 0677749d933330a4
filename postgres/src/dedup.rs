//! `PostgreSQL` dedup ledger.
//!
//! The key insert and the effect share one transaction:
//!
//! ```text
//! BEGIN
//!   INSERT INTO dedup_keys (key) VALUES ($1) ON CONFLICT DO NOTHING
//!   ├─ 0 rows ─► ROLLBACK ─► AlreadyApplied
//!   └─ 1 row  ─► effect() ─┬─ Ok  ─► COMMIT   ─► Applied
//!                          └─ Err ─► ROLLBACK ─► Err
//! ```
//!
//! A concurrent delivery of the same key blocks on the uncommitted primary key
//! until the first transaction finishes, then sees either the committed key
//! (`AlreadyApplied`) or a free slot (the first effect failed).

use sqlx::postgres::PgPool;
use std::future::Future;
use ticketflow_core::dedup::{Dedup, DedupLedger, LedgerError};

/// Ledger of applied keys in the `dedup_keys` table.
#[derive(Clone)]
pub struct PostgresDedupLedger {
    pool: PgPool,
}

impl PostgresDedupLedger {
    /// Create a ledger over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(context: &str, error: &sqlx::Error) -> LedgerError {
    LedgerError::Storage(format!("{context}: {error}"))
}

impl DedupLedger for PostgresDedupLedger {
    async fn apply_once<F, Fut, E>(&self, key: &str, effect: F) -> Result<Dedup, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), E>> + Send,
        E: From<LedgerError> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| E::from(storage("Failed to begin dedup transaction", &e)))?;

        let inserted = sqlx::query("INSERT INTO dedup_keys (key) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| E::from(storage("Failed to record dedup key", &e)))?
            .rows_affected();

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| E::from(storage("Failed to roll back dedup transaction", &e)))?;
            tracing::debug!(key, "Effect already applied, skipping");
            return Ok(Dedup::AlreadyApplied);
        }

        match effect().await {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| E::from(storage("Failed to commit dedup key", &e)))?;
                Ok(Dedup::Applied)
            },
            Err(error) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(key, error = %e, "Failed to roll back dedup key after effect error");
                }
                Err(error)
            },
        }
    }

    async fn contains(&self, key: &str) -> Result<bool, LedgerError> {
        let found: Option<(String,)> = sqlx::query_as("SELECT key FROM dedup_keys WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage("Failed to read dedup key", &e))?;

        Ok(found.is_some())
    }
}
