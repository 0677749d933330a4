//! Dedup ledger for idempotent effects.
//!
//! Handlers that trigger externally visible effects (issuing a receipt,
//! refunding a payment) run them through [`DedupLedger::apply_once`] keyed by a
//! business identifier. A key whose effect already succeeded is never applied
//! again, however many times the triggering message is redelivered.
//!
//! ```text
//! apply_once(key, effect)
//!   ├─ key recorded?  ── yes ─► Ok(AlreadyApplied)   (effect not run)
//!   └─ no ─► effect() ─┬─ Ok  ─► record key ─► Ok(Applied)
//!                      └─ Err ─► key not recorded ─► Err (retry may apply it)
//! ```
//!
//! Implementations record the key in the same unit of work as the effect so
//! two concurrent deliveries cannot both apply it.

use std::future::Future;
use thiserror::Error;

/// Outcome of [`DedupLedger::apply_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dedup {
    /// The effect ran and the key is now recorded.
    Applied,
    /// The key was already recorded; the effect did not run.
    AlreadyApplied,
}

/// Errors raised by the ledger itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The ledger's backing store failed.
    #[error("Dedup ledger storage error: {0}")]
    Storage(String),
}

/// A set of processed business keys.
pub trait DedupLedger: Send + Sync {
    /// Run `effect` unless `key` was already recorded, recording it on success.
    ///
    /// # Errors
    ///
    /// Returns the effect's error (the key stays unrecorded), or a
    /// [`LedgerError`] converted into `E`.
    fn apply_once<F, Fut, E>(
        &self,
        key: &str,
        effect: F,
    ) -> impl Future<Output = Result<Dedup, E>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), E>> + Send,
        E: From<LedgerError> + Send;

    /// Whether `key` is recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the ledger cannot be read.
    fn contains(&self, key: &str) -> impl Future<Output = Result<bool, LedgerError>> + Send;
}

/// Build a ledger key from an operation name and a business id.
#[must_use]
pub fn dedup_key(operation: &str, id: &str) -> String {
    format!("{operation}:{id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_operation_and_id() {
        assert_eq!(dedup_key("void-receipt", "k-1"), "void-receipt:k-1");
    }
}
