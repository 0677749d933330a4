//! In-memory dedup ledger.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use ticketflow_core::dedup::{Dedup, DedupLedger, LedgerError};
use tokio::sync::Mutex;

/// In-memory [`DedupLedger`].
///
/// The ledger lock is held while an effect runs, so concurrent `apply_once`
/// calls for the same key apply the effect at most once.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDedupLedger {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl InMemoryDedupLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.keys.lock().await.iter().cloned().collect();
        keys.sort();
        keys
    }
}

impl DedupLedger for InMemoryDedupLedger {
    async fn apply_once<F, Fut, E>(&self, key: &str, effect: F) -> Result<Dedup, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(), E>> + Send,
        E: From<LedgerError> + Send,
    {
        let mut keys = self.keys.lock().await;
        if keys.contains(key) {
            tracing::debug!(key, "Effect already applied, skipping");
            return Ok(Dedup::AlreadyApplied);
        }
        effect().await?;
        keys.insert(key.to_string());
        Ok(Dedup::Applied)
    }

    async fn contains(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.keys.lock().await.contains(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn effect_runs_once_per_key() {
        let ledger = InMemoryDedupLedger::new();
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let outcome = ledger
                .apply_once("refund-payment:k-1", || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, LedgerError>(())
                })
                .await
                .unwrap();
            assert!(matches!(outcome, Dedup::Applied | Dedup::AlreadyApplied));
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(ledger.contains("refund-payment:k-1").await.unwrap());
    }

    #[tokio::test]
    async fn failed_effect_leaves_key_unrecorded() {
        let ledger = InMemoryDedupLedger::new();

        let result = ledger
            .apply_once("void-receipt:k-1", || async {
                Err::<(), _>(LedgerError::Storage("receipts down".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert!(!ledger.contains("void-receipt:k-1").await.unwrap());
    }
}
