//! In-memory document store.

#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use ticketflow_projections::{DocumentError, DocumentStore, Lookup};

#[derive(Debug, Default)]
struct State {
    documents: BTreeMap<String, Value>,
    conflicts: usize,
}

/// In-memory [`DocumentStore`] backed by a `BTreeMap`.
///
/// Updates run under one lock, so they are serialized. Use
/// [`InMemoryDocumentStore::fail_updates_with_conflict`] to exercise conflict
/// handling.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().documents.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().documents.is_empty()
    }

    /// Make the next `count` updates fail with [`DocumentError::Conflict`].
    pub fn fail_updates_with_conflict(&self, count: usize) {
        self.lock().conflicts = count;
    }
}

impl DocumentStore for InMemoryDocumentStore {
    async fn insert_if_absent(&self, key: &str, document: &Value) -> Result<bool, DocumentError> {
        let mut state = self.lock();
        if state.documents.contains_key(key) {
            return Ok(false);
        }
        state.documents.insert(key.to_string(), document.clone());
        Ok(true)
    }

    async fn get(&self, lookup: &Lookup) -> Result<Option<Value>, DocumentError> {
        Ok(self
            .lock()
            .documents
            .iter()
            .find(|(key, document)| lookup.matches(key, document))
            .map(|(_, document)| document.clone()))
    }

    async fn update<F>(&self, lookup: &Lookup, merge: F) -> Result<Value, DocumentError>
    where
        F: FnOnce(Value) -> Result<Value, DocumentError> + Send,
    {
        let mut state = self.lock();
        if state.conflicts > 0 {
            state.conflicts -= 1;
            return Err(DocumentError::Conflict(format!("injected conflict on {lookup}")));
        }

        let Some((key, current)) = state
            .documents
            .iter()
            .find(|(key, document)| lookup.matches(key, document))
            .map(|(key, document)| (key.clone(), document.clone()))
        else {
            return Err(DocumentError::NotFound(lookup.to_string()));
        };

        let next = merge(current)?;
        state.documents.insert(key, next.clone());
        Ok(next)
    }

    async fn all(&self) -> Result<Vec<Value>, DocumentError> {
        Ok(self.lock().documents.values().cloned().collect())
    }
}
