//! In-memory transactional outbox.
//!
//! Rows appended through [`InMemoryOutbox`] are staged in an [`InMemoryTx`] and
//! only become visible to readers on [`InMemoryOutbox::commit`], which assigns
//! offsets in commit order. Rolling back (or dropping) the transaction discards
//! them.

#![allow(clippy::missing_panics_doc)] // Lock poisoning only follows a panicking test

use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use ticketflow_core::Message;
use ticketflow_core::outbox::{OutboxError, OutboxReader, OutboxRow, OutboxWriter};

/// A transaction of the in-memory outbox.
#[derive(Debug, Default)]
pub struct InMemoryTx {
    staged: Vec<(String, Message)>,
}

impl InMemoryTx {
    /// Number of rows staged so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Whether nothing was staged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

#[derive(Debug, Default)]
struct State {
    rows: Vec<OutboxRow>,
    last_offset: i64,
    cursors: HashMap<String, i64>,
    cursor_failures: usize,
    cursor_read_failures: usize,
    append_failures: usize,
}

/// In-memory [`OutboxWriter`] and [`OutboxReader`].
///
/// # Example
///
/// ```
/// use ticketflow_testing::InMemoryOutbox;
/// use ticketflow_core::{Message, outbox::{OutboxReader, OutboxWriter}};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let outbox = InMemoryOutbox::new();
/// let mut tx = outbox.begin();
/// outbox.append(&mut tx, "events_to_forward", &Message::new(b"{}".to_vec())).await?;
/// assert!(outbox.poll("events_to_forward", 0, 10).await?.is_empty());
///
/// outbox.commit(tx);
/// assert_eq!(outbox.poll("events_to_forward", 0, 10).await?.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<State>>,
}

impl InMemoryOutbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Start a transaction.
    #[must_use]
    pub fn begin(&self) -> InMemoryTx {
        InMemoryTx::default()
    }

    /// Commit a transaction, making its rows visible with fresh offsets.
    /// Returns the offsets assigned.
    pub fn commit(&self, tx: InMemoryTx) -> Vec<i64> {
        let mut state = self.lock();
        let inserted_at = Utc::now();
        tx.staged
            .into_iter()
            .map(|(topic, message)| {
                state.last_offset += 1;
                let offset = state.last_offset;
                state.rows.push(OutboxRow {
                    offset,
                    topic,
                    message,
                    inserted_at,
                });
                offset
            })
            .collect()
    }

    /// Discard a transaction.
    pub fn rollback(&self, tx: InMemoryTx) {
        drop(tx);
    }

    /// All committed rows of `topic`.
    #[must_use]
    pub fn rows(&self, topic: &str) -> Vec<OutboxRow> {
        self.lock()
            .rows
            .iter()
            .filter(|row| row.topic == topic)
            .cloned()
            .collect()
    }

    /// Make the next `count` cursor advances fail.
    pub fn fail_cursor_updates(&self, count: usize) {
        self.lock().cursor_failures = count;
    }

    /// Make the next `count` cursor reads fail.
    pub fn fail_cursor_reads(&self, count: usize) {
        self.lock().cursor_read_failures = count;
    }

    /// Make the next `count` appends fail.
    pub fn fail_appends(&self, count: usize) {
        self.lock().append_failures = count;
    }
}

impl OutboxWriter for InMemoryOutbox {
    type Tx = InMemoryTx;

    fn append<'a>(
        &'a self,
        tx: &'a mut Self::Tx,
        topic: &'a str,
        message: &'a Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            {
                let mut state = self.lock();
                if state.append_failures > 0 {
                    state.append_failures -= 1;
                    return Err(OutboxError::Storage("injected append failure".to_string()));
                }
            }
            tx.staged.push((topic.to_string(), message.clone()));
            Ok(())
        })
    }
}

impl OutboxReader for InMemoryOutbox {
    fn poll<'a>(
        &'a self,
        topic: &'a str,
        after_offset: i64,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRow>, OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .rows
                .iter()
                .filter(|row| row.topic == topic && row.offset > after_offset)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn cursor<'a>(
        &'a self,
        forwarder_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<i64, OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.cursor_read_failures > 0 {
                state.cursor_read_failures -= 1;
                return Err(OutboxError::Storage("injected cursor read failure".to_string()));
            }
            Ok(state.cursors.get(forwarder_id).copied().unwrap_or(0))
        })
    }

    fn advance_cursor<'a>(
        &'a self,
        forwarder_id: &'a str,
        offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.lock();
            if state.cursor_failures > 0 {
                state.cursor_failures -= 1;
                return Err(OutboxError::Storage("injected cursor failure".to_string()));
            }
            let cursor = state.cursors.entry(forwarder_id.to_string()).or_insert(0);
            *cursor = (*cursor).max(offset);
            Ok(())
        })
    }
}
