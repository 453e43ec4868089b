//! Registry of in-flight streaming queries.
//!
//! Streaming reads can run for a long time; the registry gives operators
//! visibility into what is running and a handle to kill an entry, which
//! cancels the request's context and aborts the backend stream.

use std::time::Instant;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

struct Entry {
    sql: String,
    started: Instant,
    cancel: CancellationToken,
}

/// Snapshot of one live streaming query.
#[derive(Debug, Clone)]
pub struct QueryDetail {
    /// Registry id, usable with [`QueryList::terminate`].
    pub id: u64,
    /// The SQL being streamed.
    pub sql: String,
    /// How long the stream has been running.
    pub elapsed: std::time::Duration,
}

/// Thread-safe registry of live streams.
#[derive(Default)]
pub struct QueryList {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

impl QueryList {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream and returns its id.
    pub fn add(&self, sql: impl Into<String>, cancel: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.lock().insert(
            id,
            Entry {
                sql: sql.into(),
                started: Instant::now(),
                cancel,
            },
        );
        id
    }

    /// Removes a finished stream.
    pub fn remove(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    /// Cancels a live stream. Returns false if the id is unknown (already
    /// finished).
    pub fn terminate(&self, id: u64) -> bool {
        match self.entries.lock().get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Snapshot of all live streams.
    pub fn snapshot(&self) -> Vec<QueryDetail> {
        self.entries
            .lock()
            .iter()
            .map(|(&id, entry)| QueryDetail {
                id,
                sql: entry.sql.clone(),
                elapsed: entry.started.elapsed(),
            })
            .collect()
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no stream is live.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let list = QueryList::new();
        let id = list.add("select * from t", CancellationToken::new());
        assert_eq!(list.len(), 1);
        assert_eq!(list.snapshot()[0].sql, "select * from t");
        list.remove(id);
        assert!(list.is_empty());
    }

    #[test]
    fn test_terminate_cancels_token() {
        let list = QueryList::new();
        let token = CancellationToken::new();
        let id = list.add("select * from t", token.clone());

        assert!(list.terminate(id));
        assert!(token.is_cancelled());
        assert!(!list.terminate(9999));
    }
}
