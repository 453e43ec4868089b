//! Single-flight consolidation of identical reads.
//!
//! When many clients issue the same read at the same time, only one backend
//! execution runs; the rest wait on the in-flight call and share its
//! outcome. Consolidation applies only to read-only, side-effect-free,
//! out-of-transaction statements, keyed by the canonical final SQL string.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::sqltypes::QueryResult;

/// One in-flight consolidated call.
pub struct Call {
    outcome: Mutex<Option<Result<QueryResult>>>,
    done: watch::Sender<bool>,
}

impl Call {
    fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            outcome: Mutex::new(None),
            done,
        }
    }

    /// Waits for the leader to publish and returns a copy of its outcome.
    pub async fn wait(&self) -> Result<QueryResult> {
        let mut rx = self.done.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.outcome
            .lock()
            .clone()
            .unwrap_or_else(|| Err(Error::fatal("consolidated call vanished without a result")))
    }
}

/// Map of in-flight calls keyed by canonical SQL.
#[derive(Default)]
pub struct Consolidator {
    inflight: Mutex<HashMap<String, Arc<Call>>>,
}

impl Consolidator {
    /// Creates an empty consolidator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins or starts the in-flight call for `sql`.
    ///
    /// Returns `(call, true)` when the caller is the leader and must execute
    /// the query and [`finish`](Self::finish) it; `(call, false)` when an
    /// execution is already in flight and the caller should
    /// [`wait`](Call::wait).
    pub fn create(&self, sql: &str) -> (Arc<Call>, bool) {
        let mut inflight = self.inflight.lock();
        if let Some(call) = inflight.get(sql) {
            return (call.clone(), false);
        }
        let call = Arc::new(Call::new());
        inflight.insert(sql.to_string(), call.clone());
        (call, true)
    }

    /// Publishes the leader's outcome and wakes all followers. The entry is
    /// removed first, so a new identical query starts a fresh execution.
    pub fn finish(&self, sql: &str, call: &Arc<Call>, outcome: Result<QueryResult>) {
        self.inflight.lock().remove(sql);
        *call.outcome.lock() = Some(outcome);
        let _ = call.done.send(true);
    }

    /// Number of distinct statements currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().len()
    }

    /// Wraps a leader's call in a guard that publishes on every exit path.
    /// If the leader's execution is dropped mid-flight (deadline, client
    /// disconnect), the guard publishes an error so followers are never
    /// stranded.
    pub fn leader_guard(&self, sql: String, call: Arc<Call>) -> LeaderGuard<'_> {
        LeaderGuard {
            consolidator: self,
            sql,
            call,
            finished: false,
        }
    }
}

/// Publish-on-drop guard held by a consolidation leader.
pub struct LeaderGuard<'c> {
    consolidator: &'c Consolidator,
    sql: String,
    call: Arc<Call>,
    finished: bool,
}

impl<'c> LeaderGuard<'c> {
    /// Publishes the leader's outcome.
    pub fn finish(mut self, outcome: Result<QueryResult>) {
        self.finished = true;
        self.consolidator.finish(&self.sql, &self.call, outcome);
    }
}

impl<'c> Drop for LeaderGuard<'c> {
    fn drop(&mut self) {
        if !self.finished {
            self.consolidator.finish(
                &self.sql,
                &self.call,
                Err(Error::fail("consolidated query interrupted")),
            );
        }
    }
}
