//! Per-plan counters and the per-query log record.
//!
//! Counters are plain atomics so hot paths never take a lock; the only
//! locked structure is the named internal-error map, which is written on
//! failure paths only. One structured log event is emitted per query at
//! request end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::plan::PlanId;
use crate::tx::TxId;

/// Result-size histogram bucket upper bounds (inclusive); the last bucket
/// is unbounded.
const RESULT_BUCKETS: [u64; 7] = [0, 1, 5, 10, 50, 100, 500];

/// Counters for one plan shape.
#[derive(Debug, Default)]
pub struct PlanStats {
    /// Number of executions.
    pub calls: AtomicU64,
    /// Total execution time in nanoseconds.
    pub duration_ns: AtomicU64,
    /// Total rows affected/returned.
    pub rows: AtomicU64,
    /// Number of failed executions.
    pub errors: AtomicU64,
}

/// Process-wide engine counters.
#[derive(Debug, Default)]
pub struct QueryEngineStats {
    plans: [PlanStats; PlanId::COUNT],
    result_buckets: [AtomicU64; RESULT_BUCKETS.len() + 1],
    /// Reads served by joining an in-flight identical read.
    pub consolidations: AtomicU64,
    /// Total time followers spent waiting on consolidated calls.
    pub consolidation_wait_ns: AtomicU64,
    /// Row-cache spot checks performed.
    pub spot_checks: AtomicU64,
    internal_errors: Mutex<HashMap<String, u64>>,
}

impl QueryEngineStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one execution of `plan_id`.
    pub fn add_plan(&self, plan_id: PlanId, duration: Duration, rows: u64, failed: bool) {
        let stats = &self.plans[plan_id.index()];
        stats.calls.fetch_add(1, Ordering::Relaxed);
        stats
            .duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        stats.rows.fetch_add(rows, Ordering::Relaxed);
        if failed {
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counters for one plan shape.
    pub fn plan(&self, plan_id: PlanId) -> &PlanStats {
        &self.plans[plan_id.index()]
    }

    /// Records the size of a returned result set.
    pub fn record_result_size(&self, rows: u64) {
        let idx = RESULT_BUCKETS
            .iter()
            .position(|&bound| rows <= bound)
            .unwrap_or(RESULT_BUCKETS.len());
        self.result_buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the result-size histogram.
    pub fn result_histogram(&self) -> Vec<u64> {
        self.result_buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    /// Records a follower's consolidation wait.
    pub fn record_consolidation(&self, waited: Duration) {
        self.consolidations.fetch_add(1, Ordering::Relaxed);
        self.consolidation_wait_ns
            .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Bumps a named internal-error counter.
    pub fn add_internal_error(&self, name: &str) {
        *self.internal_errors.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    /// Current value of a named internal-error counter.
    pub fn internal_error_count(&self, name: &str) -> u64 {
        self.internal_errors.lock().get(name).copied().unwrap_or(0)
    }
}

/// Sources that served parts of one query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuerySources {
    /// The row cache contributed rows.
    pub rowcache: bool,
    /// The result came from a consolidated call led by another request.
    pub consolidator: bool,
}

/// Accumulates the log record for one query and emits it at request end.
#[derive(Debug)]
pub struct LogStats {
    /// The statement as received (template text).
    pub original_sql: String,
    /// Plan shape name.
    pub plan_type: &'static str,
    /// Transaction id, if executed inside one.
    pub tx_id: Option<TxId>,
    /// Statements actually sent to the backend (or synthetic markers).
    pub rewritten: Vec<String>,
    /// Row-cache hits for this query.
    pub cache_hits: u64,
    /// Rows fetched from the backend on cache miss.
    pub cache_misses: u64,
    /// Requested rows that exist nowhere.
    pub cache_absent: u64,
    /// Rows affected/returned.
    pub rows_affected: u64,
    /// Time spent waiting for a pool connection.
    pub waiting_for_conn: Duration,
    /// Where the result came from.
    pub sources: QuerySources,
    start: Instant,
}

impl LogStats {
    /// Starts a log record for one query.
    pub fn new(original_sql: impl Into<String>, plan_type: &'static str) -> Self {
        Self {
            original_sql: original_sql.into(),
            plan_type,
            tx_id: None,
            rewritten: Vec::new(),
            cache_hits: 0,
            cache_misses: 0,
            cache_absent: 0,
            rows_affected: 0,
            waiting_for_conn: Duration::ZERO,
            sources: QuerySources::default(),
            start: Instant::now(),
        }
    }

    /// Records a statement sent to the backend (or a synthetic
    /// begin/commit/rollback marker).
    pub fn add_rewritten(&mut self, sql: impl Into<String>) {
        self.rewritten.push(sql.into());
    }

    /// Time since the record was started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Emits the structured per-query log event.
    pub fn finish(&self, error: Option<&str>) {
        tracing::info!(
            target: "tabserv::querylog",
            sql = %self.original_sql,
            plan = self.plan_type,
            tx_id = self.tx_id,
            queries = self.rewritten.len(),
            rows = self.rows_affected,
            cache_hits = self.cache_hits,
            cache_misses = self.cache_misses,
            cache_absent = self.cache_absent,
            consolidated = self.sources.consolidator,
            rowcache = self.sources.rowcache,
            conn_wait_us = self.waiting_for_conn.as_micros() as u64,
            duration_us = self.elapsed().as_micros() as u64,
            error,
            "query"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_counters() {
        let stats = QueryEngineStats::new();
        stats.add_plan(PlanId::PkIn, Duration::from_millis(2), 3, false);
        stats.add_plan(PlanId::PkIn, Duration::from_millis(1), 0, true);

        let plan = stats.plan(PlanId::PkIn);
        assert_eq!(plan.calls.load(Ordering::Relaxed), 2);
        assert_eq!(plan.rows.load(Ordering::Relaxed), 3);
        assert_eq!(plan.errors.load(Ordering::Relaxed), 1);
        assert!(plan.duration_ns.load(Ordering::Relaxed) >= 3_000_000);
        assert_eq!(stats.plan(PlanId::Set).calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_result_histogram() {
        let stats = QueryEngineStats::new();
        stats.record_result_size(0);
        stats.record_result_size(1);
        stats.record_result_size(7);
        stats.record_result_size(10_000);

        let histogram = stats.result_histogram();
        assert_eq!(histogram[0], 1); // 0
        assert_eq!(histogram[1], 1); // 1
        assert_eq!(histogram[3], 1); // <= 10
        assert_eq!(histogram[7], 1); // unbounded tail
    }

    #[test]
    fn test_internal_errors() {
        let stats = QueryEngineStats::new();
        assert_eq!(stats.internal_error_count("Mismatch"), 0);
        stats.add_internal_error("Mismatch");
        stats.add_internal_error("Mismatch");
        assert_eq!(stats.internal_error_count("Mismatch"), 2);
    }

    #[test]
    fn test_consolidation_wait() {
        let stats = QueryEngineStats::new();
        stats.record_consolidation(Duration::from_micros(250));
        assert_eq!(stats.consolidations.load(Ordering::Relaxed), 1);
        assert_eq!(stats.consolidation_wait_ns.load(Ordering::Relaxed), 250_000);
    }

    #[test]
    fn test_log_stats_accumulates() {
        let mut log = LogStats::new("select * from t", "PASS_SELECT");
        log.add_rewritten("select * from t limit 10001");
        log.rows_affected = 4;
        assert_eq!(log.rewritten.len(), 1);
        log.finish(None);
    }
}
