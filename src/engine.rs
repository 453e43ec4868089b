//! Query engine: the composition root.
//!
//! One [`QueryEngine`] per served tablet owns the connection pools, the
//! transaction pool, the consolidator, the schema registry, stats and the
//! background maintenance tasks. There is no process-global state: the
//! serving process constructs the engine at tablet start and tears it down
//! at shutdown, which drains background work and rejects new acquires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backend::Connector;
use crate::consolidator::Consolidator;
use crate::context::ReqContext;
use crate::error::{Error, Result};
use crate::executor::QueryExecutor;
use crate::plan::Plan;
use crate::pool::ConnPool;
use crate::querylist::QueryList;
use crate::rowcache::RowStore;
use crate::schema::SchemaInfo;
use crate::sqlgen::BindVars;
use crate::sqltypes::QueryResult;
use crate::stats::{LogStats, QueryEngineStats};
use crate::tx::{DirtyTables, TxId, TxPool};

/// Scale factor for the spot-check frequency: the configured ratio is
/// stored as `ratio * SPOT_CHECK_MULTIPLIER` and compared against a draw
/// modulo the multiplier.
pub const SPOT_CHECK_MULTIPLIER: i64 = 1_000_000;

/// Engine construction parameters. Every duration/size here that has a
/// `vt_*` counterpart stays adjustable at runtime through SET statements.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the general-purpose connection pool.
    pub pool_size: usize,
    /// Capacity of the streaming connection pool.
    pub stream_pool_size: usize,
    /// Capacity of the transaction connection pool.
    pub tx_pool_size: usize,
    /// Idle transactions older than this are rolled back.
    pub tx_timeout: Duration,
    /// How long `begin` waits for a free transaction connection.
    pub tx_pool_timeout: Duration,
    /// Pool connections idle longer than this are closed.
    pub idle_timeout: Duration,
    /// Per-query deadline; zero disables it.
    pub query_timeout: Duration,
    /// Hard cap on rows per result.
    pub max_result_size: usize,
    /// Batch size for decomposed DMLs.
    pub max_dml_rows: usize,
    /// Streaming chunk size in bytes.
    pub stream_buffer_size: usize,
    /// Reject DMLs the planner could not fully decompose.
    pub strict_mode: bool,
    /// Wrap out-of-transaction DMLs in an implicit transaction instead of
    /// rejecting them.
    pub enable_auto_commit: bool,
    /// Treat table-ACL failures as errors instead of logging them.
    pub strict_table_acl: bool,
    /// Fraction of cache hits to verify against the backend, in [0, 1].
    pub spot_check_ratio: f64,
    /// How long a spot-check mismatch waits before re-reading the cache,
    /// to absorb in-flight invalidations.
    pub spot_check_recheck_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 16,
            stream_pool_size: 8,
            tx_pool_size: 20,
            tx_timeout: Duration::from_secs(30),
            tx_pool_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30 * 60),
            query_timeout: Duration::ZERO,
            max_result_size: 10_000,
            max_dml_rows: 500,
            stream_buffer_size: 32 * 1024,
            strict_mode: true,
            enable_auto_commit: false,
            strict_table_acl: false,
            spot_check_ratio: 0.0,
            spot_check_recheck_delay: Duration::from_secs(10),
        }
    }
}

/// Process-wide query serving state for one tablet.
pub struct QueryEngine<C: Connector, R> {
    conn_pool: ConnPool<C>,
    stream_conn_pool: ConnPool<C>,
    tx_pool: TxPool<C>,
    consolidator: Consolidator,
    schema: SchemaInfo<R>,
    stats: Arc<QueryEngineStats>,
    stream_queries: QueryList,

    max_result_size: AtomicUsize,
    max_dml_rows: AtomicUsize,
    stream_buffer_size: AtomicUsize,
    query_timeout_ns: AtomicU64,
    spot_check_freq: AtomicI64,
    strict_mode: AtomicBool,
    enable_auto_commit: bool,
    strict_table_acl: bool,
    recheck_delay: Duration,

    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl<C: Connector, R: RowStore> QueryEngine<C, R> {
    /// Creates the engine and starts its maintenance task. Must be called
    /// from within a tokio runtime.
    pub fn new(connector: C, schema: SchemaInfo<R>, config: Config) -> Arc<Self>
    where
        C: Clone,
    {
        let conn_pool = ConnPool::new(connector.clone(), config.pool_size, config.idle_timeout);
        let stream_conn_pool =
            ConnPool::new(connector.clone(), config.stream_pool_size, config.idle_timeout);
        let tx_conn_pool = ConnPool::new(connector, config.tx_pool_size, config.idle_timeout);
        let tx_pool = TxPool::new(tx_conn_pool, config.tx_timeout, config.tx_pool_timeout);

        let engine = Arc::new(Self {
            conn_pool,
            stream_conn_pool,
            tx_pool,
            consolidator: Consolidator::new(),
            schema,
            stats: Arc::new(QueryEngineStats::new()),
            stream_queries: QueryList::new(),
            max_result_size: AtomicUsize::new(config.max_result_size),
            max_dml_rows: AtomicUsize::new(config.max_dml_rows),
            stream_buffer_size: AtomicUsize::new(config.stream_buffer_size),
            query_timeout_ns: AtomicU64::new(config.query_timeout.as_nanos() as u64),
            spot_check_freq: AtomicI64::new(
                (config.spot_check_ratio * SPOT_CHECK_MULTIPLIER as f64) as i64,
            ),
            strict_mode: AtomicBool::new(config.strict_mode),
            enable_auto_commit: config.enable_auto_commit,
            strict_table_acl: config.strict_table_acl,
            recheck_delay: config.spot_check_recheck_delay,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });
        engine.spawn_maintenance();
        engine
    }

    fn spawn_maintenance(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let Some(engine) = weak.upgrade() else { break };
                engine.conn_pool.reap_idle();
                engine.stream_conn_pool.reap_idle();
                engine.tx_pool.reap_idle_conns();
                let ctx = ReqContext::internal();
                let _ = engine.tx_pool.reap(&ctx).await;
            }
        });
    }

    /// Executes one (plan, bind-vars, tx) request and records its stats and
    /// log record.
    pub async fn execute(
        &self,
        plan: &Plan,
        bind_vars: BindVars,
        tx_id: Option<TxId>,
        ctx: &ReqContext,
    ) -> Result<QueryResult> {
        let original = plan
            .full_query
            .as_ref()
            .map(|q| q.text().to_string())
            .unwrap_or_default();
        let mut log = LogStats::new(original, plan.plan_id.as_str());
        log.tx_id = tx_id;

        let start = Instant::now();
        let result = self
            .execute_with_deadline(plan, bind_vars, tx_id, ctx, &mut log)
            .await;

        let (rows, failed) = match &result {
            Ok(reply) => {
                log.rows_affected = reply.rows_affected;
                self.stats.record_result_size(reply.rows.len() as u64);
                (reply.rows_affected, false)
            }
            Err(_) => (0, true),
        };
        self.stats.add_plan(plan.plan_id, start.elapsed(), rows, failed);
        let err_text = result.as_ref().err().map(|e| e.to_string());
        log.finish(err_text.as_deref());
        result
    }

    async fn execute_with_deadline(
        &self,
        plan: &Plan,
        bind_vars: BindVars,
        tx_id: Option<TxId>,
        ctx: &ReqContext,
        log: &mut LogStats,
    ) -> Result<QueryResult> {
        let timeout = self.query_timeout();
        let child = ctx.child();
        let mut executor = QueryExecutor::new(self, plan, bind_vars, tx_id, child.clone(), log);
        if timeout.is_zero() {
            return executor.execute().await;
        }
        tokio::select! {
            result = executor.execute() => result,
            _ = tokio::time::sleep(timeout) => {
                child.cancel();
                Err(Error::fail(format!(
                    "exceeded query timeout of {:?}",
                    timeout
                )))
            }
        }
    }

    /// Executes a streaming read, delivering chunks through `send`.
    pub async fn stream_execute(
        &self,
        plan: &Plan,
        bind_vars: BindVars,
        ctx: &ReqContext,
        send: crate::backend::StreamSink<'_>,
    ) -> Result<()> {
        let original = plan
            .full_query
            .as_ref()
            .map(|q| q.text().to_string())
            .unwrap_or_default();
        let mut log = LogStats::new(original, plan.plan_id.as_str());

        let start = Instant::now();
        let child = ctx.child();
        let mut executor = QueryExecutor::new(self, plan, bind_vars, None, child, &mut log);
        let result = executor.stream(send).await;

        self.stats
            .add_plan(plan.plan_id, start.elapsed(), 0, result.is_err());
        let err_text = result.as_ref().err().map(|e| e.to_string());
        log.finish(err_text.as_deref());
        result
    }

    /// Starts a transaction.
    pub async fn begin(&self, ctx: &ReqContext) -> Result<TxId> {
        self.tx_pool.begin(ctx).await
    }

    /// Commits a transaction and purges its dirty keys from the row cache.
    ///
    /// Invalidation completes before the pinned connection returns to the
    /// pool, so a subsequent read cannot observe the pre-commit row through
    /// the cache.
    pub async fn commit(&self, ctx: &ReqContext, txid: TxId) -> Result<()> {
        let ended = self.tx_pool.commit(ctx, txid).await?;
        self.purge_dirty(&ended.dirty).await;
        Ok(())
    }

    /// Commits after a DDL: a failed backend COMMIT is logged, not raised,
    /// because the DDL itself already committed on the backend.
    pub async fn safe_commit(&self, ctx: &ReqContext, txid: TxId) {
        let ended = self.tx_pool.safe_commit(ctx, txid).await;
        self.purge_dirty(&ended.dirty).await;
    }

    /// Rolls a transaction back.
    pub async fn rollback(&self, ctx: &ReqContext, txid: TxId) -> Result<()> {
        self.tx_pool.rollback(ctx, txid).await
    }

    async fn purge_dirty(&self, dirty: &DirtyTables) {
        for (table, keys) in dirty {
            match self.schema.table_cache(table) {
                Some(cache) => {
                    for key in keys {
                        cache.delete(key).await;
                    }
                }
                None => {
                    tracing::warn!(table, "dirty keys for a table without a cache");
                }
            }
        }
    }

    /// Submits background work tied to engine shutdown.
    pub fn launch<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    /// Shuts the engine down: rolls back stray transactions, closes the
    /// pools, and waits for background tasks to drain.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let ctx = ReqContext::internal();
        let strays = self.tx_pool.shutdown(&ctx).await;
        for _ in 0..strays {
            self.stats.add_internal_error("StrayTransactions");
        }
        self.conn_pool.close();
        self.stream_conn_pool.close();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// The general-purpose connection pool.
    pub fn conn_pool(&self) -> &ConnPool<C> {
        &self.conn_pool
    }

    /// The streaming connection pool.
    pub fn stream_conn_pool(&self) -> &ConnPool<C> {
        &self.stream_conn_pool
    }

    /// The transaction pool.
    pub fn tx_pool(&self) -> &TxPool<C> {
        &self.tx_pool
    }

    /// The read consolidator.
    pub fn consolidator(&self) -> &Consolidator {
        &self.consolidator
    }

    /// The schema registry.
    pub fn schema(&self) -> &SchemaInfo<R> {
        &self.schema
    }

    /// Engine counters.
    pub fn stats(&self) -> &Arc<QueryEngineStats> {
        &self.stats
    }

    /// Registry of live streaming queries.
    pub fn stream_queries(&self) -> &QueryList {
        &self.stream_queries
    }

    /// Hard cap on rows per result.
    pub fn max_result_size(&self) -> usize {
        self.max_result_size.load(Ordering::Relaxed)
    }

    /// Updates the per-result row cap.
    pub fn set_max_result_size(&self, n: usize) {
        self.max_result_size.store(n, Ordering::Relaxed);
    }

    /// Batch size for decomposed DMLs.
    pub fn max_dml_rows(&self) -> usize {
        self.max_dml_rows.load(Ordering::Relaxed)
    }

    /// Updates the DML batch size.
    pub fn set_max_dml_rows(&self, n: usize) {
        self.max_dml_rows.store(n, Ordering::Relaxed);
    }

    /// Streaming chunk size in bytes.
    pub fn stream_buffer_size(&self) -> usize {
        self.stream_buffer_size.load(Ordering::Relaxed)
    }

    /// Updates the streaming chunk size.
    pub fn set_stream_buffer_size(&self, n: usize) {
        self.stream_buffer_size.store(n, Ordering::Relaxed);
    }

    /// Per-query deadline; zero means disabled.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_nanos(self.query_timeout_ns.load(Ordering::Relaxed))
    }

    /// Updates the per-query deadline.
    pub fn set_query_timeout(&self, d: Duration) {
        self.query_timeout_ns
            .store(d.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Spot-check frequency, scaled by [`SPOT_CHECK_MULTIPLIER`].
    pub fn spot_check_freq(&self) -> i64 {
        self.spot_check_freq.load(Ordering::Relaxed)
    }

    /// Updates the spot-check ratio (clamped scaling happens at the caller).
    pub fn set_spot_check_ratio(&self, ratio: f64) {
        self.spot_check_freq.store(
            (ratio * SPOT_CHECK_MULTIPLIER as f64) as i64,
            Ordering::Relaxed,
        );
    }

    /// Whether undecomposable DMLs are rejected.
    pub fn strict_mode(&self) -> bool {
        self.strict_mode.load(Ordering::Relaxed)
    }

    /// Updates strict mode.
    pub fn set_strict_mode(&self, on: bool) {
        self.strict_mode.store(on, Ordering::Relaxed);
    }

    /// Whether out-of-transaction DMLs run under an implicit transaction.
    pub fn enable_auto_commit(&self) -> bool {
        self.enable_auto_commit
    }

    /// Whether a table-ACL failure is terminal.
    pub fn strict_table_acl(&self) -> bool {
        self.strict_table_acl
    }

    /// Delay before a spot-check mismatch re-reads the cache.
    pub fn recheck_delay(&self) -> Duration {
        self.recheck_delay
    }
}
