//! Transaction pool: connections pinned to a transaction id.
//!
//! A transaction owns one backend connection from `begin` until commit or
//! rollback. While it lives, the pinned connection tracks the statements it
//! ran (for diagnostics) and the *dirty keys*: primary-key strings that
//! must be purged from the row cache when the transaction commits.
//!
//! Checkout discipline: [`TxPool::get`] hands the pinned connection to
//! exactly one executor at a time; a second concurrent checkout is a caller
//! bug and panics.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::{BackendError, Connector, ExecConn};
use crate::context::ReqContext;
use crate::error::{Error, Result};
use crate::pool::{ConnPool, PoolError, PooledConn};
use crate::sqltypes::QueryResult;

/// Transaction identifier. Monotonic per process; never reused.
pub type TxId = i64;

/// Dirty keys per table, accumulated by a transaction.
pub type DirtyTables = HashMap<String, HashSet<String>>;

struct TxSlot<C: Connector> {
    conn: Option<PooledConn<C>>,
    dirty: DirtyTables,
    queries: Vec<String>,
    last_used: Instant,
}

/// A finished transaction, still holding its pooled connection.
///
/// The engine purges `dirty` from the row cache while `conn` is alive, so
/// no other request can observe the pre-commit row through the cache after
/// acquiring this connection. Dropping `EndedTx` releases the connection.
pub struct EndedTx<C: Connector> {
    /// The pinned connection; `None` if it was discarded on a failed
    /// backend statement.
    pub conn: Option<PooledConn<C>>,
    /// Keys to purge from the row cache, per table.
    pub dirty: DirtyTables,
    /// Statements the transaction ran, for diagnostics.
    pub queries: Vec<String>,
}

impl<C: Connector> std::fmt::Debug for EndedTx<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndedTx")
            .field("conn", &self.conn.is_some())
            .field("dirty", &self.dirty)
            .field("queries", &self.queries)
            .finish()
    }
}

/// Pool of transaction-pinned connections, layered over [`ConnPool`].
pub struct TxPool<C: Connector> {
    pool: ConnPool<C>,
    active: Mutex<HashMap<TxId, TxSlot<C>>>,
    next_id: AtomicI64,
    timeout: Mutex<Duration>,
    pool_timeout: Mutex<Duration>,
}

impl<C: Connector> TxPool<C> {
    /// Creates a transaction pool over its own connection pool.
    pub fn new(pool: ConnPool<C>, timeout: Duration, pool_timeout: Duration) -> Self {
        Self {
            pool,
            active: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            timeout: Mutex::new(timeout),
            pool_timeout: Mutex::new(pool_timeout),
        }
    }

    /// Starts a transaction: acquires a connection within the pool timeout,
    /// issues `BEGIN`, and pins the connection to a fresh id.
    pub async fn begin(&self, ctx: &ReqContext) -> Result<TxId> {
        let pool_timeout = *self.pool_timeout.lock();
        let mut conn = match tokio::time::timeout(pool_timeout, self.pool.get(ctx)).await {
            Err(_) => {
                return Err(Error::tx_pool_full(
                    "transaction pool connection limit exceeded",
                ));
            }
            Ok(Err(PoolError::Closed)) => return Err(Error::fatal(PoolError::Closed.to_string())),
            Ok(Err(err)) => return Err(Error::fatal(err.to_string())),
            Ok(Ok(conn)) => conn,
        };
        if let Err(err) = conn.exec(ctx, "begin", 1, false).await {
            conn.discard();
            return Err(Error::fail(err.to_string()));
        }
        let txid = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(
            txid,
            TxSlot {
                conn: Some(conn),
                dirty: DirtyTables::new(),
                queries: Vec::new(),
                last_used: Instant::now(),
            },
        );
        Ok(txid)
    }

    /// Checks out the connection pinned to `txid`.
    ///
    /// # Panics
    ///
    /// Panics if the transaction does not exist (never begun, or already
    /// ended) or if its connection is already checked out. Both indicate a
    /// caller bug, not a runtime condition.
    pub fn get(&self, txid: TxId) -> TxConn<'_, C> {
        let mut active = self.active.lock();
        let slot = active
            .get_mut(&txid)
            .unwrap_or_else(|| panic!("transaction {} not found", txid));
        let conn = slot
            .conn
            .take()
            .unwrap_or_else(|| panic!("transaction {} is already in use", txid));
        TxConn {
            pool: self,
            txid,
            conn: Some(conn),
        }
    }

    /// Commits the transaction and unpins its connection.
    ///
    /// On success the returned [`EndedTx`] still holds the connection; the
    /// caller purges dirty keys before dropping it. A failed backend COMMIT
    /// discards the connection and surfaces the error.
    ///
    /// # Panics
    ///
    /// Panics like [`get`](Self::get) on unknown or checked-out ids.
    pub async fn commit(&self, ctx: &ReqContext, txid: TxId) -> Result<EndedTx<C>> {
        let mut slot = self.take_slot(txid);
        let mut conn = slot.conn.take().expect("slot conn present");
        if let Err(err) = conn.exec(ctx, "commit", 1, false).await {
            conn.discard();
            return Err(Error::fail(err.to_string()));
        }
        Ok(EndedTx {
            conn: Some(conn),
            dirty: std::mem::take(&mut slot.dirty),
            queries: std::mem::take(&mut slot.queries),
        })
    }

    /// Commits, downgrading a failed backend COMMIT to a logged warning.
    ///
    /// Used after DDL, where the backend has already implicitly committed
    /// and the statement itself is the source of truth.
    pub async fn safe_commit(&self, ctx: &ReqContext, txid: TxId) -> EndedTx<C> {
        let mut slot = self.take_slot(txid);
        let mut conn = slot.conn.take().expect("slot conn present");
        let conn = match conn.exec(ctx, "commit", 1, false).await {
            Ok(_) => Some(conn),
            Err(err) => {
                tracing::warn!(txid, error = %err, "commit failed after ddl");
                conn.discard();
                None
            }
        };
        EndedTx {
            conn,
            dirty: std::mem::take(&mut slot.dirty),
            queries: std::mem::take(&mut slot.queries),
        }
    }

    /// Rolls the transaction back and releases its connection. Dirty keys
    /// are discarded: nothing was committed, so nothing needs purging.
    ///
    /// # Panics
    ///
    /// Panics like [`get`](Self::get) on unknown or checked-out ids.
    pub async fn rollback(&self, ctx: &ReqContext, txid: TxId) -> Result<()> {
        let mut slot = self.take_slot(txid);
        let mut conn = slot.conn.take().expect("slot conn present");
        if let Err(err) = conn.exec(ctx, "rollback", 1, false).await {
            conn.discard();
            return Err(Error::fail(err.to_string()));
        }
        Ok(())
    }

    fn take_slot(&self, txid: TxId) -> TxSlot<C> {
        let mut active = self.active.lock();
        let slot = active
            .remove(&txid)
            .unwrap_or_else(|| panic!("transaction {} not found", txid));
        if slot.conn.is_none() {
            panic!("transaction {} is already in use", txid);
        }
        slot
    }

    /// Removes a transaction only if it exists and its connection is not
    /// checked out. Unlike [`take_slot`](Self::take_slot) this never
    /// panics: maintenance races against request completion.
    fn take_idle_slot(&self, txid: TxId) -> Option<TxSlot<C>> {
        let mut active = self.active.lock();
        match active.get(&txid) {
            Some(slot) if slot.conn.is_some() => active.remove(&txid),
            _ => None,
        }
    }

    async fn rollback_slot(&self, ctx: &ReqContext, mut slot: TxSlot<C>) {
        let mut conn = slot.conn.take().expect("idle slot has a conn");
        if let Err(err) = conn.exec(ctx, "rollback", 1, false).await {
            tracing::warn!(error = %err, "rollback failed");
            conn.discard();
        }
    }

    /// Rolls back transactions idle past the transaction timeout. Returns
    /// the killed ids. Transactions whose connection is checked out are
    /// skipped; they are still running.
    pub async fn reap(&self, ctx: &ReqContext) -> Vec<TxId> {
        let timeout = *self.timeout.lock();
        let now = Instant::now();
        let expired: Vec<TxId> = {
            let active = self.active.lock();
            active
                .iter()
                .filter(|(_, slot)| {
                    slot.conn.is_some() && now.duration_since(slot.last_used) >= timeout
                })
                .map(|(&id, _)| id)
                .collect()
        };
        let mut killed = Vec::new();
        for txid in expired {
            // The transaction may have completed or been checked out since
            // the scan.
            let Some(slot) = self.take_idle_slot(txid) else {
                continue;
            };
            tracing::warn!(txid, "killing idle transaction");
            self.rollback_slot(ctx, slot).await;
            killed.push(txid);
        }
        killed
    }

    /// Rolls back every live transaction and closes the underlying pool.
    /// Returns how many stray transactions were found.
    pub async fn shutdown(&self, ctx: &ReqContext) -> usize {
        let ids: Vec<TxId> = self.active.lock().keys().copied().collect();
        let mut strays = 0;
        for txid in ids {
            let Some(slot) = self.take_idle_slot(txid) else {
                continue;
            };
            strays += 1;
            tracing::warn!(txid, "rolling back stray transaction at shutdown");
            self.rollback_slot(ctx, slot).await;
        }
        self.pool.close();
        strays
    }

    fn recycle_conn(&self, txid: TxId, conn: PooledConn<C>) {
        let mut active = self.active.lock();
        match active.get_mut(&txid) {
            Some(slot) => {
                slot.conn = Some(conn);
                slot.last_used = Instant::now();
            }
            // The transaction ended while the conn was out; the pooled
            // connection just returns to the underlying pool.
            None => drop(conn),
        }
    }

    fn record_query(&self, txid: TxId, sql: &str) {
        if let Some(slot) = self.active.lock().get_mut(&txid) {
            slot.queries.push(sql.to_string());
        }
    }

    fn add_dirty(&self, txid: TxId, table: &str, key: &str) {
        if let Some(slot) = self.active.lock().get_mut(&txid) {
            slot.dirty
                .entry(table.to_string())
                .or_default()
                .insert(key.to_string());
        }
    }

    /// Statements recorded by a live transaction, for diagnostics.
    pub fn queries_of(&self, txid: TxId) -> Vec<String> {
        self.active
            .lock()
            .get(&txid)
            .map(|slot| slot.queries.clone())
            .unwrap_or_default()
    }

    /// Dirty keys accumulated by a live transaction.
    pub fn dirty_of(&self, txid: TxId) -> DirtyTables {
        self.active
            .lock()
            .get(&txid)
            .map(|slot| slot.dirty.clone())
            .unwrap_or_default()
    }

    /// Number of live transactions.
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Resizes the underlying connection pool.
    pub fn set_capacity(&self, capacity: usize) {
        self.pool.set_capacity(capacity);
    }

    /// Sets the idle timeout of the underlying connection pool.
    pub fn set_idle_timeout(&self, idle_timeout: Duration) {
        self.pool.set_idle_timeout(idle_timeout);
    }

    /// Reaps idle connections of the underlying pool.
    pub fn reap_idle_conns(&self) {
        self.pool.reap_idle();
    }

    /// Sets the transaction idle timeout enforced by [`reap`](Self::reap).
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    /// Sets how long [`begin`](Self::begin) waits for a free connection.
    pub fn set_pool_timeout(&self, pool_timeout: Duration) {
        *self.pool_timeout.lock() = pool_timeout;
    }
}

/// The pinned connection of one transaction, checked out by one executor.
/// Dropping it returns the connection to its transaction slot.
pub struct TxConn<'a, C: Connector> {
    pool: &'a TxPool<C>,
    txid: TxId,
    conn: Option<PooledConn<C>>,
}

impl<'a, C: Connector> TxConn<'a, C> {
    /// The owning transaction id.
    pub fn txid(&self) -> TxId {
        self.txid
    }

    /// Records a statement against the transaction for diagnostics.
    pub fn record_query(&self, sql: &str) {
        self.pool.record_query(self.txid, sql);
    }

    /// Returns the dirty-key append handle for a table.
    pub fn dirty_keys(&self, table: &str) -> DirtyKeys<'a, C> {
        DirtyKeys {
            pool: self.pool,
            txid: self.txid,
            table: table.to_string(),
        }
    }
}

impl<'a, C: Connector> ExecConn for TxConn<'a, C> {
    async fn exec(
        &mut self,
        ctx: &ReqContext,
        sql: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> std::result::Result<QueryResult, BackendError> {
        self.conn
            .as_mut()
            .expect("transaction connection present")
            .exec(ctx, sql, max_rows, want_fields)
            .await
    }
}

impl<'a, C: Connector> Drop for TxConn<'a, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.recycle_conn(self.txid, conn);
        }
    }
}

/// Append handle scheduling row-cache invalidations for one table at
/// commit time.
pub struct DirtyKeys<'a, C: Connector> {
    pool: &'a TxPool<C>,
    txid: TxId,
    table: String,
}

impl<'a, C: Connector> DirtyKeys<'a, C> {
    /// Schedules `key` for removal from the table's row cache when the
    /// transaction commits.
    pub fn delete(&self, key: &str) {
        self.pool.add_dirty(self.txid, &self.table, key);
    }
}
