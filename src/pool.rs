//! Bounded backend connection pool.
//!
//! The pool hands out live backend connections up to a capacity, blocks
//! further requests until a connection frees up (or the request context is
//! cancelled), and lazily reopens connections that the idle reaper closed.
//!
//! # Thread Safety
//!
//! All mutable state sits behind one mutex; waiters park on a
//! `tokio::sync::Notify`. The mutex is never held across an await point.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backend::{BackendConn, BackendError, Connector, ExecConn};
use crate::context::ReqContext;
use crate::sqltypes::QueryResult;

/// Errors from pool acquisition.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolError {
    /// The pool has been shut down.
    Closed,
    /// The request context was cancelled while waiting for a connection.
    Timeout,
    /// Opening a new backend connection failed.
    Connect(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Closed => write!(f, "connection pool is closed"),
            PoolError::Timeout => write!(f, "timed out waiting for connection"),
            PoolError::Connect(msg) => write!(f, "connection failed: {}", msg),
        }
    }
}

impl std::error::Error for PoolError {}

struct IdleConn<T> {
    conn: T,
    since: Instant,
}

struct PoolState<T> {
    idle: Vec<IdleConn<T>>,
    capacity: usize,
    in_use: usize,
    closed: bool,
    idle_timeout: Duration,
}

struct PoolInner<C: Connector> {
    connector: C,
    state: Mutex<PoolState<C::Conn>>,
    available: Notify,
}

/// Bounded pool of backend connections.
///
/// Cloning shares the pool; all clones see the same connections and
/// capacity.
pub struct ConnPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> ConnPool<C> {
    /// Creates a pool that opens connections through `connector` on demand,
    /// up to `capacity` concurrently live connections.
    pub fn new(connector: C, capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    capacity,
                    in_use: 0,
                    closed: false,
                    idle_timeout,
                }),
                available: Notify::new(),
            }),
        }
    }

    /// Acquires a connection, waiting until one frees up.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Closed`] once the pool is shut down.
    /// - [`PoolError::Timeout`] if `ctx` is cancelled while waiting.
    /// - [`PoolError::Connect`] if opening a fresh connection fails (the
    ///   capacity slot is released again).
    pub async fn get(&self, ctx: &ReqContext) -> Result<PooledConn<C>, PoolError> {
        loop {
            // Arm the waiter before inspecting state so a release between
            // the check and the await is not lost.
            let notified = self.inner.available.notified();

            let open_new = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if let Some(idle) = state.idle.pop() {
                    state.in_use += 1;
                    return Ok(PooledConn {
                        conn: Some(idle.conn),
                        pool: self.inner.clone(),
                    });
                }
                if state.in_use < state.capacity {
                    state.in_use += 1;
                    true
                } else {
                    false
                }
            };

            if open_new {
                return match self.inner.connector.connect().await {
                    Ok(conn) => Ok(PooledConn {
                        conn: Some(conn),
                        pool: self.inner.clone(),
                    }),
                    Err(err) => {
                        self.inner.release_slot();
                        Err(PoolError::Connect(err.to_string()))
                    }
                };
            }

            tokio::select! {
                _ = notified => {}
                _ = ctx.cancelled() => return Err(PoolError::Timeout),
            }
        }
    }

    /// Resizes the pool. Surplus idle connections are dropped immediately;
    /// surplus in-use connections are dropped as they come back.
    pub fn set_capacity(&self, capacity: usize) {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.capacity = capacity;
            let mut dropped = Vec::new();
            while state.in_use + state.idle.len() > capacity {
                match state.idle.pop() {
                    Some(idle) => dropped.push(idle),
                    None => break,
                }
            }
            dropped
        };
        drop(dropped);
        // Capacity may have grown.
        self.inner.available.notify_waiters();
    }

    /// Sets how long a connection may sit idle before the reaper closes it.
    pub fn set_idle_timeout(&self, idle_timeout: Duration) {
        self.inner.state.lock().idle_timeout = idle_timeout;
    }

    /// Closes connections idle longer than the idle timeout. Called
    /// periodically by the engine's maintenance task.
    pub fn reap_idle(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            let timeout = state.idle_timeout;
            let now = Instant::now();
            let mut dropped = Vec::new();
            let mut i = 0;
            while i < state.idle.len() {
                if now.duration_since(state.idle[i].since) >= timeout {
                    dropped.push(state.idle.swap_remove(i));
                } else {
                    i += 1;
                }
            }
            dropped
        };
        drop(dropped);
    }

    /// Shuts the pool down: drops idle connections and fails current and
    /// future acquires with [`PoolError::Closed`].
    pub fn close(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        drop(dropped);
        self.inner.available.notify_waiters();
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.inner.state.lock().capacity
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.state.lock().in_use
    }

    /// Connections currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }
}

impl<C: Connector> PoolInner<C> {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn put(&self, conn: C::Conn) {
        let dropped = {
            let mut state = self.state.lock();
            state.in_use = state.in_use.saturating_sub(1);
            if state.closed || state.in_use + state.idle.len() >= state.capacity {
                Some(conn)
            } else {
                state.idle.push(IdleConn {
                    conn,
                    since: Instant::now(),
                });
                None
            }
        };
        drop(dropped);
        self.available.notify_one();
    }
}

/// A checked-out connection. Dropping it returns the connection to the
/// pool, so every exit path recycles.
pub struct PooledConn<C: Connector> {
    conn: Option<C::Conn>,
    pool: Arc<PoolInner<C>>,
}

impl<C: Connector> PooledConn<C> {
    /// Drops the underlying connection instead of recycling it (broken
    /// connection). The pool reopens on demand.
    pub fn discard(mut self) {
        self.conn = None;
        self.pool.release_slot();
    }
}

impl<C: Connector> std::fmt::Debug for PooledConn<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("conn", &self.conn.is_some())
            .finish()
    }
}

impl<C: Connector> Deref for PooledConn<C> {
    type Target = C::Conn;

    fn deref(&self) -> &C::Conn {
        self.conn.as_ref().expect("connection already taken")
    }
}

impl<C: Connector> DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut C::Conn {
        self.conn.as_mut().expect("connection already taken")
    }
}

impl<C: Connector> Drop for PooledConn<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(conn);
        }
    }
}

impl<C: Connector> ExecConn for PooledConn<C> {
    async fn exec(
        &mut self,
        ctx: &ReqContext,
        sql: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, BackendError> {
        self.deref_mut().exec(ctx, sql, max_rows, want_fields).await
    }
}
