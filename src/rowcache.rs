//! Primary-key row cache.
//!
//! The row cache is a key/value view of full table rows keyed by primary
//! key. Reads go through [`TableCache`], which namespaces keys per table and
//! keeps per-table hit counters; writes are optimistic (CAS-conditional) so
//! a racing invalidation always wins over a stale read-through fill.
//!
//! The store itself is pluggable: [`RowStore`] is the capability boundary,
//! and [`InMemoryRowStore`] is the in-process implementation used by tests
//! and single-node deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64_KEY;
use parking_lot::Mutex;

use crate::context::ReqContext;
use crate::sqltypes::{Row, Value};

/// One cache slot as observed by a read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    /// The cached row, or `None` for a miss.
    pub row: Option<Row>,
    /// Opaque version token for conditional replace; 0 for a miss.
    pub cas: u64,
}

/// Capability boundary over the backing key/value row store.
///
/// Store failures degrade silently: implementations log and return miss/no-op
/// rather than surfacing errors, because the cache is an accelerator, never
/// the source of truth.
pub trait RowStore: Send + Sync + 'static {
    /// Fetches the given keys in one batch. Missing keys map to a default
    /// (miss) entry.
    fn get_multi(
        &self,
        ctx: &ReqContext,
        keys: &[String],
    ) -> impl Future<Output = HashMap<String, CacheEntry>> + Send;

    /// Conditionally stores a row.
    ///
    /// `cas == 0` inserts only if the key is absent; a non-zero `cas`
    /// replaces only if the stored token still matches. Anything else is a
    /// silent no-op.
    fn set(
        &self,
        ctx: &ReqContext,
        key: &str,
        row: Row,
        cas: u64,
    ) -> impl Future<Output = ()> + Send;

    /// Unconditionally removes a key.
    fn delete(&self, key: &str) -> impl Future<Output = ()> + Send;
}

/// In-process row store with CAS semantics.
#[derive(Debug, Default)]
pub struct InMemoryRowStore {
    entries: Mutex<HashMap<String, (Row, u64)>>,
    next_cas: AtomicU64,
}

impl InMemoryRowStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_cas: AtomicU64::new(1),
        }
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true when the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn alloc_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed)
    }
}

impl RowStore for InMemoryRowStore {
    async fn get_multi(&self, _ctx: &ReqContext, keys: &[String]) -> HashMap<String, CacheEntry> {
        let entries = self.entries.lock();
        keys.iter()
            .map(|key| {
                let entry = match entries.get(key) {
                    Some((row, cas)) => CacheEntry {
                        row: Some(row.clone()),
                        cas: *cas,
                    },
                    None => CacheEntry::default(),
                };
                (key.clone(), entry)
            })
            .collect()
    }

    async fn set(&self, _ctx: &ReqContext, key: &str, row: Row, cas: u64) {
        let new_cas = self.alloc_cas();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            None if cas == 0 => {
                entries.insert(key.to_string(), (row, new_cas));
            }
            Some((_, current)) if cas != 0 && *current == cas => {
                entries.insert(key.to_string(), (row, new_cas));
            }
            _ => {}
        }
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Builds the cache key for a primary-key tuple.
///
/// Values are joined with `'.'`; strings are base64url encoded so the key
/// stays free of the separator and of control bytes. A NULL component makes
/// the row uncacheable and yields no key.
pub fn build_cache_key(pk: &[Value]) -> Option<String> {
    let mut key = String::new();
    for (i, v) in pk.iter().enumerate() {
        if i > 0 {
            key.push('.');
        }
        match v {
            Value::Null => return None,
            Value::Int(n) => key.push_str(&n.to_string()),
            Value::UInt(n) => key.push_str(&n.to_string()),
            Value::Float(n) => key.push_str(&n.to_string()),
            Value::Str(s) => key.push_str(&BASE64_KEY.encode(s.as_bytes())),
        }
    }
    Some(key)
}

/// Per-table view of the row store.
///
/// Keys are namespaced as `"<table>.<key>"`. Hit/absent/miss counters live
/// here so the stats exporter can report them per table.
#[derive(Debug)]
pub struct TableCache<R> {
    table: String,
    store: Arc<R>,
    /// Reads served from the cache.
    pub hits: AtomicU64,
    /// Reads for rows that exist nowhere (not in cache, not in backend).
    pub absent: AtomicU64,
    /// Reads that fell through to the backend.
    pub misses: AtomicU64,
    /// Keys purged by commit-time invalidation.
    pub invalidations: AtomicU64,
}

impl<R: RowStore> TableCache<R> {
    /// Creates a cache view for one table.
    pub fn new(table: impl Into<String>, store: Arc<R>) -> Self {
        Self {
            table: table.into(),
            store,
            hits: AtomicU64::new(0),
            absent: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// The table this view is bound to.
    pub fn table(&self) -> &str {
        &self.table
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}.{}", self.table, key)
    }

    /// Batched fetch; the returned map is keyed by the caller's keys.
    pub async fn get_multi(
        &self,
        ctx: &ReqContext,
        keys: &[String],
    ) -> HashMap<String, CacheEntry> {
        let namespaced: Vec<String> = keys.iter().map(|k| self.namespaced(k)).collect();
        let mut fetched = self.store.get_multi(ctx, &namespaced).await;
        keys.iter()
            .zip(namespaced.iter())
            .map(|(key, nk)| (key.clone(), fetched.remove(nk).unwrap_or_default()))
            .collect()
    }

    /// Conditional store of a full row, using the CAS token observed at the
    /// matching get.
    pub async fn set(&self, ctx: &ReqContext, key: &str, row: Row, cas: u64) {
        self.store.set(ctx, &self.namespaced(key), row, cas).await;
    }

    /// Unconditional removal, used by commit-time invalidation.
    pub async fn delete(&self, key: &str) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.store.delete(&self.namespaced(key)).await;
    }
}
