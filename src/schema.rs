//! Schema registry.
//!
//! Schema discovery happens outside this crate: an external service watches
//! the backend for DDL and pushes table definitions in through a loader
//! callback (or [`register_table`](SchemaInfo::register_table) directly).
//! The registry keeps the per-table row-cache adapters alive and receives
//! the executor's DDL notifications.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::context::ReqContext;
use crate::rowcache::{RowStore, TableCache};
use crate::sqltypes::Value;

/// Row-cache mode of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheType {
    /// Not cached.
    #[default]
    None,
    /// Cached; reads fill, committed writes invalidate.
    ReadWrite,
    /// Cached read-only (invalidation driven externally).
    ReadOnly,
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Default value, used when an INSERT-from-subquery omits the column.
    pub default: Value,
}

impl Column {
    /// Creates a column with a NULL default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: Value::Null,
        }
    }
}

/// A (possibly composite) index.
#[derive(Debug, Clone, PartialEq)]
pub struct Index {
    /// Index name; the primary key is index 0 and named `PRIMARY`.
    pub name: String,
    /// Column names in index order.
    pub columns: Vec<String>,
}

/// Schema entry for one table.
#[derive(Debug, Clone)]
pub struct Table {
    /// Table name.
    pub name: String,
    /// All columns, in schema order. Cached rows store every column in this
    /// order; projections index into it.
    pub columns: Vec<Column>,
    /// Indexes of the primary-key columns within `columns`.
    pub pk_columns: Vec<usize>,
    /// Indexes; `indexes[0]` is the primary key.
    pub indexes: Vec<Index>,
    /// Row-cache mode.
    pub cache_type: CacheType,
}

impl Table {
    /// Column names of the primary key.
    ///
    /// # Panics
    ///
    /// Panics if the table has no primary index; the planner never emits a
    /// decomposed plan for such a table.
    pub fn primary_index_columns(&self) -> &[String] {
        &self.indexes[0].columns
    }

    /// Whether rows of this table live in the row cache.
    pub fn is_cached(&self) -> bool {
        self.cache_type != CacheType::None
    }
}

/// Process-wide table registry plus row-cache adapters.
pub struct SchemaInfo<R> {
    tables: RwLock<HashMap<String, Arc<Table>>>,
    caches: RwLock<HashMap<String, Arc<TableCache<R>>>>,
    store: Arc<R>,
    loader: Box<dyn Fn(&str) -> Option<Table> + Send + Sync>,
    reload_time: Mutex<Duration>,
    query_cache_size: AtomicUsize,
}

impl<R: RowStore> SchemaInfo<R> {
    /// Creates a registry over the given row store, with no loader.
    pub fn new(store: Arc<R>) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            caches: RwLock::new(HashMap::new()),
            store,
            loader: Box::new(|_| None),
            reload_time: Mutex::new(Duration::from_secs(30 * 60)),
            query_cache_size: AtomicUsize::new(5000),
        }
    }

    /// Installs the loader the external discovery service registered.
    /// [`create_or_update_table`](Self::create_or_update_table) consults it
    /// for the fresh definition after a DDL.
    pub fn with_loader(
        mut self,
        loader: impl Fn(&str) -> Option<Table> + Send + Sync + 'static,
    ) -> Self {
        self.loader = Box::new(loader);
        self
    }

    /// Installs (or replaces) a table definition, creating its row-cache
    /// adapter when the table is cached.
    pub fn register_table(&self, table: Table) {
        let name = table.name.clone();
        if table.is_cached() {
            self.caches
                .write()
                .entry(name.clone())
                .or_insert_with(|| Arc::new(TableCache::new(name.clone(), self.store.clone())));
        } else {
            self.caches.write().remove(&name);
        }
        self.tables.write().insert(name, Arc::new(table));
    }

    /// Evicts a table after a drop or rename-away.
    pub fn drop_table(&self, name: &str) {
        self.tables.write().remove(name);
        self.caches.write().remove(name);
        tracing::info!(table = name, "dropped table from schema");
    }

    /// Refreshes a table definition after a create or alter.
    ///
    /// Consults the discovery loader; an unknown name is logged and ignored
    /// (discovery may simply not have caught up yet).
    pub async fn create_or_update_table(&self, _ctx: &ReqContext, name: &str) {
        match (self.loader)(name) {
            Some(table) => {
                self.register_table(table);
                tracing::info!(table = name, "refreshed table schema");
            }
            None => {
                tracing::warn!(table = name, "schema refresh found no definition");
            }
        }
    }

    /// Looks up a table definition.
    pub fn get_table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.read().get(name).cloned()
    }

    /// Looks up the row-cache adapter of a cached table.
    pub fn table_cache(&self, name: &str) -> Option<Arc<TableCache<R>>> {
        self.caches.read().get(name).cloned()
    }

    /// Names of all registered tables.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Sets the schema poll interval used by the discovery service.
    pub fn set_reload_time(&self, d: Duration) {
        *self.reload_time.lock() = d;
    }

    /// The schema poll interval.
    pub fn reload_time(&self) -> Duration {
        *self.reload_time.lock()
    }

    /// Sets the plan-cache size hint consumed by the planner.
    pub fn set_query_cache_size(&self, n: usize) {
        self.query_cache_size.store(n, Ordering::Relaxed);
    }

    /// The plan-cache size hint.
    pub fn query_cache_size(&self) -> usize {
        self.query_cache_size.load(Ordering::Relaxed)
    }
}
