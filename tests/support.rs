//! Shared fixtures for the integration suites: a tablet engine over the
//! scripted memory backend and the in-memory row store, plus plan builders
//! for the common shapes.

#![allow(dead_code)]

use std::sync::Arc;

use tabserv::backend::MemoryConnector;
use tabserv::context::ReqContext;
use tabserv::engine::{Config, QueryEngine};
use tabserv::plan::{Plan, PlanId, PlanValue};
use tabserv::rowcache::InMemoryRowStore;
use tabserv::schema::{CacheType, Column, Index, SchemaInfo, Table};
use tabserv::sqlgen::ParsedQuery;
use tabserv::sqltypes::{Field, QueryResult, Row, Value};

/// One tablet under test.
pub struct TestTablet {
    pub engine: Arc<QueryEngine<MemoryConnector, InMemoryRowStore>>,
    pub connector: MemoryConnector,
    pub store: Arc<InMemoryRowStore>,
}

/// The `user` table: `(id bigint primary key, name varchar)`.
pub fn users_table(cache_type: CacheType) -> Table {
    Table {
        name: "user".into(),
        columns: vec![Column::new("id"), Column::new("name")],
        pk_columns: vec![0],
        indexes: vec![Index {
            name: "PRIMARY".into(),
            columns: vec!["id".into()],
        }],
        cache_type,
    }
}

/// Installs a compact subscriber so `--nocapture` runs show the query log.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Builds a tablet with the `user` table registered (cached) and a loader
/// that can materialize any table name on demand after DDL.
pub fn tablet(config: Config) -> TestTablet {
    init_tracing();
    let connector = MemoryConnector::new();
    let store = Arc::new(InMemoryRowStore::new());
    let schema = SchemaInfo::new(store.clone()).with_loader(|name| {
        let mut table = users_table(CacheType::None);
        table.name = name.to_string();
        Some(table)
    });
    schema.register_table(users_table(CacheType::ReadWrite));
    let engine = QueryEngine::new(connector.clone(), schema, config);
    TestTablet {
        engine,
        connector,
        store,
    }
}

/// A full `user` row.
pub fn user_row(id: i64, name: &str) -> Row {
    vec![Value::Int(id), Value::Str(name.into())]
}

/// A result with `id`/`name` fields and the given rows.
pub fn user_result(rows: Vec<Row>) -> QueryResult {
    QueryResult {
        fields: vec![Field::new("id"), Field::new("name")],
        rows_affected: rows.len() as u64,
        rows,
        insert_id: 0,
    }
}

/// A result with only a rows-affected count (DML reply).
pub fn dml_result(rows_affected: u64) -> QueryResult {
    QueryResult {
        rows_affected,
        ..QueryResult::default()
    }
}

/// Primes the `user` row cache with a row keyed by its id.
pub async fn prime_cache(tablet: &TestTablet, id: i64, name: &str) {
    let cache = tablet.engine.schema().table_cache("user").unwrap();
    let ctx = ReqContext::internal();
    cache
        .set(&ctx, &id.to_string(), user_row(id, name), 0)
        .await;
}

/// Whether the `user` cache currently holds a row for `id`.
pub async fn cache_has(tablet: &TestTablet, id: i64) -> bool {
    let cache = tablet.engine.schema().table_cache("user").unwrap();
    let ctx = ReqContext::internal();
    let key = id.to_string();
    cache.get_multi(&ctx, std::slice::from_ref(&key)).await[&key]
        .row
        .is_some()
}

/// A `PK_IN` plan over `user` targeting the given ids.
pub fn pk_in_plan(ids: &[i64]) -> Plan {
    let mut plan = Plan::new(PlanId::PkIn);
    plan.table = Some(Arc::new(users_table(CacheType::ReadWrite)));
    plan.fields = Some(vec![Field::new("id"), Field::new("name")]);
    plan.column_numbers = vec![0, 1];
    plan.pk_values = vec![PlanValue::List(
        ids.iter().map(|&id| PlanValue::Const(Value::Int(id))).collect(),
    )];
    plan.outer_query = Some(ParsedQuery::new("select id, name from user where :#pk"));
    plan.full_query = Some(ParsedQuery::new("select id, name from user where id in (...)"));
    plan
}

/// The backend SQL the read-through issues for the given missing ids.
pub fn pk_in_sql(ids: &[i64]) -> String {
    if ids.len() == 1 {
        format!("select id, name from user where id in ({})", ids[0])
    } else {
        let list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("select id, name from user where id in ({})", list)
    }
}

/// The audit stream comment for integer primary keys of `user`.
pub fn stream_comment(ids: &[i64]) -> String {
    let rows: String = ids.iter().map(|id| format!(" ({} )", id)).collect();
    format!(" /* _stream user (id ){}; */", rows)
}

/// A `DML_PK` plan over `user` targeting the given ids.
pub fn dml_pk_plan(ids: &[i64]) -> Plan {
    let mut plan = Plan::new(PlanId::DmlPk);
    plan.table = Some(Arc::new(users_table(CacheType::ReadWrite)));
    plan.pk_values = vec![PlanValue::List(
        ids.iter().map(|&id| PlanValue::Const(Value::Int(id))).collect(),
    )];
    plan.outer_query = Some(ParsedQuery::new("update user set name = 'x' where :#pk"));
    plan.full_query = Some(ParsedQuery::new("update user set name = 'x' where id in (...)"));
    plan
}

/// The backend SQL one DML batch produces, audit comment included.
pub fn dml_batch_sql(ids: &[i64]) -> String {
    let predicate = if ids.len() == 1 {
        format!("id in ({})", ids[0])
    } else {
        let list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("id in ({})", list)
    };
    format!(
        "update user set name = 'x' where {}{}",
        predicate,
        stream_comment(ids)
    )
}

/// An `INSERT_PK` plan inserting one row with the given id.
pub fn insert_pk_plan(id: i64) -> Plan {
    let mut plan = Plan::new(PlanId::InsertPk);
    plan.table = Some(Arc::new(users_table(CacheType::ReadWrite)));
    plan.pk_values = vec![PlanValue::Const(Value::Int(id))];
    plan.outer_query = Some(ParsedQuery::new(format!(
        "insert into user(id, name) values ({}, 'a')",
        id
    )));
    plan.full_query = plan.outer_query.clone();
    plan
}

/// A `PASS_SELECT` plan with known fields for the given statement.
pub fn pass_select_plan(sql: &str) -> Plan {
    let mut plan = Plan::new(PlanId::PassSelect);
    plan.fields = Some(vec![Field::new("id"), Field::new("name")]);
    plan.full_query = Some(ParsedQuery::new(sql));
    plan
}
