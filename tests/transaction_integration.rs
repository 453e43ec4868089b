//! Transactional executor scenarios: pinned connections, dirty-key
//! invalidation, auto-commit wrapping, and DML chunking.

mod support;

use std::sync::Arc;
use std::time::Duration;

use support::*;
use tabserv::context::ReqContext;
use tabserv::engine::Config;
use tabserv::error::ErrorKind;
use tabserv::plan::{Plan, PlanId, PlanValue};
use tabserv::schema::CacheType;
use tabserv::sqlgen::{BindVars, ParsedQuery};
use tabserv::sqltypes::{Field, QueryResult, Value};

fn ctx() -> ReqContext {
    ReqContext::new(None)
}

fn autocommit_config() -> Config {
    Config {
        enable_auto_commit: true,
        ..Config::default()
    }
}

#[tokio::test]
async fn test_insert_pk_in_transaction_marks_dirty_and_commit_purges() {
    let tablet = tablet(Config::default());
    let insert_sql = format!(
        "insert into user(id, name) values (10, 'a'){}",
        stream_comment(&[10])
    );
    tablet.connector.script(insert_sql.clone(), dml_result(1));
    // A stale cached row for the inserted key.
    prime_cache(&tablet, 10, "stale").await;

    let ctx = ctx();
    let txid = tablet.engine.begin(&ctx).await.unwrap();
    let plan = insert_pk_plan(10);
    let result = tablet
        .engine
        .execute(&plan, BindVars::new(), Some(txid), &ctx)
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 1);

    // The key is dirty before commit and purged at commit.
    let dirty = tablet.engine.tx_pool().dirty_of(txid);
    assert!(dirty["user"].contains("10"));
    assert!(cache_has(&tablet, 10).await);

    tablet.engine.commit(&ctx, txid).await.unwrap();
    assert!(!cache_has(&tablet, 10).await);

    assert_eq!(
        tablet.connector.executed(),
        vec!["begin".to_string(), insert_sql, "commit".to_string()]
    );
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_autocommit_dml_commits_on_success() {
    let tablet = tablet(autocommit_config());
    tablet
        .connector
        .script(dml_batch_sql(&[5]), dml_result(1));
    prime_cache(&tablet, 5, "old").await;

    let plan = dml_pk_plan(&[5]);
    let result = tablet
        .engine
        .execute(&plan, BindVars::new(), None, &ctx())
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 1);
    assert_eq!(
        tablet.connector.executed(),
        vec![
            "begin".to_string(),
            dml_batch_sql(&[5]),
            "commit".to_string()
        ]
    );
    // Commit-time invalidation removed the stale row.
    assert!(!cache_has(&tablet, 5).await);
    assert_eq!(tablet.engine.tx_pool().active_count(), 0);
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_autocommit_dml_rolls_back_and_surfaces_original_error() {
    let tablet = tablet(autocommit_config());
    tablet
        .connector
        .script_error(dml_batch_sql(&[5]), "lock wait timeout");
    prime_cache(&tablet, 5, "old").await;

    let plan = dml_pk_plan(&[5]);
    let err = tablet
        .engine
        .execute(&plan, BindVars::new(), None, &ctx())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Fail);
    assert!(err.message.contains("lock wait timeout"));

    assert_eq!(
        tablet.connector.executed(),
        vec![
            "begin".to_string(),
            dml_batch_sql(&[5]),
            "rollback".to_string()
        ]
    );
    // Nothing committed, so nothing was invalidated.
    assert!(cache_has(&tablet, 5).await);
    assert_eq!(tablet.engine.tx_pool().active_count(), 0);
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_dml_chunking_by_max_dml_rows() {
    let tablet = tablet(Config {
        max_dml_rows: 2,
        ..Config::default()
    });
    tablet.connector.script(dml_batch_sql(&[1, 2]), dml_result(2));
    tablet.connector.script(dml_batch_sql(&[3, 4]), dml_result(2));
    tablet.connector.script(dml_batch_sql(&[5]), dml_result(1));

    let ctx = ctx();
    let txid = tablet.engine.begin(&ctx).await.unwrap();
    let plan = dml_pk_plan(&[1, 2, 3, 4, 5]);
    let result = tablet
        .engine
        .execute(&plan, BindVars::new(), Some(txid), &ctx)
        .await
        .unwrap();

    // ceil(5 / 2) batches, rows-affected summed across them.
    assert_eq!(result.rows_affected, 5);
    assert_eq!(tablet.connector.exec_count(&dml_batch_sql(&[1, 2])), 1);
    assert_eq!(tablet.connector.exec_count(&dml_batch_sql(&[3, 4])), 1);
    assert_eq!(tablet.connector.exec_count(&dml_batch_sql(&[5])), 1);

    // Every target key is dirty, not just the last batch.
    let dirty = tablet.engine.tx_pool().dirty_of(txid);
    for id in 1..=5 {
        assert!(dirty["user"].contains(&id.to_string()), "missing {}", id);
    }
    tablet.engine.rollback(&ctx, txid).await.unwrap();
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_strict_mode_rejects_pass_dml() {
    let tablet = tablet(Config::default());
    let ctx = ctx();
    let txid = tablet.engine.begin(&ctx).await.unwrap();

    let mut plan = Plan::new(PlanId::PassDml);
    plan.full_query = Some(ParsedQuery::new("update user set name = concat(name, '!')"));
    let err = tablet
        .engine
        .execute(&plan, BindVars::new(), Some(txid), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Fail);
    assert_eq!(err.message, "DML too complex");

    // With strict mode off the statement passes through on the pinned
    // connection.
    tablet.engine.set_strict_mode(false);
    tablet.connector.script(
        "update user set name = concat(name, '!')",
        dml_result(3),
    );
    let result = tablet
        .engine
        .execute(&plan, BindVars::new(), Some(txid), &ctx)
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 3);

    tablet.engine.rollback(&ctx, txid).await.unwrap();
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_select_in_transaction_uses_pinned_conn() {
    let tablet = tablet(Config::default());
    let sql = "select id, name from user where id = 1";
    tablet
        .connector
        .script(sql, user_result(vec![user_row(1, "a")]));

    let ctx = ctx();
    let txid = tablet.engine.begin(&ctx).await.unwrap();
    let plan = pass_select_plan(sql);
    let result = tablet
        .engine
        .execute(&plan, BindVars::new(), Some(txid), &ctx)
        .await
        .unwrap();
    assert_eq!(result.rows, vec![user_row(1, "a")]);

    // The statement is recorded against the transaction, and no pool
    // connection beyond the pinned one was used.
    assert_eq!(tablet.engine.tx_pool().queries_of(txid), vec![sql.to_string()]);
    assert_eq!(tablet.engine.conn_pool().in_use(), 0);

    tablet.engine.commit(&ctx, txid).await.unwrap();
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_insert_subquery_rebinds_rows() {
    let tablet = tablet(Config::default());
    let subquery_sql = "select id, name from staging";
    tablet.connector.script(
        subquery_sql,
        user_result(vec![user_row(21, "u"), user_row(22, "v")]),
    );
    let insert_sql = format!(
        "insert into user(id, name) values (21, 'u'), (22, 'v'){}",
        stream_comment(&[21, 22])
    );
    tablet.connector.script(insert_sql.clone(), dml_result(2));

    let ctx = ctx();
    let txid = tablet.engine.begin(&ctx).await.unwrap();
    let mut plan = Plan::new(PlanId::InsertSubquery);
    plan.table = Some(Arc::new(users_table(CacheType::ReadWrite)));
    plan.subquery = Some(ParsedQuery::new(subquery_sql));
    plan.column_numbers = vec![0, 1];
    plan.subquery_pk_columns = vec![Some(0)];
    plan.outer_query = Some(ParsedQuery::new("insert into user(id, name) values :#values"));
    plan.full_query = Some(ParsedQuery::new("insert into user(id, name) select ..."));

    let result = tablet
        .engine
        .execute(&plan, BindVars::new(), Some(txid), &ctx)
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 2);

    let dirty = tablet.engine.tx_pool().dirty_of(txid);
    assert!(dirty["user"].contains("21"));
    assert!(dirty["user"].contains("22"));
    tablet.engine.rollback(&ctx, txid).await.unwrap();
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_insert_subquery_empty_is_noop() {
    let tablet = tablet(Config::default());
    let subquery_sql = "select id, name from staging";
    tablet.connector.script(subquery_sql, user_result(vec![]));

    let ctx = ctx();
    let txid = tablet.engine.begin(&ctx).await.unwrap();
    let mut plan = Plan::new(PlanId::InsertSubquery);
    plan.table = Some(Arc::new(users_table(CacheType::ReadWrite)));
    plan.subquery = Some(ParsedQuery::new(subquery_sql));
    plan.column_numbers = vec![0, 1];
    plan.subquery_pk_columns = vec![Some(0)];
    plan.outer_query = Some(ParsedQuery::new("insert into user(id, name) values :#values"));

    let result = tablet
        .engine
        .execute(&plan, BindVars::new(), Some(txid), &ctx)
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 0);
    tablet.engine.rollback(&ctx, txid).await.unwrap();
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_dml_subquery_targets_inner_rows() {
    let tablet = tablet(Config::default());
    let subquery_sql = "select id from user where name = 'x' limit 10001";
    tablet.connector.script(
        subquery_sql,
        QueryResult {
            fields: vec![Field::new("id")],
            rows: vec![vec![Value::Int(3)], vec![Value::Int(4)]],
            rows_affected: 2,
            insert_id: 0,
        },
    );
    let update_sql = {
        // Single-column pk over inner rows 3 and 4.
        let predicate = "id in (3, 4)";
        format!(
            "update user set name = 'x' where {}{}",
            predicate,
            stream_comment(&[3, 4])
        )
    };
    tablet.connector.script(update_sql.clone(), dml_result(2));

    let ctx = ctx();
    let txid = tablet.engine.begin(&ctx).await.unwrap();
    let mut plan = dml_pk_plan(&[]);
    plan.plan_id = PlanId::DmlSubquery;
    plan.pk_values = Vec::new();
    plan.subquery = Some(ParsedQuery::new(
        "select id from user where name = 'x' limit :#maxLimit",
    ));

    let result = tablet
        .engine
        .execute(&plan, BindVars::new(), Some(txid), &ctx)
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 2);

    let dirty = tablet.engine.tx_pool().dirty_of(txid);
    assert!(dirty["user"].contains("3"));
    assert!(dirty["user"].contains("4"));
    tablet.engine.rollback(&ctx, txid).await.unwrap();
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_uncached_table_has_no_invalidator() {
    let tablet = tablet(Config::default());
    // Same statement shape, but against a table without a row cache.
    let mut plan = dml_pk_plan(&[5]);
    let mut table = users_table(CacheType::None);
    table.name = "user".into();
    plan.table = Some(Arc::new(table));
    tablet.connector.script(dml_batch_sql(&[5]), dml_result(1));

    let ctx = ctx();
    let txid = tablet.engine.begin(&ctx).await.unwrap();
    tablet
        .engine
        .execute(&plan, BindVars::new(), Some(txid), &ctx)
        .await
        .unwrap();
    assert!(tablet.engine.tx_pool().dirty_of(txid).is_empty());
    tablet.engine.rollback(&ctx, txid).await.unwrap();
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_tx_pool_saturation_returns_tx_pool_full() {
    let tablet = tablet(Config {
        tx_pool_size: 1,
        tx_pool_timeout: Duration::from_millis(20),
        ..Config::default()
    });
    let ctx = ctx();

    let txid = tablet.engine.begin(&ctx).await.unwrap();
    let err = tablet.engine.begin(&ctx).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::TxPoolFull);

    tablet.engine.rollback(&ctx, txid).await.unwrap();
    let _txid = tablet.engine.begin(&ctx).await.unwrap();
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_other_plan_in_transaction_passes_raw_statement() {
    let tablet = tablet(Config::default());
    let raw = "show create table user";
    tablet.connector.script(
        raw,
        QueryResult {
            fields: vec![Field::new("Table"), Field::new("Create Table")],
            rows: vec![vec![Value::Str("user".into()), Value::Str("...".into())]],
            rows_affected: 1,
            insert_id: 0,
        },
    );

    let ctx = ctx();
    let txid = tablet.engine.begin(&ctx).await.unwrap();
    let mut plan = Plan::new(PlanId::Other);
    plan.full_query = Some(ParsedQuery::new(raw));
    let result = tablet
        .engine
        .execute(&plan, BindVars::new(), Some(txid), &ctx)
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    tablet.engine.commit(&ctx, txid).await.unwrap();
    tablet.engine.close().await;
}

#[tokio::test]
async fn test_bound_pk_values_resolve_from_bind_vars() {
    let tablet = tablet(autocommit_config());
    tablet.connector.script(dml_batch_sql(&[42]), dml_result(1));

    let mut plan = dml_pk_plan(&[]);
    plan.pk_values = vec![PlanValue::BindVar("id".into())];
    let mut bind_vars = BindVars::new();
    bind_vars.insert(
        "id".into(),
        tabserv::sqlgen::BindValue::Value(Value::Int(42)),
    );

    let result = tablet
        .engine
        .execute(&plan, bind_vars, None, &ctx())
        .await
        .unwrap();
    assert_eq!(result.rows_affected, 1);
    tablet.engine.close().await;
}
