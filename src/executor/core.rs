//! The per-request executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::rowbuild::{apply_filter, apply_filter_with_pk_defaults, validate_row};
use crate::backend::{BackendConn, Connector, ExecConn, StreamSink};
use crate::context::ReqContext;
use crate::engine::{QueryEngine, SPOT_CHECK_MULTIPLIER};
use crate::error::{Error, Result};
use crate::plan::{
    Plan, PlanId, Reason, SetValue, build_secondary_list, build_value_list, get_limit,
};
use crate::pool::{ConnPool, PooledConn};
use crate::rowcache::{CacheEntry, RowStore, TableCache, build_cache_key};
use crate::rules::Action;
use crate::schema::Table;
use crate::sqlgen::{
    BIND_MAX_LIMIT, BIND_PK, BIND_VALUES, BindValue, BindVars, ParsedQuery, TupleEqualityList,
    build_stream_comment, restore_trailing,
};
use crate::sqltypes::{QueryResult, Row, Value, rows_equal};
use crate::stats::{LogStats, QueryEngineStats};
use crate::tx::{DirtyKeys, TxId};

/// Executes one request. Created per call by the engine; borrows the
/// engine's collaborators and owns the request's bind variables (which it
/// extends with internal binds).
pub struct QueryExecutor<'a, C: Connector, R: RowStore> {
    qe: &'a QueryEngine<C, R>,
    plan: &'a Plan,
    bind_vars: BindVars,
    tx_id: Option<TxId>,
    ctx: ReqContext,
    log: &'a mut LogStats,
}

impl<'a, C: Connector, R: RowStore> QueryExecutor<'a, C, R> {
    /// Creates an executor for one request.
    pub fn new(
        qe: &'a QueryEngine<C, R>,
        plan: &'a Plan,
        bind_vars: BindVars,
        tx_id: Option<TxId>,
        ctx: ReqContext,
        log: &'a mut LogStats,
    ) -> Self {
        Self {
            qe,
            plan,
            bind_vars,
            tx_id,
            ctx,
            log,
        }
    }

    /// Performs a non-streaming execution.
    pub async fn execute(&mut self) -> Result<QueryResult> {
        self.check_permissions()?;

        if self.plan.plan_id == PlanId::Ddl {
            return self.exec_ddl().await;
        }
        if let Some(txid) = self.tx_id {
            return self.exec_in_tx(txid, false).await;
        }

        let qe = self.qe;
        let plan = self.plan;
        match plan.plan_id {
            PlanId::PassSelect => {
                if plan.reason == Reason::Lock {
                    return Err(Error::fail("disallowed outside transaction"));
                }
                self.exec_select().await
            }
            PlanId::PkIn => self.exec_pk_in().await,
            PlanId::SelectSubquery => self.exec_subquery().await,
            PlanId::Set => self.exec_set().await,
            PlanId::Other => {
                let sql = query_text(plan).to_string();
                let mut conn = self.get_conn(qe.conn_pool()).await?;
                self.exec_checked(&mut conn, &sql, true).await
            }
            _ => {
                if !qe.enable_auto_commit() {
                    return Err(Error::fatal(format!(
                        "unsupported query: {}",
                        query_text(plan)
                    )));
                }
                self.exec_dml_auto_commit().await
            }
        }
    }

    /// Performs a streaming execution through the stream pool, registering
    /// the query for visibility and kill.
    pub async fn stream(&mut self, send: StreamSink<'_>) -> Result<()> {
        self.check_permissions()?;

        let qe = self.qe;
        let plan = self.plan;
        let query = full_query(plan)?;
        let sql = self.final_sql_own(query, None)?;
        let mut conn = self.get_conn(qe.stream_conn_pool()).await?;

        let id = qe
            .stream_queries()
            .add(sql.clone(), self.ctx.cancel_token().clone());
        self.log.add_rewritten(sql.clone());
        let buffer_size = qe.stream_buffer_size();
        let result = conn.stream(&self.ctx, &sql, send, buffer_size).await;
        qe.stream_queries().remove(id);

        result.map_err(|err| Error::fail(err.to_string()).with_sql(&sql))
    }

    fn check_permissions(&mut self) -> Result<()> {
        // Internal maintenance runs with an explicitly privileged context
        // and skips the gate.
        if self.ctx.privileged() {
            return Ok(());
        }
        let qe = self.qe;
        let plan = self.plan;
        let (addr, user) = match self.ctx.caller() {
            Some(caller) => (caller.remote_addr.clone(), caller.username.clone()),
            None => (String::new(), String::new()),
        };

        let (action, desc) = plan.rules.get_action(&addr, &user, &self.bind_vars);
        match action {
            Action::Fail => {
                return Err(Error::fail(format!("query disallowed due to rule: {}", desc)));
            }
            Action::FailRetry => {
                return Err(Error::retry(format!(
                    "query disallowed due to rule: {}",
                    desc
                )));
            }
            Action::Continue => {}
        }

        if let Some(acl) = &plan.authorized
            && !acl.is_member(&user)
        {
            let msg = format!(
                "table acl error: {:?} cannot run {} on table {:?}",
                user,
                plan.plan_id.as_str(),
                plan.table_name()
            );
            if qe.strict_table_acl() {
                return Err(Error::fail(msg));
            }
            qe.stats().add_internal_error("TableACLFailure");
            tracing::error!(user = %user, table = plan.table_name(), acl = %acl.name, "{}", msg);
        }
        Ok(())
    }

    async fn exec_ddl(&mut self) -> Result<QueryResult> {
        let qe = self.qe;
        let plan = self.plan;
        let ddl = plan
            .ddl
            .as_ref()
            .filter(|d| d.table_name.is_some() || d.new_name.is_some())
            .ok_or_else(|| Error::fail("DDL is not understood"))?;

        let txid = qe.tx_pool().begin(&self.ctx).await?;
        let sql = query_text(plan).to_string();
        let result = {
            let mut conn = qe.tx_pool().get(txid);
            self.exec_checked(&mut conn, &sql, false).await
        };
        // The backend commits DDL implicitly; a failed COMMIT here must not
        // mask the DDL outcome.
        qe.safe_commit(&self.ctx, txid).await;
        let result = result?;

        if let Some(table_name) = &ddl.table_name
            && ddl.new_name.as_deref() != Some(table_name.as_str())
        {
            qe.schema().drop_table(table_name);
        }
        if let Some(new_name) = &ddl.new_name {
            qe.schema().create_or_update_table(&self.ctx, new_name).await;
        }
        Ok(result)
    }

    async fn exec_in_tx(&mut self, txid: TxId, auto_commit: bool) -> Result<QueryResult> {
        let qe = self.qe;
        let plan = self.plan;
        let mut conn = qe.tx_pool().get(txid);
        let sql_text = query_text(plan).to_string();
        if !sql_text.is_empty() {
            conn.record_query(&sql_text);
        }
        let invalidator = match &plan.table {
            Some(table) if table.is_cached() => Some(conn.dirty_keys(&table.name)),
            _ => None,
        };

        match plan.plan_id {
            PlanId::PassDml => {
                if qe.strict_mode() {
                    return Err(Error::fail("DML too complex"));
                }
                let query = full_query(plan)?;
                let sql = self.final_sql_own(query, None)?;
                self.exec_checked(&mut conn, &sql, false).await
            }
            PlanId::InsertPk => self.exec_insert_pk(&mut conn, invalidator.as_ref()).await,
            PlanId::InsertSubquery => {
                self.exec_insert_subquery(&mut conn, invalidator.as_ref())
                    .await
            }
            PlanId::DmlPk => self.exec_dml_pk(&mut conn, invalidator.as_ref()).await,
            PlanId::DmlSubquery => {
                self.exec_dml_subquery(&mut conn, invalidator.as_ref())
                    .await
            }
            PlanId::Other if !auto_commit => self.exec_checked(&mut conn, &sql_text, true).await,
            // SELECT or SET inside a transaction.
            _ if !auto_commit => self.exec_direct(&mut conn).await,
            _ => Err(Error::fatal(format!("unsupported query: {}", sql_text))),
        }
    }

    async fn exec_dml_auto_commit(&mut self) -> Result<QueryResult> {
        let qe = self.qe;
        let txid = qe.tx_pool().begin(&self.ctx).await?;
        self.log.add_rewritten("begin");

        match self.exec_in_tx(txid, true).await {
            Ok(reply) => {
                qe.commit(&self.ctx, txid).await?;
                self.log.add_rewritten("commit");
                Ok(reply)
            }
            Err(err) => {
                // The rollback outcome is logged; the original error is
                // what the caller sees.
                if let Err(rollback_err) = qe.rollback(&self.ctx, txid).await {
                    tracing::warn!(txid, error = %rollback_err, "rollback failed after dml error");
                }
                self.log.add_rewritten("rollback");
                Err(err)
            }
        }
    }

    /// Always sends the statement to the backend, on the given connection.
    async fn exec_direct<E: ExecConn>(&mut self, conn: &mut E) -> Result<QueryResult> {
        let plan = self.plan;
        let query = full_query(plan)?;
        let sql = self.final_sql_own(query, None)?;
        match &plan.fields {
            Some(fields) => {
                let mut result = self.exec_checked(conn, &sql, false).await?;
                result.fields = fields.clone();
                Ok(result)
            }
            None => self.exec_checked(conn, &sql, true).await,
        }
    }

    /// Out-of-transaction SELECT: consolidated when the plan already knows
    /// its fields, otherwise a direct full fetch for field info.
    async fn exec_select(&mut self) -> Result<QueryResult> {
        let qe = self.qe;
        let plan = self.plan;
        let query = full_query(plan)?;
        match &plan.fields {
            Some(fields) => {
                let sql = self.final_sql_own(query, None)?;
                let mut result = self.consolidated_exec(sql).await?;
                result.fields = fields.clone();
                Ok(result)
            }
            None => {
                let sql = self.final_sql_own(query, None)?;
                let mut conn = self.get_conn(qe.conn_pool()).await?;
                self.exec_checked(&mut conn, &sql, true).await
            }
        }
    }

    async fn exec_pk_in(&mut self) -> Result<QueryResult> {
        let plan = self.plan;
        let pk_rows = build_value_list(&plan.pk_values, &self.bind_vars)?;
        let limit = get_limit(&plan.limit, &self.bind_vars)?;
        self.fetch_multi(pk_rows, limit).await
    }

    async fn exec_subquery(&mut self) -> Result<QueryResult> {
        let plan = self.plan;
        let query = subquery(plan)?;
        let sql = self.final_sql_own(query, None)?;
        let inner = self.consolidated_exec(sql).await?;
        self.fetch_multi(inner.rows, -1).await
    }

    /// Row-cache read-through for a list of target primary keys.
    async fn fetch_multi(&mut self, pk_rows: Vec<Row>, limit: i64) -> Result<QueryResult> {
        let qe = self.qe;
        let plan = self.plan;
        let fields = plan
            .fields
            .clone()
            .ok_or_else(|| Error::fatal("plan is missing field info"))?;
        let mut result = QueryResult {
            fields,
            ..QueryResult::default()
        };
        if pk_rows.is_empty() || limit == 0 {
            return Ok(result);
        }

        let table = plan
            .table
            .clone()
            .ok_or_else(|| Error::fatal("plan is missing table info"))?;
        let cache = qe
            .schema()
            .table_cache(&table.name)
            .ok_or_else(|| Error::fatal(format!("table {} has no row cache", table.name)))?;

        let keys: Vec<Option<String>> = pk_rows.iter().map(|pk| build_cache_key(pk)).collect();
        let present: Vec<String> = keys.iter().flatten().cloned().collect();
        let entries = cache.get_multi(&self.ctx, &present).await;

        // Full rows by cache key; assembled into input order at the end.
        let mut found: HashMap<String, Row> = HashMap::new();
        let mut missing: Vec<Row> = Vec::new();
        let mut hits = 0u64;
        for (pk, key) in pk_rows.iter().zip(keys.iter()) {
            let entry = key.as_ref().and_then(|k| entries.get(k));
            match entry {
                Some(entry) if entry.row.is_some() => {
                    let row = entry.row.clone().expect("hit entry has a row");
                    if self.must_verify() {
                        self.spot_check(&table, &cache, entry, &row, pk).await?;
                    }
                    found.insert(key.clone().expect("hit entry has a key"), row);
                    hits += 1;
                }
                _ => missing.push(pk.clone()),
            }
        }

        let mut misses = 0u64;
        let mut keyless: Vec<Row> = Vec::new();
        if !missing.is_empty() {
            let query = outer_query(plan)?;
            let mut bv = BindVars::new();
            bv.insert(
                BIND_PK.to_string(),
                BindValue::Tuples(TupleEqualityList {
                    columns: table.primary_index_columns().to_vec(),
                    rows: missing,
                }),
            );
            let sql = final_sql(query, &mut bv, None, qe.max_result_size())?;
            let from_db = self.consolidated_exec(sql).await?;
            misses = from_db.rows.len() as u64;
            for row in from_db.rows {
                let pk = apply_filter(&table.pk_columns, &row);
                match build_cache_key(&pk) {
                    Some(key) => {
                        let cas = entries.get(&key).map(|e| e.cas).unwrap_or(0);
                        cache.set(&self.ctx, &key, row.clone(), cas).await;
                        found.insert(key, row);
                    }
                    None => keyless.push(row),
                }
            }
        }
        let absent = (pk_rows.len() as u64).saturating_sub(hits + misses);

        let mut rows: Vec<Row> = Vec::with_capacity(pk_rows.len());
        for key in keys.iter().flatten() {
            if let Some(row) = found.remove(key) {
                rows.push(apply_filter(&plan.column_numbers, &row));
            }
        }
        for row in keyless {
            rows.push(apply_filter(&plan.column_numbers, &row));
        }

        self.log.cache_hits = hits;
        self.log.cache_misses = misses;
        self.log.cache_absent = absent;
        self.log.sources.rowcache = true;
        cache.hits.fetch_add(hits, Ordering::Relaxed);
        cache.misses.fetch_add(misses, Ordering::Relaxed);
        cache.absent.fetch_add(absent, Ordering::Relaxed);

        result.rows_affected = rows.len() as u64;
        result.rows = rows;
        // limit == 0 was handled upfront.
        if limit > 0 && result.rows.len() as i64 > limit {
            result.rows.truncate(limit as usize);
            result.rows_affected = limit as u64;
        }
        Ok(result)
    }

    fn must_verify(&self) -> bool {
        let freq = self.qe.spot_check_freq();
        freq > 0 && (rand::random::<u64>() % SPOT_CHECK_MULTIPLIER as u64) < freq as u64
    }

    /// Re-reads a cache hit from the backend. A disagreement schedules a
    /// delayed recheck; the delay absorbs invalidations racing with this
    /// read.
    async fn spot_check(
        &mut self,
        table: &Arc<Table>,
        cache: &Arc<TableCache<R>>,
        entry: &CacheEntry,
        cached_row: &Row,
        pk: &Row,
    ) -> Result<()> {
        let qe = self.qe;
        let plan = self.plan;
        qe.stats().spot_checks.fetch_add(1, Ordering::Relaxed);

        let query = outer_query(plan)?;
        let mut bv = BindVars::new();
        bv.insert(
            BIND_PK.to_string(),
            BindValue::Tuples(TupleEqualityList {
                columns: table.primary_index_columns().to_vec(),
                rows: vec![pk.clone()],
            }),
        );
        let sql = final_sql(query, &mut bv, None, qe.max_result_size())?;
        let from_db = self.consolidated_exec(sql).await?;
        let db_row = from_db.rows.into_iter().next();

        let agree = db_row
            .as_ref()
            .is_some_and(|row| rows_equal(cached_row, row));
        if !agree
            && let Some(key) = build_cache_key(pk)
        {
            qe.launch(recheck_later(
                cache.clone(),
                qe.stats().clone(),
                entry.clone(),
                db_row,
                pk.clone(),
                key,
                query_text(plan).to_string(),
                qe.recheck_delay(),
            ));
        }
        Ok(())
    }

    async fn exec_insert_pk<E: ExecConn>(
        &mut self,
        conn: &mut E,
        invalidator: Option<&DirtyKeys<'_, C>>,
    ) -> Result<QueryResult> {
        let plan = self.plan;
        let pk_rows = build_value_list(&plan.pk_values, &self.bind_vars)?;
        self.exec_insert_pk_rows(conn, pk_rows, invalidator).await
    }

    async fn exec_insert_subquery<E: ExecConn>(
        &mut self,
        conn: &mut E,
        invalidator: Option<&DirtyKeys<'_, C>>,
    ) -> Result<QueryResult> {
        let plan = self.plan;
        let query = subquery(plan)?;
        let sql = self.final_sql_own(query, None)?;
        let inner = self.exec_checked(conn, &sql, false).await?;
        if inner.rows.is_empty() {
            return Ok(QueryResult::default());
        }
        if plan.column_numbers.len() != inner.rows[0].len() {
            return Err(Error::fail("subquery length does not match column list"));
        }
        let table = table_info(plan)?;
        let pk_rows: Vec<Row> = inner
            .rows
            .iter()
            .map(|row| apply_filter_with_pk_defaults(&table, &plan.subquery_pk_columns, row))
            .collect();
        // Validating the first row is sufficient; all rows share the shape.
        validate_row(&pk_rows[0], table.pk_columns.len())?;

        self.bind_vars
            .insert(BIND_VALUES.to_string(), BindValue::Rows(inner.rows));
        self.exec_insert_pk_rows(conn, pk_rows, invalidator).await
    }

    async fn exec_insert_pk_rows<E: ExecConn>(
        &mut self,
        conn: &mut E,
        pk_rows: Vec<Row>,
        invalidator: Option<&DirtyKeys<'_, C>>,
    ) -> Result<QueryResult> {
        let plan = self.plan;
        let table = table_info(plan)?;
        let secondary =
            build_secondary_list(&pk_rows, &plan.secondary_pk_values, &self.bind_vars)?;
        let comment = build_stream_comment(
            &table.name,
            table.primary_index_columns(),
            &pk_rows,
            secondary.as_deref(),
        );
        let query = outer_query(plan)?;
        let sql = self.final_sql_own(query, Some(&comment))?;
        let result = self.exec_checked(conn, &sql, false).await?;

        if let Some(invalidator) = invalidator {
            for pk in &pk_rows {
                if let Some(key) = build_cache_key(pk) {
                    invalidator.delete(&key);
                }
            }
        }
        Ok(result)
    }

    async fn exec_dml_pk<E: ExecConn>(
        &mut self,
        conn: &mut E,
        invalidator: Option<&DirtyKeys<'_, C>>,
    ) -> Result<QueryResult> {
        let plan = self.plan;
        let pk_rows = build_value_list(&plan.pk_values, &self.bind_vars)?;
        self.exec_dml_pk_rows(conn, pk_rows, invalidator).await
    }

    async fn exec_dml_subquery<E: ExecConn>(
        &mut self,
        conn: &mut E,
        invalidator: Option<&DirtyKeys<'_, C>>,
    ) -> Result<QueryResult> {
        let plan = self.plan;
        let query = subquery(plan)?;
        let sql = self.final_sql_own(query, None)?;
        let inner = self.exec_checked(conn, &sql, false).await?;
        self.exec_dml_pk_rows(conn, inner.rows, invalidator).await
    }

    /// Runs a decomposed DML in batches of at most `max_dml_rows` target
    /// keys, then schedules invalidation for every touched key.
    async fn exec_dml_pk_rows<E: ExecConn>(
        &mut self,
        conn: &mut E,
        pk_rows: Vec<Row>,
        invalidator: Option<&DirtyKeys<'_, C>>,
    ) -> Result<QueryResult> {
        if pk_rows.is_empty() {
            return Ok(QueryResult::default());
        }
        let qe = self.qe;
        let plan = self.plan;
        let table = table_info(plan)?;
        let secondary =
            build_secondary_list(&pk_rows, &plan.secondary_pk_values, &self.bind_vars)?;

        let mut result = QueryResult::default();
        let batch_size = qe.max_dml_rows().max(1);
        let mut start = 0;
        while start < pk_rows.len() {
            let end = (start + batch_size).min(pk_rows.len());
            let batch = &pk_rows[start..end];
            let secondary_batch = secondary.as_ref().map(|rows| &rows[start..end]);
            let comment = build_stream_comment(
                &table.name,
                table.primary_index_columns(),
                batch,
                secondary_batch,
            );
            self.bind_vars.insert(
                BIND_PK.to_string(),
                BindValue::Tuples(TupleEqualityList {
                    columns: table.primary_index_columns().to_vec(),
                    rows: batch.to_vec(),
                }),
            );
            let query = outer_query(plan)?;
            let sql = self.final_sql_own(query, Some(&comment))?;
            let batch_result = self.exec_checked(conn, &sql, false).await?;
            // DMLs only report rows affected.
            result.rows_affected += batch_result.rows_affected;
            start = end;
        }

        if let Some(invalidator) = invalidator {
            for pk in &pk_rows {
                if let Some(key) = build_cache_key(pk) {
                    invalidator.delete(&key);
                }
            }
        }
        Ok(result)
    }

    async fn exec_set(&mut self) -> Result<QueryResult> {
        let qe = self.qe;
        let plan = self.plan;
        let key = plan.set_key.clone().unwrap_or_default();
        match key.as_str() {
            "vt_pool_size" => {
                let n = self.set_int_value(&key)?;
                qe.conn_pool().set_capacity(n as usize);
            }
            "vt_stream_pool_size" => {
                let n = self.set_int_value(&key)?;
                qe.stream_conn_pool().set_capacity(n as usize);
            }
            "vt_transaction_cap" => {
                let n = self.set_int_value(&key)?;
                qe.tx_pool().set_capacity(n as usize);
            }
            "vt_transaction_timeout" => {
                let d = self.set_duration_value()?;
                qe.tx_pool().set_timeout(d);
            }
            "vt_schema_reload_time" => {
                let d = self.set_duration_value()?;
                qe.schema().set_reload_time(d);
            }
            "vt_query_cache_size" => {
                let n = self.set_int_value(&key)?;
                qe.schema().set_query_cache_size(n as usize);
            }
            "vt_max_result_size" => {
                let n = self.set_int_value(&key)?;
                if n < 1 {
                    return Err(out_of_range(&key, n));
                }
                qe.set_max_result_size(n as usize);
            }
            "vt_max_dml_rows" => {
                let n = self.set_int_value(&key)?;
                if n < 1 {
                    return Err(out_of_range(&key, n));
                }
                qe.set_max_dml_rows(n as usize);
            }
            "vt_stream_buffer_size" => {
                let n = self.set_int_value(&key)?;
                if n < 1024 {
                    return Err(out_of_range(&key, n));
                }
                qe.set_stream_buffer_size(n as usize);
            }
            "vt_query_timeout" => {
                let d = self.set_duration_value()?;
                qe.set_query_timeout(d);
            }
            "vt_idle_timeout" => {
                let d = self.set_duration_value()?;
                qe.conn_pool().set_idle_timeout(d);
                qe.stream_conn_pool().set_idle_timeout(d);
                qe.tx_pool().set_idle_timeout(d);
            }
            "vt_spot_check_ratio" => {
                let ratio = self.set_float_value()?;
                qe.set_spot_check_ratio(ratio);
            }
            "vt_strict_mode" => {
                let n = self.set_int_value(&key)?;
                qe.set_strict_mode(n != 0);
            }
            "vt_txpool_timeout" => {
                let d = self.set_duration_value()?;
                qe.tx_pool().set_pool_timeout(d);
            }
            // Anything else goes to the backend session.
            _ => {
                let query = full_query(plan)?;
                let sql = self.final_sql_own(query, None)?;
                let mut conn = self.get_conn(qe.conn_pool()).await?;
                return self.exec_checked(&mut conn, &sql, false).await;
            }
        }
        Ok(QueryResult::default())
    }

    fn set_value(&self) -> Result<&SetValue> {
        self.plan
            .set_value
            .as_ref()
            .ok_or_else(|| Error::fail("expecting value"))
    }

    fn set_int_value(&self, name: &str) -> Result<i64> {
        let n = self.set_value()?.as_int()?;
        if n < 0 {
            return Err(out_of_range(name, n));
        }
        Ok(n)
    }

    fn set_float_value(&self) -> Result<f64> {
        self.set_value()?.as_float()
    }

    fn set_duration_value(&self) -> Result<Duration> {
        self.set_value()?.as_duration()
    }

    /// Runs a statement through the consolidator: the leader executes, the
    /// followers wait and share the outcome.
    async fn consolidated_exec(&mut self, sql: String) -> Result<QueryResult> {
        let qe = self.qe;
        let (call, created) = qe.consolidator().create(&sql);
        if created {
            let guard = qe.consolidator().leader_guard(sql.clone(), call);
            let outcome = self.leader_exec(&sql).await;
            guard.finish(outcome.clone());
            outcome
        } else {
            self.log.sources.consolidator = true;
            let start = Instant::now();
            let outcome = call.wait().await;
            qe.stats().record_consolidation(start.elapsed());
            outcome
        }
    }

    async fn leader_exec(&mut self, sql: &str) -> Result<QueryResult> {
        let qe = self.qe;
        let start = Instant::now();
        match qe.conn_pool().get(&self.ctx).await {
            Ok(mut conn) => {
                self.log.waiting_for_conn += start.elapsed();
                self.exec_checked(&mut conn, sql, false).await
            }
            Err(err) => Err(Error::fatal(err.to_string())),
        }
    }

    async fn get_conn(&mut self, pool: &ConnPool<C>) -> Result<PooledConn<C>> {
        let start = Instant::now();
        match pool.get(&self.ctx).await {
            Ok(conn) => {
                self.log.waiting_for_conn += start.elapsed();
                Ok(conn)
            }
            Err(err) => Err(Error::fatal(err.to_string())),
        }
    }

    /// Sends one statement to the backend and classifies failures.
    async fn exec_checked<E: ExecConn>(
        &mut self,
        conn: &mut E,
        sql: &str,
        _want_fields: bool,
    ) -> Result<QueryResult> {
        self.log.add_rewritten(sql);
        let max_rows = self.qe.max_result_size();
        // Field info is always requested on this path, regardless of what
        // the caller asked for.
        conn.exec(&self.ctx, sql, max_rows, true)
            .await
            .map_err(|err| Error::fail(err.to_string()).with_sql(sql))
    }

    fn final_sql_own(&mut self, query: &ParsedQuery, comment: Option<&str>) -> Result<String> {
        let max_result_size = self.qe.max_result_size();
        final_sql(query, &mut self.bind_vars, comment, max_result_size)
    }
}

/// Substitutes binds, injects the implicit row limit, appends the stream
/// comment and restores any stripped trailing token.
fn final_sql(
    query: &ParsedQuery,
    bind_vars: &mut BindVars,
    comment: Option<&str>,
    max_result_size: usize,
) -> Result<String> {
    bind_vars.insert(
        BIND_MAX_LIMIT.to_string(),
        BindValue::Value(Value::Int(max_result_size as i64 + 1)),
    );
    let mut sql = query.generate_query(bind_vars)?;
    if let Some(comment) = comment {
        sql.push_str(comment);
    }
    Ok(restore_trailing(sql, bind_vars))
}

/// Delayed second look at a spot-check mismatch. If the cache entry moved
/// or vanished in the meantime, an invalidation raced the read and there is
/// nothing to report; otherwise the disagreement is real.
#[allow(clippy::too_many_arguments)]
async fn recheck_later<R: RowStore>(
    cache: Arc<TableCache<R>>,
    stats: Arc<QueryEngineStats>,
    entry: CacheEntry,
    db_row: Option<Row>,
    pk: Row,
    key: String,
    query: String,
    delay: Duration,
) {
    tokio::time::sleep(delay).await;
    let ctx = ReqContext::internal();
    let reloaded = cache
        .get_multi(&ctx, std::slice::from_ref(&key))
        .await
        .remove(&key)
        .unwrap_or_default();
    if reloaded.row.is_none() || reloaded.cas != entry.cas {
        return;
    }
    tracing::warn!(query = %query, "row cache mismatch");
    tracing::warn!(pk = ?pk, cache_row = ?entry.row, db_row = ?db_row, "row cache and database disagree");
    stats.add_internal_error("Mismatch");
}

fn out_of_range(name: &str, value: i64) -> Error {
    Error::fail(format!("{} out of range {}", name, value))
}

fn query_text(plan: &Plan) -> &str {
    plan.full_query.as_ref().map(|q| q.text()).unwrap_or("")
}

fn full_query(plan: &Plan) -> Result<&ParsedQuery> {
    plan.full_query
        .as_ref()
        .ok_or_else(|| Error::fatal("plan is missing the full query"))
}

fn outer_query(plan: &Plan) -> Result<&ParsedQuery> {
    plan.outer_query
        .as_ref()
        .ok_or_else(|| Error::fatal("plan is missing the outer query"))
}

fn subquery(plan: &Plan) -> Result<&ParsedQuery> {
    plan.subquery
        .as_ref()
        .ok_or_else(|| Error::fatal("plan is missing the subquery"))
}

fn table_info(plan: &Plan) -> Result<Arc<Table>> {
    plan.table
        .clone()
        .ok_or_else(|| Error::fatal("plan is missing table info"))
}
