//! Scripted in-memory backend.
//!
//! Tests program expected statements with their results (or errors) and
//! inspect the executed log afterwards. Statement lookup is by exact final
//! SQL string, so tests also verify the generated SQL byte for byte.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use super::{BackendConn, BackendError, Connector, StreamSink};
use crate::context::ReqContext;
use crate::sqltypes::{QueryResult, Value};

#[derive(Debug, Clone)]
enum Outcome {
    Result(QueryResult),
    Error(String),
}

#[derive(Default)]
struct State {
    scripts: Mutex<HashMap<String, Outcome>>,
    executed: Mutex<Vec<String>>,
    exec_delay: Mutex<Option<Duration>>,
    connect_error: Mutex<Option<String>>,
}

/// Shared handle scripting and observing the backend. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<State>,
    connects: Arc<AtomicUsize>,
}

impl MemoryConnector {
    /// Creates a connector with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs the result returned for an exact SQL string.
    pub fn script(&self, sql: impl Into<String>, result: QueryResult) {
        self.state
            .scripts
            .lock()
            .insert(sql.into(), Outcome::Result(result));
    }

    /// Programs an execution error for an exact SQL string.
    pub fn script_error(&self, sql: impl Into<String>, message: impl Into<String>) {
        self.state
            .scripts
            .lock()
            .insert(sql.into(), Outcome::Error(message.into()));
    }

    /// Delays every exec by `delay` (for concurrency tests).
    pub fn set_exec_delay(&self, delay: Option<Duration>) {
        *self.state.exec_delay.lock() = delay;
    }

    /// Makes subsequent connection attempts fail.
    pub fn set_connect_error(&self, message: Option<String>) {
        *self.state.connect_error.lock() = message;
    }

    /// All executed statements, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    /// How many times an exact statement was executed.
    pub fn exec_count(&self, sql: &str) -> usize {
        self.state
            .executed
            .lock()
            .iter()
            .filter(|s| s.as_str() == sql)
            .count()
    }

    /// Clears the executed log (scripts stay).
    pub fn clear_log(&self) {
        self.state.executed.lock().clear();
    }

    /// Number of connections opened so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

impl Connector for MemoryConnector {
    type Conn = MemoryBackend;

    async fn connect(&self) -> Result<MemoryBackend, BackendError> {
        if let Some(msg) = self.state.connect_error.lock().clone() {
            return Err(BackendError::Connect(msg));
        }
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryBackend {
            state: self.state.clone(),
        })
    }
}

/// One scripted backend connection.
pub struct MemoryBackend {
    state: Arc<State>,
}

impl MemoryBackend {
    async fn run(&self, ctx: &ReqContext, sql: &str) -> Result<QueryResult, BackendError> {
        if ctx.is_cancelled() {
            return Err(BackendError::Canceled);
        }
        let delay = *self.state.exec_delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancelled() => return Err(BackendError::Canceled),
            }
        }
        self.state.executed.lock().push(sql.to_string());
        let scripted = self.state.scripts.lock().get(sql).cloned();
        match scripted {
            Some(Outcome::Result(result)) => Ok(result),
            Some(Outcome::Error(msg)) => Err(BackendError::Execution(msg)),
            None => {
                let head = sql.trim().to_ascii_lowercase();
                if head == "begin" || head == "commit" || head == "rollback" {
                    Ok(QueryResult::default())
                } else {
                    Err(BackendError::Execution(format!("unexpected query: {}", sql)))
                }
            }
        }
    }
}

impl BackendConn for MemoryBackend {
    async fn exec(
        &mut self,
        ctx: &ReqContext,
        sql: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, BackendError> {
        let mut result = self.run(ctx, sql).await?;
        if result.rows.len() > max_rows {
            return Err(BackendError::RowsExceeded { max: max_rows });
        }
        if !want_fields {
            result.fields.clear();
        }
        Ok(result)
    }

    async fn stream(
        &mut self,
        ctx: &ReqContext,
        sql: &str,
        sink: StreamSink<'_>,
        buffer_size: usize,
    ) -> Result<(), BackendError> {
        let result = self.run(ctx, sql).await?;

        // Field packet first, then row batches of roughly buffer_size bytes.
        sink(QueryResult {
            fields: result.fields.clone(),
            ..QueryResult::default()
        })?;

        let mut batch = QueryResult::default();
        let mut batch_bytes = 0usize;
        for row in result.rows {
            batch_bytes += row_bytes(&row);
            batch.rows.push(row);
            if batch_bytes >= buffer_size {
                sink(std::mem::take(&mut batch))?;
                batch_bytes = 0;
            }
        }
        if !batch.rows.is_empty() {
            sink(batch)?;
        }
        Ok(())
    }
}

fn row_bytes(row: &[Value]) -> usize {
    row.iter().map(|v| v.to_text().len() + 8).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqltypes::Field;

    fn result_with_rows(n: i64) -> QueryResult {
        QueryResult {
            fields: vec![Field::new("id")],
            rows: (0..n).map(|i| vec![Value::Int(i)]).collect(),
            rows_affected: n as u64,
            insert_id: 0,
        }
    }

    #[tokio::test]
    async fn test_scripted_result_and_log() {
        let connector = MemoryConnector::new();
        connector.script("select 1", result_with_rows(1));
        let mut conn = connector.connect().await.unwrap();
        let ctx = ReqContext::internal();

        let result = conn.exec(&ctx, "select 1", 100, true).await.unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(connector.executed(), vec!["select 1".to_string()]);
        assert_eq!(connector.exec_count("select 1"), 1);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_unscripted_query_fails() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect().await.unwrap();
        let ctx = ReqContext::internal();

        let err = conn.exec(&ctx, "select 2", 100, true).await.unwrap_err();
        assert!(matches!(err, BackendError::Execution(_)));
    }

    #[tokio::test]
    async fn test_transaction_statements_default_ok() {
        let connector = MemoryConnector::new();
        let mut conn = connector.connect().await.unwrap();
        let ctx = ReqContext::internal();

        for sql in ["begin", "commit", "rollback"] {
            let result = conn.exec(&ctx, sql, 1, false).await.unwrap();
            assert_eq!(result, QueryResult::default());
        }
    }

    #[tokio::test]
    async fn test_max_rows_enforced() {
        let connector = MemoryConnector::new();
        connector.script("select many", result_with_rows(5));
        let mut conn = connector.connect().await.unwrap();
        let ctx = ReqContext::internal();

        let err = conn.exec(&ctx, "select many", 4, true).await.unwrap_err();
        assert_eq!(err, BackendError::RowsExceeded { max: 4 });
    }

    #[tokio::test]
    async fn test_want_fields_false_strips_fields() {
        let connector = MemoryConnector::new();
        connector.script("select 1", result_with_rows(1));
        let mut conn = connector.connect().await.unwrap();
        let ctx = ReqContext::internal();

        let result = conn.exec(&ctx, "select 1", 100, false).await.unwrap();
        assert!(result.fields.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_context() {
        let connector = MemoryConnector::new();
        connector.script("select 1", result_with_rows(1));
        let mut conn = connector.connect().await.unwrap();
        let ctx = ReqContext::internal();
        ctx.cancel();

        let err = conn.exec(&ctx, "select 1", 100, true).await.unwrap_err();
        assert_eq!(err, BackendError::Canceled);
    }

    #[tokio::test]
    async fn test_connect_error() {
        let connector = MemoryConnector::new();
        connector.set_connect_error(Some("backend down".into()));
        assert!(matches!(
            connector.connect().await,
            Err(BackendError::Connect(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_chunks() {
        let connector = MemoryConnector::new();
        connector.script("select all", result_with_rows(10));
        let mut conn = connector.connect().await.unwrap();
        let ctx = ReqContext::internal();

        let mut chunks: Vec<QueryResult> = Vec::new();
        let mut sink = |chunk: QueryResult| {
            chunks.push(chunk);
            Ok(())
        };
        // A tiny buffer forces one row per chunk.
        conn.stream(&ctx, "select all", &mut sink, 1).await.unwrap();

        assert!(chunks[0].rows.is_empty());
        assert_eq!(chunks[0].fields.len(), 1);
        let total: usize = chunks.iter().map(|c| c.rows.len()).sum();
        assert_eq!(total, 10);
    }
}
