//! Backend connection traits.
//!
//! The executor talks to the backing database through these seams. The real
//! deployment plugs in a MySQL connection (wire protocol lives outside this
//! crate); [`MemoryBackend`] is the scripted in-process implementation used
//! by tests, in the same role the in-memory storage plays for the rest of
//! the stack.

mod memory;

pub use memory::{MemoryBackend, MemoryConnector};

use std::fmt;

use crate::context::ReqContext;
use crate::sqltypes::QueryResult;

/// Errors surfaced by a backend connection.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// The request context was cancelled mid-call.
    Canceled,
    /// The statement would return more rows than the caller allows.
    RowsExceeded {
        /// The row cap that was exceeded.
        max: usize,
    },
    /// The backend rejected or failed the statement.
    Execution(String),
    /// Establishing a connection failed.
    Connect(String),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Canceled => write!(f, "request canceled"),
            BackendError::RowsExceeded { max } => write!(f, "Row count exceeded {}", max),
            BackendError::Execution(msg) => write!(f, "{}", msg),
            BackendError::Connect(msg) => write!(f, "connect failed: {}", msg),
        }
    }
}

impl std::error::Error for BackendError {}

/// Callback receiving streamed result chunks.
pub type StreamSink<'a> =
    &'a mut (dyn FnMut(QueryResult) -> Result<(), BackendError> + Send);

/// One live backend connection.
///
/// Implementations must honor the request context: a cancelled context
/// aborts the in-flight call with [`BackendError::Canceled`].
pub trait BackendConn: Send + 'static {
    /// Executes a statement and materializes the result.
    ///
    /// `max_rows` caps the result size; exceeding it is an error, not a
    /// truncation. `want_fields` asks for column metadata in the result.
    fn exec(
        &mut self,
        ctx: &ReqContext,
        sql: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> impl Future<Output = Result<QueryResult, BackendError>> + Send;

    /// Executes a statement, delivering the result in chunks of roughly
    /// `buffer_size` bytes through `sink`. The first chunk carries field
    /// metadata only.
    fn stream(
        &mut self,
        ctx: &ReqContext,
        sql: &str,
        sink: StreamSink<'_>,
        buffer_size: usize,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Factory for backend connections; each pool owns one.
pub trait Connector: Send + Sync + 'static {
    /// The connection type this connector produces.
    type Conn: BackendConn;

    /// Opens a new backend connection.
    fn connect(&self) -> impl Future<Output = Result<Self::Conn, BackendError>> + Send;
}

/// Anything a statement can be executed through: a pooled connection or a
/// transaction-pinned one.
pub trait ExecConn: Send {
    /// Executes a statement, see [`BackendConn::exec`].
    fn exec(
        &mut self,
        ctx: &ReqContext,
        sql: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> impl Future<Output = Result<QueryResult, BackendError>> + Send;
}
