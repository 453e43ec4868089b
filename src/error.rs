//! Tablet error classification.
//!
//! Every failure that crosses the executor boundary carries one of four
//! kinds, which the serving layer maps onto client-visible retry semantics.

use std::fmt;

/// How a failed request should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Request rejected; resending the same request will fail again.
    Fail,
    /// Transient failure; safe to resend.
    Retry,
    /// Infrastructure failure (pool closed, connection acquire error,
    /// unknown plan shape).
    Fatal,
    /// Transaction pool capacity exhausted within the acquire timeout.
    TxPoolFull,
}

impl ErrorKind {
    fn prefix(self) -> &'static str {
        match self {
            ErrorKind::Fail => "",
            ErrorKind::Retry => "retry: ",
            ErrorKind::Fatal => "fatal: ",
            ErrorKind::TxPoolFull => "tx pool full: ",
        }
    }
}

/// A classified tablet error, optionally carrying the offending SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    /// Retry classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// The SQL statement that triggered the failure, when known.
    pub sql: Option<String>,
}

impl Error {
    /// Creates an error with the given kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            sql: None,
        }
    }

    /// A terminal request rejection.
    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fail, message)
    }

    /// A transient failure the client may retry.
    pub fn retry(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retry, message)
    }

    /// An infrastructure failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    /// Transaction pool saturation.
    pub fn tx_pool_full(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TxPoolFull, message)
    }

    /// Attaches the SQL statement that was being executed.
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.message)?;
        if let Some(sql) = &self.sql {
            write!(f, " (sql: {})", sql)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// Convenience alias for executor-facing results.
pub type Result<T> = std::result::Result<T, Error>;
