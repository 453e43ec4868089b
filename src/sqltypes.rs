//! SQL values, result fields and query results.
//!
//! This module defines the closed value representation exchanged with the
//! backend and the row cache. Values are already typed by the planner; the
//! executor never inspects backend bytes itself, it only forwards, projects
//! and encodes them.

use std::fmt;

/// A single typed column value.
///
/// NOTE: Temporal and decimal types arrive as `Str`; the executor treats
/// them as opaque and the backend does the interpretation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Signed integer (BIGINT and smaller).
    Int(i64),
    /// Unsigned integer (BIGINT UNSIGNED).
    UInt(u64),
    /// Floating point (FLOAT/DOUBLE).
    Float(f64),
    /// Character or binary data.
    Str(String),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Appends this value as a SQL literal to `buf`.
    ///
    /// Strings are single-quoted with backslash escaping; NULL renders as
    /// the `null` keyword.
    pub fn encode_sql(&self, buf: &mut String) {
        match self {
            Value::Null => buf.push_str("null"),
            Value::Int(n) => {
                buf.push_str(&n.to_string());
            }
            Value::UInt(n) => {
                buf.push_str(&n.to_string());
            }
            Value::Float(n) => {
                buf.push_str(&n.to_string());
            }
            Value::Str(s) => {
                buf.push('\'');
                for c in s.chars() {
                    match c {
                        '\'' => buf.push_str("\\'"),
                        '\\' => buf.push_str("\\\\"),
                        '\n' => buf.push_str("\\n"),
                        '\r' => buf.push_str("\\r"),
                        '\0' => buf.push_str("\\0"),
                        '\u{1a}' => buf.push_str("\\Z"),
                        _ => buf.push(c),
                    }
                }
                buf.push('\'');
            }
        }
    }

    /// Returns the SQL literal form of this value.
    pub fn to_sql(&self) -> String {
        let mut buf = String::new();
        self.encode_sql(&mut buf);
        buf
    }

    /// Returns the plain text form used for value comparison and cache keys.
    ///
    /// NULL renders as an empty string; callers that must distinguish NULL
    /// check [`is_null()`](Self::is_null) first.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Int(n) => n.to_string(),
            Value::UInt(n) => n.to_string(),
            Value::Float(n) => n.to_string(),
            Value::Str(s) => s.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

/// An ordered sequence of column values.
pub type Row = Vec<Value>;

/// Column metadata forwarded from the planner or the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// Column name.
    pub name: String,
}

impl Field {
    /// Creates a field with the given column name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Result of one backend statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Schema of the returned columns; empty when field info was not requested.
    pub fields: Vec<Field>,
    /// Returned rows, in backend order.
    pub rows: Vec<Row>,
    /// Number of rows touched by a DML, or returned by a read.
    pub rows_affected: u64,
    /// Auto-increment id assigned by the last insert, 0 if none.
    pub insert_id: u64,
}

/// Compares two rows for equality, treating NULLs as equal to each other
/// and comparing everything else by text form.
pub fn rows_equal(a: &[Value], b: &[Value]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    for (x, y) in a.iter().zip(b.iter()) {
        if x.is_null() && y.is_null() {
            continue;
        }
        if x.is_null() != y.is_null() || x.to_text() != y.to_text() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sql_literals() {
        assert_eq!(Value::Null.to_sql(), "null");
        assert_eq!(Value::Int(-42).to_sql(), "-42");
        assert_eq!(Value::UInt(42).to_sql(), "42");
        assert_eq!(Value::Float(1.5).to_sql(), "1.5");
        assert_eq!(Value::Str("a'b".into()).to_sql(), "'a\\'b'");
        assert_eq!(Value::Str("a\\b".into()).to_sql(), "'a\\\\b'");
        assert_eq!(Value::Str("a\nb".into()).to_sql(), "'a\\nb'");
    }

    #[test]
    fn test_rows_equal_null_aware() {
        assert!(rows_equal(
            &[Value::Null, Value::Int(1)],
            &[Value::Null, Value::Str("1".into())],
        ));
        assert!(!rows_equal(&[Value::Null], &[Value::Int(0)]));
        assert!(!rows_equal(&[Value::Int(1)], &[Value::Int(2)]));
        assert!(!rows_equal(&[Value::Int(1)], &[Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn test_is_null() {
        assert!(Value::Null.is_null());
        assert!(!Value::Int(0).is_null());
        assert!(!Value::Str(String::new()).is_null());
    }
}
