//! Final SQL generation.
//!
//! The planner hands the executor parameterized SQL templates
//! ([`ParsedQuery`]) with named `:placeholders`. At execution time the
//! executor substitutes bind values, injects the implicit row limit, appends
//! the audit stream comment for writes, and restores any trailing token the
//! normalizer stripped. The string produced here is exactly what the backend
//! connection sees.

use std::collections::HashMap;
use std::fmt::Write as _;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{Error, Result};
use crate::sqltypes::{Row, Value};

/// Bind name carrying the implicit row limit.
pub const BIND_MAX_LIMIT: &str = "#maxLimit";
/// Bind name carrying the primary-key tuple list of a decomposed DML.
pub const BIND_PK: &str = "#pk";
/// Bind name carrying subquery rows re-bound into an INSERT.
pub const BIND_VALUES: &str = "#values";
/// Bind name carrying a trailing token stripped during normalization.
pub const BIND_STRIPPED: &str = "#stripped";

/// A value bound into a SQL template.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    /// A single scalar value.
    Value(Value),
    /// A list of scalars, encoded as a parenthesized IN list.
    List(Vec<Value>),
    /// A list of rows, encoded as an INSERT values list.
    Rows(Vec<Row>),
    /// A tuple-equality predicate over primary-key columns.
    Tuples(TupleEqualityList),
}

/// Bind variables for one execution. Owned by the request: the executor
/// inserts internal binds (`#pk`, `#values`, `#maxLimit`) into it.
pub type BindVars = HashMap<String, BindValue>;

/// Encodes `WHERE` predicates of the form `(pk1, pk2) IN ((..), (..))`
/// without relying on backend tuple-comparison support.
#[derive(Debug, Clone, PartialEq)]
pub struct TupleEqualityList {
    /// Primary-key column names, in index order.
    pub columns: Vec<String>,
    /// One row of values per target primary key.
    pub rows: Vec<Row>,
}

impl TupleEqualityList {
    fn encode(&self, buf: &mut String) -> Result<()> {
        if self.rows.is_empty() {
            return Err(Error::fail("cannot encode with 0 rows"));
        }
        if self.columns.len() == 1 {
            // id in (1, 2, 3)
            buf.push_str(&self.columns[0]);
            buf.push_str(" in (");
            for (i, row) in self.rows.iter().enumerate() {
                if i > 0 {
                    buf.push_str(", ");
                }
                row[0].encode_sql(buf);
            }
            buf.push(')');
            return Ok(());
        }
        // (a = 1 and b = 2) or (a = 3 and b = 4)
        for (i, row) in self.rows.iter().enumerate() {
            if row.len() != self.columns.len() {
                return Err(Error::fail("values don't match column count"));
            }
            if i > 0 {
                buf.push_str(" or ");
            }
            buf.push('(');
            for (j, col) in self.columns.iter().enumerate() {
                if j > 0 {
                    buf.push_str(" and ");
                }
                buf.push_str(col);
                buf.push_str(" = ");
                row[j].encode_sql(buf);
            }
            buf.push(')');
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Chunk {
    Lit(String),
    Bind(String),
}

/// A parameterized SQL template with named `:placeholders`.
///
/// Placeholder names start with a letter, `_` or `#` and continue with
/// letters, digits, `_` or `#`; everything else is literal text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    text: String,
    chunks: Vec<Chunk>,
}

impl ParsedQuery {
    /// Parses a template. This never fails: a stray `:` not followed by a
    /// placeholder name stays literal.
    pub fn new(template: impl Into<String>) -> Self {
        let text: String = template.into();
        let mut chunks = Vec::new();
        let mut lit = String::new();
        let mut chars = text.chars().peekable();
        while let Some(c) = chars.next() {
            if c == ':'
                && chars
                    .peek()
                    .is_some_and(|&n| n.is_ascii_alphabetic() || n == '_' || n == '#')
            {
                if !lit.is_empty() {
                    chunks.push(Chunk::Lit(std::mem::take(&mut lit)));
                }
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' || n == '#' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                chunks.push(Chunk::Bind(name));
            } else {
                lit.push(c);
            }
        }
        if !lit.is_empty() {
            chunks.push(Chunk::Lit(lit));
        }
        Self { text, chunks }
    }

    /// The original template text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Substitutes bind variables and returns the final SQL string.
    ///
    /// # Errors
    ///
    /// Fails with a terminal error if a referenced bind is missing or an
    /// empty list is supplied.
    pub fn generate_query(&self, bind_vars: &BindVars) -> Result<String> {
        let mut buf = String::with_capacity(self.text.len());
        for chunk in &self.chunks {
            match chunk {
                Chunk::Lit(s) => buf.push_str(s),
                Chunk::Bind(name) => {
                    let value = bind_vars
                        .get(name)
                        .ok_or_else(|| Error::fail(format!("missing bind var {}", name)))?;
                    encode_bind_value(name, value, &mut buf)?;
                }
            }
        }
        Ok(buf)
    }
}

fn encode_bind_value(name: &str, value: &BindValue, buf: &mut String) -> Result<()> {
    match value {
        BindValue::Value(v) => {
            v.encode_sql(buf);
            Ok(())
        }
        BindValue::List(values) => {
            if values.is_empty() {
                return Err(Error::fail(format!("empty list supplied for {}", name)));
            }
            buf.push('(');
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    buf.push_str(", ");
                }
                v.encode_sql(buf);
            }
            buf.push(')');
            Ok(())
        }
        BindValue::Rows(rows) => {
            if rows.is_empty() {
                return Err(Error::fail(format!("empty row list supplied for {}", name)));
            }
            for (i, row) in rows.iter().enumerate() {
                if i > 0 {
                    buf.push_str(", ");
                }
                buf.push('(');
                for (j, v) in row.iter().enumerate() {
                    if j > 0 {
                        buf.push_str(", ");
                    }
                    v.encode_sql(buf);
                }
                buf.push(')');
            }
            Ok(())
        }
        BindValue::Tuples(tuples) => tuples.encode(buf),
    }
}

/// Builds the audit stream comment for a write.
///
/// Downstream change tailers parse this trailing comment to reconstruct
/// row-level changes without decoding the statement itself. String values
/// are base64 encoded so the comment stays free of quoting hazards.
pub fn build_stream_comment(
    table: &str,
    pk_columns: &[String],
    pk_rows: &[Row],
    secondary_rows: Option<&[Row]>,
) -> String {
    let mut buf = String::new();
    buf.push_str(" /* _stream ");
    buf.push_str(table);
    buf.push_str(" (");
    for col in pk_columns {
        buf.push_str(col);
        buf.push(' ');
    }
    buf.push(')');
    for row in pk_rows {
        encode_comment_row(row, &mut buf);
    }
    if let Some(rows) = secondary_rows {
        for row in rows {
            encode_comment_row(row, &mut buf);
        }
    }
    buf.push_str("; */");
    buf
}

fn encode_comment_row(row: &Row, buf: &mut String) {
    buf.push_str(" (");
    for v in row {
        match v {
            Value::Null => buf.push_str("null"),
            Value::Int(n) => {
                let _ = write!(buf, "{}", n);
            }
            Value::UInt(n) => {
                let _ = write!(buf, "{}", n);
            }
            Value::Float(n) => {
                let _ = write!(buf, "{}", n);
            }
            Value::Str(s) => {
                buf.push('\'');
                buf.push_str(&BASE64.encode(s.as_bytes()));
                buf.push('\'');
            }
        }
        buf.push(' ');
    }
    buf.push(')');
}

/// Re-appends the trailing token stripped by query normalization, if any.
pub fn restore_trailing(mut sql: String, bind_vars: &BindVars) -> String {
    if let Some(BindValue::Value(Value::Str(trailing))) = bind_vars.get(BIND_STRIPPED) {
        sql.push_str(trailing);
    }
    sql
}
