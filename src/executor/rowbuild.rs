//! Row projection helpers for decomposed plans.

use crate::error::{Error, Result};
use crate::schema::Table;
use crate::sqltypes::{Row, Value};

/// Projects a full row down to the given column indexes.
///
/// Indexes come from the planner and are trusted; an out-of-range index is
/// a planner bug.
pub fn apply_filter(columns: &[usize], row: &[Value]) -> Row {
    columns.iter().map(|&i| row[i].clone()).collect()
}

/// Builds a primary-key row from a subquery row. Each primary-key column
/// either projects from the subquery (`Some(index)`) or falls back to the
/// schema default (`None`).
pub fn apply_filter_with_pk_defaults(
    table: &Table,
    subquery_pk_columns: &[Option<usize>],
    row: &[Value],
) -> Row {
    subquery_pk_columns
        .iter()
        .enumerate()
        .map(|(i, col)| match col {
            Some(idx) => row[*idx].clone(),
            None => table.columns[table.pk_columns[i]].default.clone(),
        })
        .collect()
}

/// Checks that a materialized primary-key row has the expected arity.
pub fn validate_row(row: &Row, want_columns: usize) -> Result<()> {
    if row.len() != want_columns {
        return Err(Error::fail(format!(
            "row length mismatch: got {}, want {}",
            row.len(),
            want_columns
        )));
    }
    Ok(())
}
