//! Execution plan input model.
//!
//! A [`Plan`] is the classified, rewritten form of a client statement as
//! produced by the planner; it is immutable for the lifetime of a request.
//! This crate never parses SQL: everything the executor needs to know about
//! the statement arrives on the plan.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::rules::{Acl, QueryRules};
use crate::schema::Table;
use crate::sqlgen::{BindValue, BindVars, ParsedQuery};
use crate::sqltypes::{Field, Row, Value};

/// Statement classification. Plan ids select one of the executor's one-shot
/// dispatch shapes; there is no long-lived per-plan state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanId {
    /// SELECT passed through as-is (possibly consolidated).
    PassSelect,
    /// SELECT fully decomposed into a primary-key lookup.
    PkIn,
    /// SELECT whose subquery yields primary keys for a cached read.
    SelectSubquery,
    /// SET statement (tunable or backend passthrough).
    Set,
    /// DML the planner could not decompose.
    PassDml,
    /// UPDATE/DELETE decomposed to target primary keys.
    DmlPk,
    /// UPDATE/DELETE whose targets come from a subquery.
    DmlSubquery,
    /// INSERT with planner-known primary-key values.
    InsertPk,
    /// INSERT whose rows come from a subquery.
    InsertSubquery,
    /// Data definition statement.
    Ddl,
    /// Anything else, passed through with field info.
    Other,
}

impl PlanId {
    /// Number of plan id variants, for fixed-size counter arrays.
    pub const COUNT: usize = 11;

    /// Stable display name, used in stats and log records.
    pub fn as_str(self) -> &'static str {
        match self {
            PlanId::PassSelect => "PASS_SELECT",
            PlanId::PkIn => "PK_IN",
            PlanId::SelectSubquery => "SELECT_SUBQUERY",
            PlanId::Set => "SET",
            PlanId::PassDml => "PASS_DML",
            PlanId::DmlPk => "DML_PK",
            PlanId::DmlSubquery => "DML_SUBQUERY",
            PlanId::InsertPk => "INSERT_PK",
            PlanId::InsertSubquery => "INSERT_SUBQUERY",
            PlanId::Ddl => "DDL",
            PlanId::Other => "OTHER",
        }
    }

    /// Dense index for counter arrays.
    pub fn index(self) -> usize {
        match self {
            PlanId::PassSelect => 0,
            PlanId::PkIn => 1,
            PlanId::SelectSubquery => 2,
            PlanId::Set => 3,
            PlanId::PassDml => 4,
            PlanId::DmlPk => 5,
            PlanId::DmlSubquery => 6,
            PlanId::InsertPk => 7,
            PlanId::InsertSubquery => 8,
            PlanId::Ddl => 9,
            PlanId::Other => 10,
        }
    }
}

/// Why the planner chose a pass-through shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reason {
    /// No special reason.
    #[default]
    Default,
    /// The statement takes row locks (`FOR UPDATE` and friends) and is only
    /// allowed inside a transaction.
    Lock,
}

/// Value of a recognized `SET` statement, already typed by the planner.
#[derive(Debug, Clone, PartialEq)]
pub enum SetValue {
    /// Integer setting.
    Int(i64),
    /// Floating-point setting.
    Float(f64),
    /// String setting (passed through to the backend).
    Str(String),
}

impl SetValue {
    /// Extracts an integer, failing with a terminal error otherwise.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            SetValue::Int(n) => Ok(*n),
            _ => Err(Error::fail("expecting int")),
        }
    }

    /// Extracts a number (int or float), failing otherwise.
    pub fn as_float(&self) -> Result<f64> {
        match self {
            SetValue::Int(n) => Ok(*n as f64),
            SetValue::Float(n) => Ok(*n),
            SetValue::Str(_) => Err(Error::fail("expecting number")),
        }
    }

    /// Interprets the value as a duration in (possibly fractional) seconds.
    pub fn as_duration(&self) -> Result<Duration> {
        let secs = self.as_float()?;
        if secs < 0.0 || !secs.is_finite() {
            return Err(Error::fail("expecting positive number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

/// An expression the planner emits for primary-key values and limits:
/// either a constant, a reference into the request's bind variables, or a
/// list of such.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanValue {
    /// A literal value from the statement text.
    Const(Value),
    /// A named bind variable supplied by the client.
    BindVar(String),
    /// A list of values (IN clauses).
    List(Vec<PlanValue>),
}

/// The planner's reading of a DDL statement. Carried on the plan because
/// this crate does not parse SQL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DdlInfo {
    /// Table being dropped or renamed away, if any.
    pub table_name: Option<String>,
    /// Table being created, altered, or renamed to, if any.
    pub new_name: Option<String>,
}

/// A classified, rewritten statement ready for execution.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Dispatch shape.
    pub plan_id: PlanId,
    /// Qualifier for pass-through selects.
    pub reason: Reason,
    /// Schema entry of the target table, when the statement has one.
    pub table: Option<Arc<Table>>,
    /// The full rewritten statement.
    pub full_query: Option<ParsedQuery>,
    /// The outer statement of a decomposed plan.
    pub outer_query: Option<ParsedQuery>,
    /// The subquery of a decomposed plan.
    pub subquery: Option<ParsedQuery>,
    /// Primary-key value expressions, one per primary-key column.
    pub pk_values: Vec<PlanValue>,
    /// For DMLs that change primary-key columns: the new value per
    /// primary-key column, `None` meaning unchanged.
    pub secondary_pk_values: Vec<Option<PlanValue>>,
    /// For INSERT-from-subquery: per primary-key column, the index of that
    /// column in the subquery row, or `None` to use the column default.
    pub subquery_pk_columns: Vec<Option<usize>>,
    /// Projection from full schema rows to the requested columns.
    pub column_numbers: Vec<usize>,
    /// Result schema, when the planner could determine it.
    pub fields: Option<Vec<Field>>,
    /// Name of a recognized SET target.
    pub set_key: Option<String>,
    /// Value of a recognized SET target.
    pub set_value: Option<SetValue>,
    /// Policy rules applying to this statement.
    pub rules: Arc<QueryRules>,
    /// Principals allowed to run this statement, if table ACLs apply.
    pub authorized: Option<Acl>,
    /// Row limit expression, if the statement carries one.
    pub limit: Option<PlanValue>,
    /// DDL details for `PlanId::Ddl`.
    pub ddl: Option<DdlInfo>,
}

impl Plan {
    /// Creates an empty plan of the given shape; callers fill in the parts
    /// their shape requires.
    pub fn new(plan_id: PlanId) -> Self {
        Self {
            plan_id,
            reason: Reason::Default,
            table: None,
            full_query: None,
            outer_query: None,
            subquery: None,
            pk_values: Vec::new(),
            secondary_pk_values: Vec::new(),
            subquery_pk_columns: Vec::new(),
            column_numbers: Vec::new(),
            fields: None,
            set_key: None,
            set_value: None,
            rules: Arc::new(QueryRules::default()),
            authorized: None,
            limit: None,
            ddl: None,
        }
    }

    /// Name of the target table, empty when there is none.
    pub fn table_name(&self) -> &str {
        self.table.as_ref().map(|t| t.name.as_str()).unwrap_or("")
    }
}

/// Resolves a scalar plan value against the bind variables.
pub fn resolve_value(pv: &PlanValue, bind_vars: &BindVars) -> Result<Value> {
    match pv {
        PlanValue::Const(v) => Ok(v.clone()),
        PlanValue::BindVar(name) => match bind_vars.get(name) {
            Some(BindValue::Value(v)) => Ok(v.clone()),
            Some(_) => Err(Error::fail(format!("unexpected list for bind var {}", name))),
            None => Err(Error::fail(format!("missing bind var {}", name))),
        },
        PlanValue::List(_) => Err(Error::fail("unexpected list in scalar context")),
    }
}

enum Resolved {
    Scalar(Value),
    Multi(Vec<Value>),
}

fn resolve_column(pv: &PlanValue, bind_vars: &BindVars) -> Result<Resolved> {
    match pv {
        PlanValue::Const(v) => Ok(Resolved::Scalar(v.clone())),
        PlanValue::BindVar(name) => match bind_vars.get(name) {
            Some(BindValue::Value(v)) => Ok(Resolved::Scalar(v.clone())),
            Some(BindValue::List(values)) => Ok(Resolved::Multi(values.clone())),
            Some(_) => Err(Error::fail(format!(
                "unexpected bind var shape for {}",
                name
            ))),
            None => Err(Error::fail(format!("missing bind var {}", name))),
        },
        PlanValue::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(resolve_value(item, bind_vars)?);
            }
            Ok(Resolved::Multi(values))
        }
    }
}

/// Materializes the target primary-key rows from the plan's value
/// expressions. Scalar columns broadcast across list columns; all list
/// columns must agree on length.
pub fn build_value_list(pk_values: &[PlanValue], bind_vars: &BindVars) -> Result<Vec<Row>> {
    let mut resolved = Vec::with_capacity(pk_values.len());
    let mut length: Option<usize> = None;
    for pv in pk_values {
        let r = resolve_column(pv, bind_vars)?;
        if let Resolved::Multi(values) = &r {
            match length {
                None => length = Some(values.len()),
                Some(n) if n == values.len() => {}
                Some(n) => {
                    return Err(Error::fail(format!(
                        "mismatched lengths for values {} and {}",
                        n,
                        values.len()
                    )));
                }
            }
        }
        resolved.push(r);
    }
    let count = length.unwrap_or(1);
    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        let mut row = Vec::with_capacity(resolved.len());
        for r in &resolved {
            match r {
                Resolved::Scalar(v) => row.push(v.clone()),
                Resolved::Multi(values) => row.push(values[i].clone()),
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Builds the post-update primary-key rows for DMLs that change
/// primary-key columns. Returns `None` when no column changes.
pub fn build_secondary_list(
    pk_rows: &[Row],
    secondary: &[Option<PlanValue>],
    bind_vars: &BindVars,
) -> Result<Option<Vec<Row>>> {
    if secondary.is_empty() {
        return Ok(None);
    }
    let mut rows = Vec::with_capacity(pk_rows.len());
    for pk_row in pk_rows {
        let mut row = Vec::with_capacity(pk_row.len());
        for (i, change) in secondary.iter().enumerate() {
            match change {
                Some(pv) => row.push(resolve_value(pv, bind_vars)?),
                None => row.push(pk_row[i].clone()),
            }
        }
        rows.push(row);
    }
    Ok(Some(rows))
}

/// Resolves the plan's row limit. Returns -1 when the statement has no
/// limit; a resolved limit must be a non-negative integer.
pub fn get_limit(limit: &Option<PlanValue>, bind_vars: &BindVars) -> Result<i64> {
    let Some(pv) = limit else {
        return Ok(-1);
    };
    let value = resolve_value(pv, bind_vars)?;
    match value {
        Value::Int(n) if n >= 0 => Ok(n),
        Value::UInt(n) => Ok(n as i64),
        other => Err(Error::fail(format!(
            "invalid limit: {}",
            other.to_text()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlgen::BindValue;

    fn bv(pairs: &[(&str, BindValue)]) -> BindVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_build_value_list_scalars() {
        let rows = build_value_list(
            &[
                PlanValue::Const(Value::Int(1)),
                PlanValue::Const(Value::Str("a".into())),
            ],
            &BindVars::new(),
        )
        .unwrap();
        assert_eq!(rows, vec![vec![Value::Int(1), Value::Str("a".into())]]);
    }

    #[test]
    fn test_build_value_list_broadcast() {
        let rows = build_value_list(
            &[
                PlanValue::List(vec![
                    PlanValue::Const(Value::Int(1)),
                    PlanValue::Const(Value::Int(2)),
                ]),
                PlanValue::Const(Value::Int(9)),
            ],
            &BindVars::new(),
        )
        .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::Int(1), Value::Int(9)],
                vec![Value::Int(2), Value::Int(9)],
            ]
        );
    }

    #[test]
    fn test_build_value_list_bindvars() {
        let vars = bv(&[
            ("ids", BindValue::List(vec![Value::Int(3), Value::Int(4)])),
            ("v", BindValue::Value(Value::Int(7))),
        ]);
        let rows = build_value_list(
            &[PlanValue::BindVar("ids".into()), PlanValue::BindVar("v".into())],
            &vars,
        )
        .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![Value::Int(3), Value::Int(7)],
                vec![Value::Int(4), Value::Int(7)],
            ]
        );
    }

    #[test]
    fn test_build_value_list_length_mismatch() {
        let err = build_value_list(
            &[
                PlanValue::List(vec![PlanValue::Const(Value::Int(1))]),
                PlanValue::List(vec![
                    PlanValue::Const(Value::Int(1)),
                    PlanValue::Const(Value::Int(2)),
                ]),
            ],
            &BindVars::new(),
        )
        .unwrap_err();
        assert!(err.message.contains("mismatched lengths"));
    }

    #[test]
    fn test_build_value_list_missing_bind() {
        let err = build_value_list(&[PlanValue::BindVar("nope".into())], &BindVars::new())
            .unwrap_err();
        assert!(err.message.contains("missing bind var nope"));
    }

    #[test]
    fn test_build_secondary_list() {
        let pk_rows = vec![vec![Value::Int(1)], vec![Value::Int(2)]];
        let secondary = vec![Some(PlanValue::Const(Value::Int(9)))];
        let rows = build_secondary_list(&pk_rows, &secondary, &BindVars::new())
            .unwrap()
            .unwrap();
        assert_eq!(rows, vec![vec![Value::Int(9)], vec![Value::Int(9)]]);

        // Unchanged columns copy through from the target row.
        let secondary = vec![None];
        let rows = build_secondary_list(&pk_rows, &secondary, &BindVars::new())
            .unwrap()
            .unwrap();
        assert_eq!(rows, pk_rows);

        assert!(
            build_secondary_list(&pk_rows, &[], &BindVars::new())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_get_limit() {
        assert_eq!(get_limit(&None, &BindVars::new()).unwrap(), -1);
        assert_eq!(
            get_limit(&Some(PlanValue::Const(Value::Int(5))), &BindVars::new()).unwrap(),
            5
        );
        let vars = bv(&[("max", BindValue::Value(Value::Int(3)))]);
        assert_eq!(
            get_limit(&Some(PlanValue::BindVar("max".into())), &vars).unwrap(),
            3
        );
        assert!(get_limit(&Some(PlanValue::Const(Value::Int(-1))), &BindVars::new()).is_err());
        assert!(
            get_limit(
                &Some(PlanValue::Const(Value::Str("x".into()))),
                &BindVars::new()
            )
            .is_err()
        );
    }

    #[test]
    fn test_set_value_conversions() {
        assert_eq!(SetValue::Int(5).as_int().unwrap(), 5);
        assert!(SetValue::Float(5.0).as_int().is_err());
        assert_eq!(SetValue::Float(2.5).as_float().unwrap(), 2.5);
        assert_eq!(SetValue::Int(2).as_float().unwrap(), 2.0);
        assert!(SetValue::Str("x".into()).as_float().is_err());
        assert_eq!(
            SetValue::Float(1.5).as_duration().unwrap(),
            Duration::from_millis(1500)
        );
        assert!(SetValue::Float(-1.0).as_duration().is_err());
    }

    #[test]
    fn test_plan_id_names() {
        assert_eq!(PlanId::PkIn.as_str(), "PK_IN");
        assert_eq!(PlanId::Ddl.as_str(), "DDL");
        // Dense indexes stay within the counter array.
        for id in [
            PlanId::PassSelect,
            PlanId::PkIn,
            PlanId::SelectSubquery,
            PlanId::Set,
            PlanId::PassDml,
            PlanId::DmlPk,
            PlanId::DmlSubquery,
            PlanId::InsertPk,
            PlanId::InsertSubquery,
            PlanId::Ddl,
            PlanId::Other,
        ] {
            assert!(id.index() < PlanId::COUNT);
        }
    }
}
