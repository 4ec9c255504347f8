//! Query IR and expression evaluation (§3, §4.6).
//!
//! The IR is tree-shaped and immutable once built — there is deliberately
//! no mutable builder state here, mirroring how `differential-dataflow`
//! keeps its own dataflow construction (`Collection`, `Stream`) append-only
//! until `finalize`. The query *builder* that produces this tree (§6,
//! informative) lives outside the core; only the tree itself, and the
//! evaluator over it, are part of the stable boundary.

use crate::error::D2Error;
use crate::row::{Row, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A dotted reference into a row of a named input (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PropRef {
    pub alias: String,
    pub path: Vec<String>,
}

impl PropRef {
    pub fn new(alias: impl Into<String>, path: impl IntoIterator<Item = impl Into<String>>) -> Self {
        PropRef {
            alias: alias.into(),
            path: path.into_iter().map(Into::into).collect(),
        }
    }
}

/// Recognized scalar function names (§3).
pub const SCALAR_FUNCS: &[&str] = &[
    "eq", "neq", "gt", "gte", "lt", "lte", "and", "or", "not", "in", "like", "ilike", "upper",
    "lower", "length", "concat", "coalesce", "add", "sub", "mul", "div",
];

/// Recognized aggregate names (§3).
pub const AGGREGATE_FUNCS: &[&str] = &["count", "sum", "avg", "min", "max"];

/// A node in the expression tree (§3): references, literals, scalar
/// function calls, and aggregate calls all live in one enum, the way
/// `differential-dataflow`'s own `difference`/`collection` types fold
/// several related concepts into one Rust type when Rust's enums make the
/// distinction free.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Expr {
    Ref(PropRef),
    Value(Value),
    Func { name: String, args: Vec<Expr> },
    Aggregate { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn eq_expr(a: Expr, b: Expr) -> Expr {
        Expr::Func { name: "eq".into(), args: vec![a, b] }
    }

    pub fn and(exprs: Vec<Expr>) -> Expr {
        Expr::Func { name: "and".into(), args: exprs }
    }

    /// True if this expression contains an aggregate call anywhere in its
    /// tree — used by the compiler to enforce "aggregates only in
    /// select/having of a group_by" (§4.6).
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Func { args, .. } => args.iter().any(Expr::contains_aggregate),
            _ => false,
        }
    }
}

/// Sort direction for [`OrderByClause`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Options controlling how two values compare within an `order_by` (§3).
/// Currently the only supported knob is case sensitivity for strings;
/// documented here rather than in the compiler since it is purely a
/// comparison-time concern.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompareOptions {
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderByClause {
    pub expression: Expr,
    pub direction: Direction,
    pub compare_options: CompareOptions,
}

/// A named input to a query (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionRef {
    pub collection: String,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinClause {
    pub kind: JoinKind,
    pub from: CollectionRef,
    /// Must reduce to `eq(ref_a, ref_b)` for the compiler to lower it into
    /// an equi-join (§4.7); richer predicates are rejected with
    /// `UnsupportedJoinPredicate`.
    pub on: Expr,
}

/// A `from` that is itself a compiled sub-query, per §3 ("`from` may itself
/// be a sub-query").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FromClause {
    Collection(CollectionRef),
    SubQuery { query: Box<QueryIr>, alias: String },
}

impl FromClause {
    pub fn alias(&self) -> &str {
        match self {
            FromClause::Collection(c) => &c.alias,
            FromClause::SubQuery { alias, .. } => alias,
        }
    }
}

/// One `select` projection field: `alias: expression`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectField {
    pub alias: String,
    pub expression: Expr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryIr {
    pub from: FromClause,
    #[serde(default)]
    pub joins: Vec<JoinClause>,
    #[serde(default)]
    pub r#where: Option<Expr>,
    #[serde(default)]
    pub group_by: Vec<Expr>,
    #[serde(default)]
    pub having: Option<Expr>,
    #[serde(default)]
    pub select: Vec<SelectField>,
    #[serde(default)]
    pub order_by: Vec<OrderByClause>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub distinct: bool,
}

/// `alias -> row` bindings an expression is evaluated against.
pub type RowEnv<'a> = HashMap<&'a str, &'a Row>;

/// Evaluates `expr` against `env`, implementing the null-propagation
/// semantics described in §4.6: `null op X = null` for every scalar
/// function except `and`, `or`, `coalesce`, and `in`, which have their own
/// three-valued-logic rules below.
pub fn eval(expr: &Expr, env: &RowEnv) -> Result<Value, D2Error> {
    match expr {
        Expr::Value(v) => Ok(v.clone()),
        Expr::Ref(r) => {
            let row = env.get(r.alias.as_str()).ok_or_else(|| {
                D2Error::QueryShapeError(format!("reference to unknown alias `{}`", r.alias))
            })?;
            Ok(row.get_path(&r.path).cloned().unwrap_or(Value::Null))
        }
        Expr::Aggregate { name, .. } => Err(D2Error::QueryShapeError(format!(
            "aggregate `{name}` evaluated outside of group_by/having"
        ))),
        Expr::Func { name, args } => eval_func(name, args, env),
    }
}

fn eval_func(name: &str, args: &[Expr], env: &RowEnv) -> Result<Value, D2Error> {
    macro_rules! arg {
        ($i:expr) => {
            eval(&args[$i], env)?
        };
    }
    Ok(match name {
        "and" => {
            let mut any_null = false;
            for a in args {
                match eval(a, env)? {
                    Value::Bool(false) => return Ok(Value::Bool(false)),
                    Value::Null => any_null = true,
                    _ => {}
                }
            }
            if any_null { Value::Null } else { Value::Bool(true) }
        }
        "or" => {
            let mut any_null = false;
            for a in args {
                match eval(a, env)? {
                    Value::Bool(true) => return Ok(Value::Bool(true)),
                    Value::Null => any_null = true,
                    _ => {}
                }
            }
            if any_null { Value::Null } else { Value::Bool(false) }
        }
        "not" => match arg!(0) {
            Value::Null => Value::Null,
            Value::Bool(b) => Value::Bool(!b),
            _ => Value::Null,
        },
        "coalesce" => {
            for a in args {
                let v = eval(a, env)?;
                if !v.is_null() {
                    return Ok(v);
                }
            }
            Value::Null
        }
        "in" => {
            let needle = arg!(0);
            if needle.is_null() {
                return Ok(Value::Null);
            }
            let haystack = arg!(1);
            let items = match haystack {
                Value::Array(items) => items,
                _ => return Ok(Value::Null),
            };
            let mut saw_null = false;
            for item in &items {
                if item.is_null() {
                    saw_null = true;
                    continue;
                }
                if crate::hash::structural_eq(&needle, item) {
                    return Ok(Value::Bool(true));
                }
            }
            if saw_null { Value::Null } else { Value::Bool(false) }
        }
        "eq" | "neq" | "gt" | "gte" | "lt" | "lte" => {
            let a = arg!(0);
            let b = arg!(1);
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let ord = compare_values(&a, &b, name)?;
            Value::Bool(ord)
        }
        "like" | "ilike" => {
            let a = arg!(0);
            let pattern = arg!(1);
            if a.is_null() || pattern.is_null() {
                return Ok(Value::Null);
            }
            let (Value::String(s), Value::String(p)) = (a, pattern) else {
                return Err(D2Error::QueryShapeError(format!("`{name}` requires string arguments")));
            };
            let case_insensitive = name == "ilike";
            Value::Bool(sql_like(&s, &p, case_insensitive))
        }
        "upper" | "lower" => match arg!(0) {
            Value::Null => Value::Null,
            Value::String(s) => Value::String(if name == "upper" { s.to_uppercase() } else { s.to_lowercase() }),
            _ => return Err(D2Error::QueryShapeError(format!("`{name}` requires a string argument"))),
        },
        "length" => match arg!(0) {
            Value::Null => Value::Null,
            Value::String(s) => Value::Number(s.chars().count() as f64),
            Value::Array(items) => Value::Number(items.len() as f64),
            _ => return Err(D2Error::QueryShapeError("`length` requires a string or array argument".into())),
        },
        "concat" => {
            let mut out = String::new();
            for a in args {
                match eval(a, env)? {
                    Value::Null => return Ok(Value::Null),
                    Value::String(s) => out.push_str(&s),
                    other => out.push_str(&display_value(&other)),
                }
            }
            Value::String(out)
        }
        "add" | "sub" | "mul" | "div" => {
            let a = arg!(0);
            let b = arg!(1);
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                return Err(D2Error::QueryShapeError(format!("`{name}` requires numeric arguments")));
            };
            Value::Number(match name {
                "add" => x + y,
                "sub" => x - y,
                "mul" => x * y,
                "div" => x / y,
                _ => unreachable!(),
            })
        }
        other => return Err(D2Error::QueryShapeError(format!("unrecognized function `{other}`"))),
    })
}

fn compare_values(a: &Value, b: &Value, op: &str) -> Result<bool, D2Error> {
    let ord = match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        _ => {
            if op == "eq" || op == "neq" {
                let eq = crate::hash::structural_eq(a, b);
                return Ok(if op == "eq" { eq } else { !eq });
            }
            return Err(D2Error::QueryShapeError(format!(
                "`{op}` requires comparable operands of the same type"
            )));
        }
    };
    let Some(ord) = ord else {
        return Err(D2Error::QueryShapeError(format!("`{op}` operands are not comparable (NaN?)")));
    };
    Ok(match op {
        "eq" => ord.is_eq(),
        "neq" => !ord.is_eq(),
        "gt" => ord.is_gt(),
        "gte" => ord.is_ge(),
        "lt" => ord.is_lt(),
        "lte" => ord.is_le(),
        _ => unreachable!(),
    })
}

fn display_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Date(d) => d.to_string(),
        Value::Array(_) | Value::Object(_) => String::new(),
    }
}

/// A minimal SQL `LIKE` matcher supporting `%` and `_` wildcards, used by
/// `like`/`ilike` (§3). Backslash escapes the following wildcard.
fn sql_like(input: &str, pattern: &str, case_insensitive: bool) -> bool {
    let (input, pattern) = if case_insensitive {
        (input.to_lowercase(), pattern.to_lowercase())
    } else {
        (input.to_string(), pattern.to_string())
    };
    let input: Vec<char> = input.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    like_match(&input, &pattern)
}

fn like_match(input: &[char], pattern: &[char]) -> bool {
    match pattern.first() {
        None => input.is_empty(),
        Some('%') => {
            like_match(input, &pattern[1..])
                || (!input.is_empty() && like_match(&input[1..], pattern))
        }
        Some('_') => !input.is_empty() && like_match(&input[1..], &pattern[1..]),
        Some('\\') if pattern.len() > 1 => {
            !input.is_empty() && input[0] == pattern[1] && like_match(&input[1..], &pattern[2..])
        }
        Some(c) => !input.is_empty() && input[0] == *c && like_match(&input[1..], &pattern[1..]),
    }
}

/// Builds an evaluation environment from a single graph tuple's row.
///
/// Every tuple the compiler produces carries a row shaped as `{alias:
/// subrow, ...}` (one field per source alias currently in scope, attached by
/// the key-attaching map at `from`/`join` time and merged again at join
/// time) — see `crate::compiler`. This unpacks that shape back into the
/// `alias -> row` bindings `eval` expects.
pub fn row_env(row: &Row) -> HashMap<String, Row> {
    match &row.0 {
        Value::Object(fields) => fields.iter().map(|(k, v)| (k.clone(), Row::new(v.clone()))).collect(),
        _ => HashMap::new(),
    }
}

/// Evaluates `expr` against a tuple's row directly, building the env for it.
/// Convenience wrapper around [`row_env`] + [`eval`] for the compiler's
/// map/filter closures, which only ever have one row in hand.
pub fn eval_in_row(expr: &Expr, row: &Row) -> Result<Value, D2Error> {
    let owned = row_env(row);
    let env: RowEnv = owned.iter().map(|(k, v)| (k.as_str(), v)).collect();
    eval(expr, &env)
}

/// Checks that `expr` only contains aggregates in positions the compiler
/// knows how to lower (i.e. that this function is called from `select`/
/// `having` of a `group_by`). Top-level `where`/join-predicate validation
/// calls this with `allow_aggregates = false`.
pub fn validate_no_bare_aggregate(expr: &Expr, allow_aggregates: bool) -> Result<(), D2Error> {
    if !allow_aggregates && expr.contains_aggregate() {
        return Err(D2Error::QueryShapeError(
            "aggregate expression is only allowed in select/having of a group_by".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Row;

    fn env_with<'a>(alias: &'a str, row: &'a Row) -> RowEnv<'a> {
        let mut env = HashMap::new();
        env.insert(alias, row);
        env
    }

    #[test]
    fn null_propagates_through_comparison() {
        let row = Row::new(Value::Object(vec![("age".into(), Value::Null)]));
        let env = env_with("u", &row);
        let expr = Expr::Func {
            name: "gt".into(),
            args: vec![Expr::Ref(PropRef::new("u", ["age"])), Expr::Value(Value::Number(10.0))],
        };
        assert!(eval(&expr, &env).unwrap().is_null());
    }

    #[test]
    fn and_short_circuits_on_false_even_with_null() {
        let row = Row::new(Value::Object(vec![]));
        let env = env_with("u", &row);
        let expr = Expr::and(vec![Expr::Value(Value::Bool(false)), Expr::Value(Value::Null)]);
        assert_eq!(eval(&expr, &env).unwrap(), Value::Bool(false));
    }

    #[test]
    fn like_supports_percent_and_underscore() {
        assert!(sql_like("hello", "h%o", false));
        assert!(sql_like("hello", "h_ll_", false));
        assert!(!sql_like("hello", "world", false));
        assert!(sql_like("HELLO", "hello", true));
    }

    #[test]
    fn in_returns_null_when_uncertain() {
        let row = Row::new(Value::Object(vec![]));
        let env = env_with("u", &row);
        let expr = Expr::Func {
            name: "in".into(),
            args: vec![
                Expr::Value(Value::Number(1.0)),
                Expr::Value(Value::Array(vec![Value::Null, Value::Number(2.0)])),
            ],
        };
        assert!(eval(&expr, &env).unwrap().is_null());
    }
}
