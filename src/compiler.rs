//! Query compiler (§4.7): lowers a [`QueryIr`] tree into a compiled [`Graph`].
//!
//! Every tuple the compiler wires up carries a row shaped `{alias: subrow,
//! ...}` — one field per source alias currently in scope — so that a
//! [`PropRef`] can always be resolved the same way regardless of how many
//! joins came before it: look up the alias field, then walk the remaining
//! path. A plain `from users` row is `{"users": {...}}`; after `join posts`
//! it becomes `{"users": {...}, "posts": {...}}`. `select` (or a `group_by`'s
//! aggregates) flattens this back down to a plain object, the shape a
//! consumer actually wants.
//!
//! This mirrors how `differential-dataflow`'s own `Collection` combinators
//! build up nested `(key, (data, time), diff)` tuples one combinator at a
//! time rather than threading a side-channel schema through the dataflow.

use crate::error::D2Error;
use crate::graph::operators::OperatorKind;
use crate::graph::{EdgeId, Graph, OperatorId, ReaderRef, Tuple};
use crate::ir::{self, CollectionRef, Expr, FromClause, JoinClause, JoinKind, OrderByClause, PropRef, QueryIr};
use crate::multiset::Multiplicity;
use crate::row::{Key, Row, Value};
use fnv::FnvHashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// The result of compiling a [`QueryIr`]: a finalized graph plus everything
/// a live query needs to drive it (§4.7, §4.8).
pub struct CompiledQuery {
    pub graph: Graph,
    /// `alias -> input edge` for every base collection referenced anywhere
    /// in the query (including inside sub-queries). A live query pushes
    /// `(key, row)` tuples wrapped under the matching alias onto these.
    pub input_edges: FnvHashMap<String, EdgeId>,
    /// `alias -> collection name`, so the caller knows which backing
    /// collection feeds each input edge.
    pub source_collections: FnvHashMap<String, String>,
    pub output: OperatorId,
    /// Recorded per §4.7 step 7: present only when the outermost query has
    /// an `order_by` with no `limit` (a `limit` consumes it into an in-graph
    /// Top-K instead). The live-query layer orders snapshots by this; the
    /// dataflow itself does not enforce it.
    pub order_by: Vec<OrderByClause>,
}

/// Wraps a raw collection row under `alias`, the first step of every
/// dataflow this compiler builds (§4.7 step 1).
pub fn wrap_tuple(alias: &str, key: Key, row: &Row) -> Tuple {
    (key, Row::new(Value::Object(vec![(alias.to_string(), row.0.clone())])))
}

pub fn compile(query: &QueryIr) -> Result<CompiledQuery, D2Error> {
    let mut graph = Graph::new();
    let mut input_edges = FnvHashMap::default();
    let mut source_collections = FnvHashMap::default();
    let (reader, _aliases, order_by) =
        compile_pipeline(&mut graph, query, &mut input_edges, &mut source_collections)?;
    let output = graph.add_output_operator(reader)?;
    graph.finalize();
    Ok(CompiledQuery { graph, input_edges, source_collections, output, order_by })
}

/// Lowers one `QueryIr` level (steps 2-7 of §4.7), returning the reader for
/// its fully processed stream, the aliases visible on that stream's rows,
/// and any leftover `order_by` that wasn't consumed by a `limit`.
fn compile_pipeline(
    graph: &mut Graph,
    q: &QueryIr,
    input_edges: &mut FnvHashMap<String, EdgeId>,
    source_collections: &mut FnvHashMap<String, String>,
) -> Result<(ReaderRef, HashSet<String>, Vec<OrderByClause>), D2Error> {
    let (mut reader, mut aliases) = lower_from(graph, &q.from, input_edges, source_collections)?;

    for join in &q.joins {
        let (new_reader, new_aliases) = lower_join(graph, reader, &aliases, join, input_edges, source_collections)?;
        reader = new_reader;
        aliases = new_aliases;
    }

    if let Some(where_expr) = &q.r#where {
        ir::validate_no_bare_aggregate(where_expr, false)?;
        let expr = where_expr.clone();
        let (_, edge) = graph.add_operator(
            OperatorKind::new_filter(move |(_, row): &Tuple| eval_or_null(&expr, row).as_bool().unwrap_or(false)),
            vec![reader],
        )?;
        reader = graph.add_reader(edge)?;
    }

    let grouped = !q.group_by.is_empty();
    if grouped {
        for field in &q.select {
            if !field.expression.contains_aggregate() {
                validate_refs_in_group_by(&field.expression, &q.group_by)?;
            }
        }
        let group_by_exprs = q.group_by.clone();
        let (_, key_edge) = graph.add_operator(
            OperatorKind::new_map(move |(_, row): &Tuple| {
                let key = group_key(&group_by_exprs, row);
                (key, row.clone())
            }),
            vec![reader],
        )?;
        let keyed_reader = graph.add_reader(key_edge)?;

        let select_fields = q.select.clone();
        let (_, reduce_edge) = graph.add_operator(
            OperatorKind::new_group_reduce(move |values| build_select_row(&select_fields, values)),
            vec![keyed_reader],
        )?;
        reader = graph.add_reader(reduce_edge)?;

        if let Some(having) = &q.having {
            let expr = having.clone();
            let (_, edge) = graph.add_operator(
                OperatorKind::new_filter(move |(_, row): &Tuple| eval_or_null(&expr, row).as_bool().unwrap_or(false)),
                vec![reader],
            )?;
            reader = graph.add_reader(edge)?;
        }
        aliases = HashSet::new();
    } else if !q.select.is_empty() {
        for field in &q.select {
            ir::validate_no_bare_aggregate(&field.expression, false)?;
        }
        let select_fields = q.select.clone();
        let (_, edge) = graph.add_operator(
            OperatorKind::new_map(move |(k, row): &Tuple| {
                let out = build_select_row(&select_fields, &[(row.clone(), 1)]);
                (k.clone(), out)
            }),
            vec![reader],
        )?;
        reader = graph.add_reader(edge)?;
        aliases = HashSet::new();
    }

    if q.distinct {
        let (_, edge) = graph.add_operator(OperatorKind::new_distinct(), vec![reader])?;
        reader = graph.add_reader(edge)?;
    }

    let order_by = if let Some(limit) = q.limit {
        let (_, edge) = graph.add_operator(OperatorKind::new_top_k(q.order_by.clone(), limit, q.offset.unwrap_or(0)), vec![reader])?;
        reader = graph.add_reader(edge)?;
        Vec::new()
    } else {
        q.order_by.clone()
    };

    Ok((reader, aliases, order_by))
}

fn lower_from(
    graph: &mut Graph,
    from: &FromClause,
    input_edges: &mut FnvHashMap<String, EdgeId>,
    source_collections: &mut FnvHashMap<String, String>,
) -> Result<(ReaderRef, HashSet<String>), D2Error> {
    match from {
        FromClause::Collection(c) => {
            let edge = match input_edges.get(&c.alias) {
                Some(e) => *e,
                None => {
                    let e = graph.new_edge()?;
                    input_edges.insert(c.alias.clone(), e);
                    e
                }
            };
            source_collections.insert(c.alias.clone(), c.collection.clone());
            let reader = graph.add_reader(edge)?;
            Ok((reader, HashSet::from([c.alias.clone()])))
        }
        FromClause::SubQuery { query, alias } => {
            let (inner_reader, _inner_aliases, _order_by) = compile_pipeline(graph, query, input_edges, source_collections)?;
            let wrap_alias = alias.clone();
            let (_, edge) = graph.add_operator(
                OperatorKind::new_map(move |(k, row): &Tuple| {
                    (k.clone(), Row::new(Value::Object(vec![(wrap_alias.clone(), row.0.clone())])))
                }),
                vec![inner_reader],
            )?;
            let reader = graph.add_reader(edge)?;
            Ok((reader, HashSet::from([alias.clone()])))
        }
    }
}

fn lower_join(
    graph: &mut Graph,
    left_reader: ReaderRef,
    left_aliases: &HashSet<String>,
    join: &JoinClause,
    input_edges: &mut FnvHashMap<String, EdgeId>,
    source_collections: &mut FnvHashMap<String, String>,
) -> Result<(ReaderRef, HashSet<String>), D2Error> {
    let right_alias = join.from.alias.clone();
    let (right_reader, right_aliases) = lower_from(
        graph,
        &FromClause::Collection(join.from.clone()),
        input_edges,
        source_collections,
    )?;

    let (left_ref, right_ref) = split_join_refs(&join.on, left_aliases, &right_alias)?;

    // Stash each side's own identity key into the row (`__lk__`/`__rk__`)
    // before re-keying the tuple by the join column. `Index::join` only
    // preserves the shared join-key value, which collides across a
    // one-to-many match (§4.3); the stashed keys let the finishing map
    // below synthesize a stable per-pair key instead.
    let left_key_ref = left_ref.clone();
    let (_, left_keyed_edge) = graph.add_operator(
        OperatorKind::new_map(move |(k, row): &Tuple| {
            (value_to_key(&resolve_prop_ref(row, &left_key_ref)), stash_key(row, "__lk__", k))
        }),
        vec![left_reader],
    )?;
    let left_keyed = graph.add_reader(left_keyed_edge)?;

    let right_key_ref = right_ref.clone();
    let (_, right_keyed_edge) = graph.add_operator(
        OperatorKind::new_map(move |(k, row): &Tuple| {
            (value_to_key(&resolve_prop_ref(row, &right_key_ref)), stash_key(row, "__rk__", k))
        }),
        vec![right_reader],
    )?;
    let right_keyed = graph.add_reader(right_keyed_edge)?;

    let merge = |_k: &Key, l: &Row, r: &Row| merge_rows(l, r);

    let left_aliases_owned: Vec<String> = left_aliases.iter().cloned().collect();
    let right_alias_owned = right_alias.clone();
    let left_outer: Option<Arc<dyn Fn(&Key, &Row) -> Row + Send + Sync>> = Some(Arc::new(move |_k: &Key, row: &Row| {
        let null_right = Row::new(Value::Object(vec![(right_alias_owned.clone(), Value::Null)]));
        merge_rows(row, &null_right)
    }));
    let right_outer: Option<Arc<dyn Fn(&Key, &Row) -> Row + Send + Sync>> = Some(Arc::new(move |_k: &Key, row: &Row| {
        let null_left = Row::new(Value::Object(left_aliases_owned.iter().map(|a| (a.clone(), Value::Null)).collect()));
        merge_rows(&null_left, row)
    }));

    let (_, join_edge) = graph.add_operator(
        OperatorKind::new_join_with_kind(merge, join.kind, left_outer, right_outer),
        vec![left_keyed, right_keyed],
    )?;
    let join_reader = graph.add_reader(join_edge)?;

    let (_, finish_edge) = graph.add_operator(OperatorKind::new_map(|(_, row): &Tuple| finish_join_row(row)), vec![join_reader])?;
    let reader = graph.add_reader(finish_edge)?;

    let mut combined: HashSet<String> = left_aliases.clone();
    combined.extend(right_aliases);
    Ok((reader, combined))
}

/// Validates that `join.on` reduces to `eq(ref_a, ref_b)` with one side
/// resolving into `left_aliases` and the other into `right_alias`; anything
/// else is `UnsupportedJoinPredicate` (§4.6, §4.7).
fn split_join_refs(on: &Expr, left_aliases: &HashSet<String>, right_alias: &str) -> Result<(PropRef, PropRef), D2Error> {
    let Expr::Func { name, args } = on else {
        return Err(D2Error::UnsupportedJoinPredicate("join predicate must be an `eq` comparison".into()));
    };
    if name.as_str() != "eq" || args.len() != 2 {
        return Err(D2Error::UnsupportedJoinPredicate("join predicate must be `eq(a, b)`".into()));
    }
    let (Expr::Ref(a), Expr::Ref(b)) = (&args[0], &args[1]) else {
        return Err(D2Error::UnsupportedJoinPredicate("join predicate operands must be column references".into()));
    };
    if left_aliases.contains(&a.alias) && b.alias == right_alias {
        Ok((a.clone(), b.clone()))
    } else if left_aliases.contains(&b.alias) && a.alias == right_alias {
        Ok((b.clone(), a.clone()))
    } else {
        Err(D2Error::UnsupportedJoinPredicate(format!(
            "join predicate references `{}`/`{}`, expected one side from the joined alias `{right_alias}`",
            a.alias, b.alias
        )))
    }
}

fn stash_key(row: &Row, field: &str, key: &Key) -> Row {
    let mut fields = match &row.0 {
        Value::Object(f) => f.clone(),
        other => vec![("_value".to_string(), other.clone())],
    };
    fields.push((field.to_string(), Value::from(key.clone())));
    Row::new(Value::Object(fields))
}

/// Reads back the `__lk__`/`__rk__` keys [`stash_key`] embedded, synthesizes
/// a stable per-pair key from them, and strips the reserved fields from the
/// visible row (§4.3, §4.7 step 2).
fn finish_join_row(row: &Row) -> Tuple {
    let lk = row.get("__lk__").cloned().unwrap_or(Value::Null);
    let rk = row.get("__rk__").cloned().unwrap_or(Value::Null);
    let key = value_to_key(&Value::Array(vec![lk, rk]));
    let cleaned = match &row.0 {
        Value::Object(fields) => Value::Object(fields.iter().filter(|(k, _)| k != "__lk__" && k != "__rk__").cloned().collect()),
        other => other.clone(),
    };
    (key, Row::new(cleaned))
}

fn resolve_prop_ref(row: &Row, r: &PropRef) -> Value {
    row.get(&r.alias).and_then(|v| v.get_path(&r.path)).cloned().unwrap_or(Value::Null)
}

/// Coerces an arbitrary value into a graph [`Key`] for internal re-keying
/// (join keys, group-by keys): primitives map directly, anything else falls
/// back to a hash-derived key so equal values still land in the same
/// bucket (§4.2's "structural hashing when identity fails", applied here to
/// keys rather than rows).
fn value_to_key(v: &Value) -> Key {
    v.as_key().unwrap_or_else(|| Key::String(format!("#{:016x}", crate::hash::hash(v).unwrap_or(0))))
}

fn merge_rows(l: &Row, r: &Row) -> Row {
    let mut fields = match &l.0 {
        Value::Object(f) => f.clone(),
        other => vec![("_left".to_string(), other.clone())],
    };
    match &r.0 {
        Value::Object(f) => fields.extend(f.clone()),
        other => fields.push(("_right".to_string(), other.clone())),
    }
    Row::new(Value::Object(fields))
}

fn eval_or_null(expr: &Expr, row: &Row) -> Value {
    ir::eval_in_row(expr, row).unwrap_or(Value::Null)
}

fn group_key(exprs: &[Expr], row: &Row) -> Key {
    let values: Vec<Value> = exprs.iter().map(|e| eval_or_null(e, row)).collect();
    value_to_key(&Value::Array(values))
}

/// Checks that a non-aggregate `select`/`having` expression over a grouped
/// query only references columns that are functionally determined by the
/// `group_by` key (here: literally present in it) — anything else is
/// ambiguous within a group, per standard `GROUP BY` semantics.
fn validate_refs_in_group_by(expr: &Expr, group_by: &[Expr]) -> Result<(), D2Error> {
    match expr {
        Expr::Ref(_) => {
            if group_by.contains(expr) {
                Ok(())
            } else {
                Err(D2Error::QueryShapeError(format!(
                    "`{expr:?}` is neither aggregated nor part of group_by"
                )))
            }
        }
        Expr::Func { args, .. } => {
            for a in args {
                validate_refs_in_group_by(a, group_by)?;
            }
            Ok(())
        }
        Expr::Value(_) | Expr::Aggregate { .. } => Ok(()),
    }
}

fn build_select_row(fields: &[crate::ir::SelectField], values: &[(Row, Multiplicity)]) -> Row {
    let mut out = Vec::with_capacity(fields.len());
    for field in fields {
        let v = eval_select_field(&field.expression, values);
        out.push((field.alias.clone(), v));
    }
    Row::new(Value::Object(out))
}

fn eval_select_field(expr: &Expr, values: &[(Row, Multiplicity)]) -> Value {
    match expr {
        Expr::Aggregate { name, args } => eval_aggregate(name, args, values),
        other => values
            .iter()
            .find(|(_, m)| *m > 0)
            .map(|(row, _)| eval_or_null(other, row))
            .unwrap_or(Value::Null),
    }
}

fn eval_aggregate(name: &str, args: &[Expr], values: &[(Row, Multiplicity)]) -> Value {
    match name {
        "count" => {
            let total: Multiplicity = match args.first() {
                None => values.iter().map(|(_, m)| *m).sum(),
                Some(expr) => values
                    .iter()
                    .filter(|(row, _)| !eval_or_null(expr, row).is_null())
                    .map(|(_, m)| *m)
                    .sum(),
            };
            Value::Number(total.max(0) as f64)
        }
        "sum" | "avg" => {
            let Some(expr) = args.first() else { return Value::Null };
            let mut nums = Vec::new();
            for (row, m) in values {
                if *m <= 0 {
                    continue;
                }
                if let Some(n) = eval_or_null(expr, row).as_f64() {
                    for _ in 0..*m {
                        nums.push(n);
                    }
                }
            }
            let total = pairwise_sum(&nums);
            if name == "sum" {
                Value::Number(total)
            } else if nums.is_empty() {
                Value::Null
            } else {
                Value::Number(total / nums.len() as f64)
            }
        }
        "min" | "max" => {
            let Some(expr) = args.first() else { return Value::Null };
            let mut best: Option<Value> = None;
            for (row, m) in values {
                if *m <= 0 {
                    continue;
                }
                let v = eval_or_null(expr, row);
                if v.is_null() {
                    continue;
                }
                best = Some(match best {
                    None => v,
                    Some(cur) => {
                        let ord = crate::graph::operators::compare_values_for_order(&v, &cur, false);
                        let take_new = (name == "min" && ord == std::cmp::Ordering::Less)
                            || (name == "max" && ord == std::cmp::Ordering::Greater);
                        if take_new { v } else { cur }
                    }
                });
            }
            best.unwrap_or(Value::Null)
        }
        _ => Value::Null,
    }
}

/// Numerically stable summation by pairwise recursive splitting, avoiding
/// the accumulated error of a naive running total over a long group (§
/// SPEC_FULL ambient note on aggregate precision).
fn pairwise_sum(nums: &[f64]) -> f64 {
    match nums.len() {
        0 => 0.0,
        1 => nums[0],
        n => {
            let mid = n / 2;
            pairwise_sum(&nums[..mid]) + pairwise_sum(&nums[mid..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangeMessage;
    use crate::multiset::Multiset;

    fn user_row(id: i64, name: &str, age: f64) -> Row {
        Row::new(Value::Object(vec![
            ("id".into(), Value::Number(id as f64)),
            ("name".into(), Value::String(name.into())),
            ("age".into(), Value::Number(age)),
        ]))
    }

    fn simple_query() -> QueryIr {
        QueryIr {
            from: FromClause::Collection(CollectionRef { collection: "users".into(), alias: "u".into() }),
            joins: vec![],
            r#where: Some(Expr::Func {
                name: "gt".into(),
                args: vec![Expr::Ref(PropRef::new("u", ["age"])), Expr::Value(Value::Number(18.0))],
            }),
            group_by: vec![],
            having: None,
            select: vec![
                crate::ir::SelectField { alias: "id".into(), expression: Expr::Ref(PropRef::new("u", ["id"])) },
                crate::ir::SelectField { alias: "name".into(), expression: Expr::Ref(PropRef::new("u", ["name"])) },
            ],
            order_by: vec![],
            limit: None,
            offset: None,
            distinct: false,
        }
    }

    #[test]
    fn filter_and_select_emit_insert() {
        let compiled = compile(&simple_query()).unwrap();
        let mut graph = compiled.graph;
        let edge = *compiled.input_edges.get("u").unwrap();

        let mut batch = Multiset::new();
        batch.push(wrap_tuple("u", Key::Int(1), &user_row(1, "Alice", 30.0)), 1);
        batch.push(wrap_tuple("u", Key::Int(2), &user_row(2, "Bobby", 12.0)), 1);
        graph.push_input(edge, batch);
        graph.run();

        let msgs = graph.drain_output(compiled.output);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(&msgs[0], ChangeMessage::Insert { .. }));
        assert_eq!(msgs[0].value().get("name").and_then(Value::as_str), Some("Alice"));
    }

    #[test]
    fn unsupported_join_predicate_is_rejected() {
        let mut q = simple_query();
        q.joins.push(JoinClause {
            kind: JoinKind::Inner,
            from: CollectionRef { collection: "posts".into(), alias: "p".into() },
            on: Expr::Func { name: "gt".into(), args: vec![Expr::Ref(PropRef::new("u", ["id"])), Expr::Ref(PropRef::new("p", ["uid"]))] },
        });
        assert!(matches!(compile(&q), Err(D2Error::UnsupportedJoinPredicate(_))));
    }
}
