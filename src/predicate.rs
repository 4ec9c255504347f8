//! Predicate algebra (§4.10): structural reasoning over the boolean
//! `where`-shaped fragment of the IR (`and`/`or`/`not`, comparisons, `in`),
//! used to decide whether a narrower `load_subset` request is already
//! covered by a broader one already loaded, and to combine two requests
//! into the single subscription that covers both.
//!
//! This never attempts general theorem proving — only the syntactic and
//! numeric-range reasoning subset-loading actually needs (structural
//! equality, conjunct containment, same-path range subsumption, `eq`/`in`
//! set containment). Anything it can't prove one way, it reports
//! conservatively rather than guessing (§4.10, §9).

use crate::hash::structural_eq;
use crate::ir::{Expr, OrderByClause, PropRef};
use crate::row::Value;

/// `true` if every row matching `a` also matches `b` (`a` is at least as
/// narrow as `b`).
pub fn is_subset(a: &Expr, b: &Expr) -> bool {
    if a == b {
        return true;
    }
    if is_contradiction(a) || is_tautology(b) {
        return true;
    }
    let a_conjuncts = flatten_and(a);
    flatten_and(b).iter().all(|goal| implies_conjunct(&a_conjuncts, goal))
}

/// The expression matching rows that satisfy both `a` and `b`. Same-path
/// `eq`/`in`/range conjuncts are collapsed to their intersection rather than
/// left as a bare `and` (§4.10): two disjoint `eq`s on the same path
/// contradict outright, an `eq` inside an `in` set wins over the `in`, two
/// `in` sets intersect to their common items, and two same-direction ranges
/// collapse to the tighter bound.
pub fn intersect(a: &Expr, b: &Expr) -> Expr {
    if a == b {
        return a.clone();
    }
    if is_contradiction(a) || is_contradiction(b) {
        return Expr::Value(Value::Bool(false));
    }
    if is_tautology(a) {
        return b.clone();
    }
    if is_tautology(b) {
        return a.clone();
    }
    if let Some(combined) = combine_intersect(a, b) {
        return combined;
    }
    Expr::and(vec![a.clone(), b.clone()])
}

/// The expression matching rows that satisfy `a` or `b`. Same-path
/// `eq`/`in`/range conjuncts are widened rather than left as a bare `or`
/// (§4.10): two `eq`s on the same path combine into an `in`, an `eq` joins
/// an `in` set, two `in` sets union their items, and two same-direction
/// ranges collapse to the looser bound.
pub fn union(a: &Expr, b: &Expr) -> Expr {
    if a == b {
        return a.clone();
    }
    if is_tautology(a) || is_tautology(b) {
        return Expr::Value(Value::Bool(true));
    }
    if is_contradiction(a) {
        return b.clone();
    }
    if is_contradiction(b) {
        return a.clone();
    }
    if let Some(combined) = combine_union(a, b) {
        return combined;
    }
    Expr::Func { name: "or".into(), args: vec![a.clone(), b.clone()] }
}

fn combine_intersect(a: &Expr, b: &Expr) -> Option<Expr> {
    if let (Some((ra, va)), Some((rb, vb))) = (as_eq(a), as_eq(b)) {
        if ra == rb {
            return Some(if structural_eq(va, vb) { a.clone() } else { Expr::Value(Value::Bool(false)) });
        }
    }
    if let (Some((ra, va)), Some((rb, items))) = (as_eq(a), as_in(b)) {
        if ra == rb {
            return Some(if items.iter().any(|it| structural_eq(it, va)) { a.clone() } else { Expr::Value(Value::Bool(false)) });
        }
    }
    if let (Some((ra, items)), Some((rb, vb))) = (as_in(a), as_eq(b)) {
        if ra == rb {
            return Some(if items.iter().any(|it| structural_eq(it, vb)) { b.clone() } else { Expr::Value(Value::Bool(false)) });
        }
    }
    if let (Some((ra, items_a)), Some((rb, items_b))) = (as_in(a), as_in(b)) {
        if ra == rb {
            let common: Vec<Value> = items_a.iter().filter(|x| items_b.iter().any(|y| structural_eq(x, y))).cloned().collect();
            return Some(make_in(ra, common));
        }
    }
    combine_same_path_range(a, b, true)
}

fn combine_union(a: &Expr, b: &Expr) -> Option<Expr> {
    if let (Some((ra, va)), Some((rb, vb))) = (as_eq(a), as_eq(b)) {
        if ra == rb {
            return Some(if structural_eq(va, vb) { a.clone() } else { make_in(ra, vec![va.clone(), vb.clone()]) });
        }
    }
    if let (Some((ra, va)), Some((rb, items))) = (as_eq(a), as_in(b)) {
        if ra == rb {
            if items.iter().any(|it| structural_eq(it, va)) {
                return Some(b.clone());
            }
            let mut combined = items.to_vec();
            combined.push(va.clone());
            return Some(make_in(ra, combined));
        }
    }
    if let (Some((ra, items)), Some((rb, vb))) = (as_in(a), as_eq(b)) {
        if ra == rb {
            if items.iter().any(|it| structural_eq(it, vb)) {
                return Some(a.clone());
            }
            let mut combined = items.to_vec();
            combined.push(vb.clone());
            return Some(make_in(ra, combined));
        }
    }
    if let (Some((ra, items_a)), Some((rb, items_b))) = (as_in(a), as_in(b)) {
        if ra == rb {
            let mut combined = items_a.to_vec();
            for item in items_b {
                if !combined.iter().any(|x| structural_eq(x, item)) {
                    combined.push(item.clone());
                }
            }
            return Some(make_in(ra, combined));
        }
    }
    combine_same_path_range(a, b, false)
}

fn as_eq(e: &Expr) -> Option<(&PropRef, &Value)> {
    if let Expr::Func { name, args } = e {
        if name == "eq" {
            if let (Expr::Ref(r), Expr::Value(v)) = (&args[0], &args[1]) {
                return Some((r, v));
            }
        }
    }
    None
}

fn as_in(e: &Expr) -> Option<(&PropRef, &[Value])> {
    if let Expr::Func { name, args } = e {
        if name == "in" {
            if let (Expr::Ref(r), Expr::Value(Value::Array(items))) = (&args[0], &args[1]) {
                return Some((r, items));
            }
        }
    }
    None
}

/// Builds the narrowest expression equivalent to "value is one of `items`":
/// `false` when empty, a bare `eq` for a single item, `in` otherwise.
fn make_in(r: &PropRef, items: Vec<Value>) -> Expr {
    match items.len() {
        0 => Expr::Value(Value::Bool(false)),
        1 => Expr::Func { name: "eq".into(), args: vec![Expr::Ref(r.clone()), Expr::Value(items.into_iter().next().unwrap())] },
        _ => Expr::Func { name: "in".into(), args: vec![Expr::Ref(r.clone()), Expr::Value(Value::Array(items))] },
    }
}

/// Collapses two range comparisons on the same path to a single bound: the
/// tighter one for `intersect`, the looser one for `union`. Returns `None`
/// when the two aren't same-path ranges, or are ranges on opposite sides
/// (a lower bound and an upper bound can't collapse to one predicate).
fn combine_same_path_range(a: &Expr, b: &Expr, tighter: bool) -> Option<Expr> {
    let (ref_a, op_a, val_a) = as_range(a)?;
    let (ref_b, op_b, val_b) = as_range(b)?;
    if ref_a != ref_b {
        return None;
    }
    let pa = val_a.as_f64()?;
    let pb = val_b.as_f64()?;
    let a_is_lower = matches!(op_a, "gt" | "gte");
    let b_is_lower = matches!(op_b, "gt" | "gte");
    if a_is_lower != b_is_lower {
        return None;
    }
    let pick_a = if tighter {
        if a_is_lower { pa > pb || (pa == pb && op_a == "gt") } else { pa < pb || (pa == pb && op_a == "lt") }
    } else if a_is_lower {
        pa < pb || (pa == pb && op_a == "gte")
    } else {
        pa > pb || (pa == pb && op_a == "lte")
    };
    let (ref_win, op_win, val_win) = if pick_a { (ref_a, op_a, val_a) } else { (ref_b, op_b, val_b) };
    Some(Expr::Func { name: op_win.to_string(), args: vec![Expr::Ref(ref_win.clone()), Expr::Value(val_win.clone())] })
}

/// The expression matching rows that satisfy `a` but not `b`, factoring out
/// conjuncts common to both so the `not` clause only negates what actually
/// differs (§4.10).
pub fn minus(a: &Expr, b: &Expr) -> Expr {
    if is_subset(a, b) {
        return Expr::Value(Value::Bool(false));
    }
    if is_contradiction(b) {
        return a.clone();
    }
    let a_conjuncts = flatten_and(a);
    let b_conjuncts = flatten_and(b);
    let common: Vec<Expr> = a_conjuncts.iter().filter(|c| b_conjuncts.contains(c)).cloned().collect();
    let a_only: Vec<Expr> = a_conjuncts.into_iter().filter(|c| !common.contains(c)).collect();
    let b_only: Vec<Expr> = b_conjuncts.into_iter().filter(|c| !common.contains(c)).collect();

    let negated_b = match b_only.len() {
        0 => return Expr::Value(Value::Bool(false)), // b's unique part is empty: b already covers a
        1 => Expr::Func { name: "not".into(), args: vec![b_only.into_iter().next().unwrap()] },
        _ => Expr::Func { name: "not".into(), args: vec![Expr::and(b_only)] },
    };

    let mut parts = common;
    parts.extend(a_only);
    parts.push(negated_b);
    Expr::and(parts)
}

fn is_contradiction(e: &Expr) -> bool {
    matches!(e, Expr::Value(Value::Bool(false)))
}

fn is_tautology(e: &Expr) -> bool {
    matches!(e, Expr::Value(Value::Bool(true)))
}

fn flatten_and(e: &Expr) -> Vec<Expr> {
    match e {
        Expr::Func { name, args } if name == "and" => args.iter().flat_map(flatten_and).collect(),
        other => vec![other.clone()],
    }
}

fn implies_conjunct(premises: &[Expr], goal: &Expr) -> bool {
    if premises.iter().any(|p| p == goal) {
        return true;
    }
    if let Some((ref_g, op_g, val_g)) = as_range(goal) {
        for p in premises {
            if let Some((ref_p, op_p, val_p)) = as_range(p) {
                if ref_p == ref_g && range_implies(op_p, val_p, op_g, val_g) {
                    return true;
                }
            }
        }
    }
    if let Expr::Func { name, args } = goal {
        if name == "in" {
            if let (Expr::Ref(r), Expr::Value(Value::Array(items))) = (&args[0], &args[1]) {
                for p in premises {
                    if set_implies_in(p, r, items) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn set_implies_in(premise: &Expr, goal_ref: &PropRef, goal_items: &[Value]) -> bool {
    let Expr::Func { name, args } = premise else { return false };
    match name.as_str() {
        "eq" => {
            if let (Expr::Ref(r), Expr::Value(v)) = (&args[0], &args[1]) {
                r == goal_ref && goal_items.iter().any(|it| structural_eq(it, v))
            } else {
                false
            }
        }
        "in" => {
            if let (Expr::Ref(r), Expr::Value(Value::Array(items))) = (&args[0], &args[1]) {
                r == goal_ref && items.iter().all(|it| goal_items.iter().any(|gi| structural_eq(it, gi)))
            } else {
                false
            }
        }
        _ => false,
    }
}

fn as_range(e: &Expr) -> Option<(&PropRef, &str, &Value)> {
    if let Expr::Func { name, args } = e {
        if matches!(name.as_str(), "gt" | "gte" | "lt" | "lte") {
            if let (Expr::Ref(r), Expr::Value(v)) = (&args[0], &args[1]) {
                return Some((r, name.as_str(), v));
            }
        }
    }
    None
}

/// `premise op_p val_p` implies `goal op_g val_g` on the same path, for
/// numeric bounds only.
fn range_implies(op_p: &str, val_p: &Value, op_g: &str, val_g: &Value) -> bool {
    let (Some(p), Some(g)) = (val_p.as_f64(), val_g.as_f64()) else { return false };
    match (op_p, op_g) {
        ("gt", "gt") | ("gte", "gte") | ("gt", "gte") => p >= g,
        ("gte", "gt") => p > g,
        ("lt", "lt") | ("lte", "lte") | ("lt", "lte") => p <= g,
        ("lte", "lt") => p < g,
        _ => false,
    }
}

/// The filter/ordering/limit bundle a `load_subset` call carries (§3, §4.10).
#[derive(Debug, Clone, Default)]
pub struct LoadSubsetOptions {
    pub r#where: Option<Expr>,
    pub order_by: Vec<OrderByClause>,
    pub limit: Option<usize>,
}

/// Combines two subset requests into the one that covers both (§4.10): the
/// `order_by` carries over only when both sides agree (a caller can't
/// assume the combined fetch is ordered if they asked for different orders,
/// or none); the resolved `limit` is the smaller of the two only when both
/// specified one, since the narrower of two explicit caps is what the
/// overlap region is guaranteed to have actually loaded.
pub fn intersect_options(a: &LoadSubsetOptions, b: &LoadSubsetOptions) -> LoadSubsetOptions {
    let where_clause = match (&a.r#where, &b.r#where) {
        (Some(x), Some(y)) => Some(intersect(x, y)),
        (Some(x), None) => Some(x.clone()),
        (None, Some(y)) => Some(y.clone()),
        (None, None) => None,
    };
    let order_by = if !a.order_by.is_empty() { a.order_by.clone() } else { b.order_by.clone() };
    let limit = match (a.limit, b.limit) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    };
    LoadSubsetOptions { r#where: where_clause, order_by, limit }
}

pub fn union_options(a: &LoadSubsetOptions, b: &LoadSubsetOptions) -> LoadSubsetOptions {
    let where_clause = match (&a.r#where, &b.r#where) {
        (Some(x), Some(y)) => Some(union(x, y)),
        _ => None,
    };
    let order_by = if a.order_by == b.order_by { a.order_by.clone() } else { Vec::new() };
    let limit = match (a.limit, b.limit) {
        (Some(x), Some(y)) => Some(x.min(y)),
        _ => None,
    };
    LoadSubsetOptions { r#where: where_clause, order_by, limit }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn age_gt(n: f64) -> Expr {
        Expr::Func { name: "gt".into(), args: vec![Expr::Ref(PropRef::new("u", ["age"])), Expr::Value(Value::Number(n))] }
    }

    #[test]
    fn tighter_range_is_a_subset_of_looser_range() {
        assert!(is_subset(&age_gt(30.0), &age_gt(18.0)));
        assert!(!is_subset(&age_gt(18.0), &age_gt(30.0)));
    }

    #[test]
    fn eq_implies_in_containing_it() {
        let eq = Expr::Func { name: "eq".into(), args: vec![Expr::Ref(PropRef::new("u", ["status"])), Expr::Value(Value::String("active".into()))] };
        let in_expr = Expr::Func {
            name: "in".into(),
            args: vec![
                Expr::Ref(PropRef::new("u", ["status"])),
                Expr::Value(Value::Array(vec![Value::String("active".into()), Value::String("pending".into())])),
            ],
        };
        assert!(is_subset(&eq, &in_expr));
    }

    #[test]
    fn minus_factors_common_conjunct() {
        let a = Expr::and(vec![age_gt(18.0), age_gt(0.0)]);
        let b = Expr::and(vec![age_gt(18.0), age_gt(65.0)]);
        let diff = minus(&a, &b);
        // a - b should not be a trivial contradiction: 20 matches a but not b.
        assert_ne!(diff, Expr::Value(Value::Bool(false)));
    }

    #[test]
    fn contradictory_filter_is_subset_of_anything() {
        assert!(is_subset(&Expr::Value(Value::Bool(false)), &age_gt(5.0)));
    }

    fn status_eq(s: &str) -> Expr {
        Expr::Func { name: "eq".into(), args: vec![Expr::Ref(PropRef::new("t", ["status"])), Expr::Value(Value::String(s.into()))] }
    }

    #[test]
    fn disjoint_eq_on_same_path_is_a_contradiction() {
        assert_eq!(intersect(&status_eq("open"), &status_eq("closed")), Expr::Value(Value::Bool(false)));
    }

    #[test]
    fn eq_union_eq_on_same_path_becomes_in() {
        let combined = union(&status_eq("open"), &status_eq("closed"));
        assert_eq!(
            combined,
            Expr::Func {
                name: "in".into(),
                args: vec![
                    Expr::Ref(PropRef::new("t", ["status"])),
                    Expr::Value(Value::Array(vec![Value::String("open".into()), Value::String("closed".into())])),
                ],
            }
        );
    }

    #[test]
    fn same_direction_ranges_collapse_to_the_tighter_or_looser_bound() {
        assert_eq!(intersect(&age_gt(18.0), &age_gt(30.0)), age_gt(30.0));
        assert_eq!(union(&age_gt(18.0), &age_gt(30.0)), age_gt(18.0));
    }

    #[test]
    fn opposite_direction_ranges_do_not_collapse() {
        let lower = age_gt(18.0);
        let upper = Expr::Func { name: "lt".into(), args: vec![Expr::Ref(PropRef::new("u", ["age"])), Expr::Value(Value::Number(65.0))] };
        let combined = intersect(&lower, &upper);
        assert_eq!(combined, Expr::and(vec![lower, upper]));
    }
}
