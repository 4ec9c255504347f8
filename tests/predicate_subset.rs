//! S5/S6: predicate-subset reasoning exercised through the crate's public
//! module path, independent of the unit tests inside `predicate.rs` itself.

use d2db_core::predicate::{intersect, intersect_options, is_subset, minus, union, union_options, LoadSubsetOptions};
use d2db_core::row::Value;
use d2db_core::{Expr, PropRef};

fn status_eq(s: &str) -> Expr {
    Expr::Func { name: "eq".into(), args: vec![Expr::Ref(PropRef::new("t", ["status"])), Expr::Value(Value::String(s.into()))] }
}

fn status_in(values: &[&str]) -> Expr {
    Expr::Func {
        name: "in".into(),
        args: vec![Expr::Ref(PropRef::new("t", ["status"])), Expr::Value(Value::Array(values.iter().map(|v| Value::String((*v).into())).collect()))],
    }
}

/// S5: a previously loaded broader subset already covers a newly requested
/// narrower one, so no additional fetch should be needed.
#[test]
fn s5_narrower_request_is_covered_by_existing_broader_one() {
    let already_loaded = status_in(&["open", "pending", "closed"]);
    let newly_requested = status_eq("open");
    assert!(is_subset(&newly_requested, &already_loaded));

    // The reverse does not hold: the broader set is not a subset of the
    // narrower one.
    assert!(!is_subset(&already_loaded, &newly_requested));
}

/// S6: combining two subset requests for the same cache entry either
/// detects a contradiction (the overlap is empty) or produces the correct
/// combined filter.
#[test]
fn s6_intersection_and_contradiction() {
    let assigned_to_alice = Expr::Func { name: "eq".into(), args: vec![Expr::Ref(PropRef::new("t", ["assignee"])), Expr::Value(Value::String("alice".into()))] };
    let assigned_to_bob = Expr::Func { name: "eq".into(), args: vec![Expr::Ref(PropRef::new("t", ["assignee"])), Expr::Value(Value::String("bob".into()))] };

    // Two disjoint single-value equalities on the same field can't both hold.
    let combined = intersect(&assigned_to_alice, &assigned_to_bob);
    assert_eq!(combined, Expr::Value(Value::Bool(false)));

    // The same two equalities, unioned instead, combine into an `in` set.
    let either = union(&assigned_to_alice, &assigned_to_bob);
    assert!(is_subset(&assigned_to_alice, &either));
    assert!(is_subset(&assigned_to_bob, &either));

    // An explicit contradiction (already-false filter) intersected with
    // anything stays false, and is a subset of everything.
    let impossible = Expr::Value(Value::Bool(false));
    assert_eq!(intersect(&impossible, &assigned_to_alice), Expr::Value(Value::Bool(false)));
    assert!(is_subset(&impossible, &assigned_to_alice));

    // Removing a narrower eq from a broader in-set leaves a non-empty
    // remainder (e.g. "pending" is still allowed).
    let diff = minus(&status_in(&["open", "pending"]), &status_eq("open"));
    assert_ne!(diff, Expr::Value(Value::Bool(false)));

    let union_expr = union(&status_eq("open"), &status_eq("closed"));
    assert!(is_subset(&status_eq("open"), &union_expr));
    assert!(is_subset(&status_eq("closed"), &union_expr));
}

#[test]
fn load_subset_options_intersect_and_union() {
    let a = LoadSubsetOptions { r#where: Some(status_eq("open")), order_by: vec![], limit: Some(10) };
    let b = LoadSubsetOptions { r#where: Some(status_in(&["open", "closed"])), order_by: vec![], limit: Some(5) };

    let intersected = intersect_options(&a, &b);
    assert_eq!(intersected.limit, Some(5));
    assert!(intersected.r#where.is_some());

    let unioned = union_options(&a, &b);
    // Limits differ in source specificity but both are specified: union
    // keeps the smaller as the only limit it can still guarantee.
    assert_eq!(unioned.limit, Some(5));
}
