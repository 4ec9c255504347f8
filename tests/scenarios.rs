//! End-to-end scenarios over `Collection` + `LiveQueryCollection`: filter
//! and select, equi-join with fan-out, group-by aggregation, and a
//! filtered top-k.

use d2db_core::{
    Collection, CollectionOptions, CollectionRef, Expr, FromClause, JoinClause, JoinKind,
    OrderByClause, PropRef, QueryIr, SelectField,
};
use d2db_core::ir::Direction;
use d2db_core::row::{GetKey, Key, Row, Value};
use d2db_core::LiveQueryCollection;
use fnv::FnvHashMap;
use std::sync::Arc;

fn obj(fields: Vec<(&str, Value)>) -> Row {
    Row::new(Value::Object(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()))
}

fn int_key(field: &str) -> GetKey {
    let field = field.to_string();
    Arc::new(move |r: &Row| Key::Int(r.get(&field).and_then(Value::as_f64).unwrap() as i64))
}

fn select(alias: &str, field: &str) -> SelectField {
    SelectField { alias: field.to_string(), expression: Expr::Ref(PropRef::new(alias, [field])) }
}

/// S1: filtering an `age > 18` live query over a users collection reflects
/// only qualifying rows, and adjusts as source rows cross the threshold.
#[test]
fn s1_filter_and_select() {
    let users = Collection::new(CollectionOptions::new(int_key("id")));
    users.insert(obj(vec![("id", Value::Number(1.0)), ("name", Value::String("Alice".into())), ("age", Value::Number(30.0))]));
    users.insert(obj(vec![("id", Value::Number(2.0)), ("name", Value::String("Bobby".into())), ("age", Value::Number(12.0))]));

    let query = QueryIr {
        from: FromClause::Collection(CollectionRef { collection: "users".into(), alias: "u".into() }),
        joins: vec![],
        r#where: Some(Expr::Func {
            name: "gt".into(),
            args: vec![Expr::Ref(PropRef::new("u", ["age"])), Expr::Value(Value::Number(18.0))],
        }),
        group_by: vec![],
        having: None,
        select: vec![select("u", "id"), select("u", "name")],
        order_by: vec![],
        limit: None,
        offset: None,
        distinct: false,
    };
    let mut sources = FnvHashMap::default();
    sources.insert("u".to_string(), users.clone());
    let lq = LiveQueryCollection::new(&query, sources).unwrap();

    assert_eq!(lq.output().size(), 1);

    // Bobby turns 19: now qualifies.
    users.update(Key::Int(2), obj(vec![("id", Value::Number(2.0)), ("name", Value::String("Bobby".into())), ("age", Value::Number(19.0))]));
    assert_eq!(lq.output().size(), 2);

    // Alice leaves: no longer qualifies for nothing, but deleting her row should retract it.
    users.delete(&Key::Int(1));
    assert_eq!(lq.output().size(), 1);
}

/// S2: an equi-join where one user has multiple posts must keep each
/// (user, post) pair as its own live row instead of collapsing them under
/// a shared join key (the fan-out / stable-key fix in the compiler).
#[test]
fn s2_equi_join_preserves_fan_out() {
    let users = Collection::new(CollectionOptions::new(int_key("id")));
    let posts = Collection::new(CollectionOptions::new(int_key("id")));
    users.insert(obj(vec![("id", Value::Number(1.0)), ("name", Value::String("Alice".into()))]));
    posts.insert(obj(vec![("id", Value::Number(10.0)), ("uid", Value::Number(1.0)), ("title", Value::String("first".into()))]));
    posts.insert(obj(vec![("id", Value::Number(11.0)), ("uid", Value::Number(1.0)), ("title", Value::String("second".into()))]));

    let query = QueryIr {
        from: FromClause::Collection(CollectionRef { collection: "users".into(), alias: "u".into() }),
        joins: vec![JoinClause {
            kind: JoinKind::Inner,
            from: CollectionRef { collection: "posts".into(), alias: "p".into() },
            on: Expr::eq_expr(Expr::Ref(PropRef::new("u", ["id"])), Expr::Ref(PropRef::new("p", ["uid"]))),
        }],
        r#where: None,
        group_by: vec![],
        having: None,
        select: vec![select("u", "name"), select("p", "title")],
        order_by: vec![],
        limit: None,
        offset: None,
        distinct: false,
    };
    let mut sources = FnvHashMap::default();
    sources.insert("u".to_string(), users.clone());
    sources.insert("p".to_string(), posts.clone());
    let lq = LiveQueryCollection::new(&query, sources).unwrap();

    // Both posts must surface as distinct rows, not collapsed into one.
    assert_eq!(lq.output().size(), 2);

    // Updating one post's title must retract+replace only that pair's row,
    // leaving the other post's row (and its key) untouched.
    let before: Vec<Key> = lq.output().entries().into_iter().map(|(k, _)| k).collect();
    posts.update(Key::Int(10), obj(vec![("id", Value::Number(10.0)), ("uid", Value::Number(1.0)), ("title", Value::String("first (edited)".into()))]));
    assert_eq!(lq.output().size(), 2);
    let after: Vec<Key> = lq.output().entries().into_iter().map(|(k, _)| k).collect();
    assert_eq!(
        before.iter().filter(|k| after.contains(k)).count(),
        1,
        "the untouched pair's key should still be present in the output after the edit"
    );
}

/// S3: group-by with count/sum aggregates recomputes per-group on every
/// change.
#[test]
fn s3_group_by_aggregate() {
    let orders = Collection::new(CollectionOptions::new(int_key("id")));
    orders.insert(obj(vec![("id", Value::Number(1.0)), ("customer", Value::String("a".into())), ("amount", Value::Number(10.0))]));
    orders.insert(obj(vec![("id", Value::Number(2.0)), ("customer", Value::String("a".into())), ("amount", Value::Number(5.0))]));
    orders.insert(obj(vec![("id", Value::Number(3.0)), ("customer", Value::String("b".into())), ("amount", Value::Number(7.0))]));

    let query = QueryIr {
        from: FromClause::Collection(CollectionRef { collection: "orders".into(), alias: "o".into() }),
        joins: vec![],
        r#where: None,
        group_by: vec![Expr::Ref(PropRef::new("o", ["customer"]))],
        having: None,
        select: vec![
            SelectField { alias: "customer".into(), expression: Expr::Ref(PropRef::new("o", ["customer"])) },
            SelectField { alias: "total".into(), expression: Expr::Aggregate { name: "sum".into(), args: vec![Expr::Ref(PropRef::new("o", ["amount"]))] } },
            SelectField { alias: "n".into(), expression: Expr::Aggregate { name: "count".into(), args: vec![] } },
        ],
        order_by: vec![],
        limit: None,
        offset: None,
        distinct: false,
    };
    let mut sources = FnvHashMap::default();
    sources.insert("o".to_string(), orders.clone());
    let lq = LiveQueryCollection::new(&query, sources).unwrap();

    assert_eq!(lq.output().size(), 2);
    let group_a = lq
        .output()
        .entries()
        .into_iter()
        .map(|(_, row)| row)
        .find(|row| row.get("customer").and_then(Value::as_str) == Some("a"))
        .unwrap();
    assert_eq!(group_a.get("total").and_then(Value::as_f64), Some(15.0));
    assert_eq!(group_a.get("n").and_then(Value::as_f64), Some(2.0));

    orders.insert(obj(vec![("id", Value::Number(4.0)), ("customer", Value::String("a".into())), ("amount", Value::Number(100.0))]));
    let group_a = lq
        .output()
        .entries()
        .into_iter()
        .map(|(_, row)| row)
        .find(|row| row.get("customer").and_then(Value::as_str) == Some("a"))
        .unwrap();
    assert_eq!(group_a.get("total").and_then(Value::as_f64), Some(115.0));
}

/// S4: a filtered top-k must replace an evicted row with the next
/// qualifying one, even when the filter has exhausted all obviously
/// qualifying candidates already seen.
#[test]
fn s4_top_k_with_filter_exhaustion() {
    let scores = Collection::new(CollectionOptions::new(int_key("id")));
    for (id, score) in [(1, 50.0), (2, 40.0), (3, 30.0)] {
        scores.insert(obj(vec![("id", Value::Number(id as f64)), ("score", Value::Number(score))]));
    }

    let query = QueryIr {
        from: FromClause::Collection(CollectionRef { collection: "scores".into(), alias: "s".into() }),
        joins: vec![],
        r#where: Some(Expr::Func { name: "gt".into(), args: vec![Expr::Ref(PropRef::new("s", ["score"])), Expr::Value(Value::Number(25.0))] }),
        group_by: vec![],
        having: None,
        select: vec![select("s", "id"), select("s", "score")],
        order_by: vec![OrderByClause { expression: Expr::Ref(PropRef::new("s", ["score"])), direction: Direction::Desc, compare_options: Default::default() }],
        limit: Some(2),
        offset: None,
        distinct: false,
    };
    let mut sources = FnvHashMap::default();
    sources.insert("s".to_string(), scores.clone());
    let lq = LiveQueryCollection::new(&query, sources).unwrap();

    assert_eq!(lq.output().size(), 2);
    let top_scores: Vec<f64> = lq.output().entries().into_iter().filter_map(|(_, r)| r.get("score").and_then(Value::as_f64)).collect();
    assert!(top_scores.contains(&50.0) && top_scores.contains(&40.0));

    // Drop the top score below the window, and below the filter threshold
    // for one more candidate at the same time: the window must backfill
    // from id 3 (score 30), the only remaining qualifying row.
    scores.update(Key::Int(1), obj(vec![("id", Value::Number(1.0)), ("score", Value::Number(5.0))]));
    assert_eq!(lq.output().size(), 2);
    let top_scores: Vec<f64> = lq.output().entries().into_iter().filter_map(|(_, r)| r.get("score").and_then(Value::as_f64)).collect();
    assert!(top_scores.contains(&40.0) && top_scores.contains(&30.0));
}
