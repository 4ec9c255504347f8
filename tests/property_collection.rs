//! Property test for `Collection`: applying any sequence of insert/update/
//! delete operations through a sync session must leave the collection's
//! snapshot equal to replaying that same sequence against a plain `HashMap`
//! (§4.8's `begin_sync`/`write`/`commit` session is just a staged apply).

use d2db_core::change::ChangeMessage;
use d2db_core::row::{GetKey, Key, Row, Value};
use d2db_core::{Collection, CollectionOptions};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Insert(i64, i64),
    Update(i64, i64),
    Delete(i64),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..5, any::<i16>()).prop_map(|(id, v)| Op::Insert(id, v as i64)),
        (0i64..5, any::<i16>()).prop_map(|(id, v)| Op::Update(id, v as i64)),
        (0i64..5).prop_map(Op::Delete),
    ]
}

fn row_of(id: i64, value: i64) -> Row {
    Row::new(Value::Object(vec![("id".into(), Value::Number(id as f64)), ("value".into(), Value::Number(value as f64))]))
}

fn get_key() -> GetKey {
    Arc::new(|r: &Row| Key::Int(r.get("id").and_then(Value::as_f64).unwrap() as i64))
}

proptest! {
    #[test]
    fn sync_session_matches_reference_model(ops in prop::collection::vec(arb_op(), 0..40)) {
        let col = Collection::new(CollectionOptions::new(get_key()));
        let mut reference: HashMap<i64, i64> = HashMap::new();

        for op in &ops {
            col.begin_sync().unwrap();
            let messages = match *op {
                Op::Insert(id, v) => {
                    reference.insert(id, v);
                    vec![ChangeMessage::Insert { key: Key::Int(id), value: row_of(id, v) }]
                }
                Op::Update(id, v) => {
                    if reference.contains_key(&id) {
                        let prev = reference.insert(id, v).unwrap();
                        vec![ChangeMessage::Update { key: Key::Int(id), value: row_of(id, v), previous_value: row_of(id, prev) }]
                    } else {
                        reference.insert(id, v);
                        vec![ChangeMessage::Insert { key: Key::Int(id), value: row_of(id, v) }]
                    }
                }
                Op::Delete(id) => {
                    if let Some(prev) = reference.remove(&id) {
                        vec![ChangeMessage::Delete { key: Key::Int(id), value: row_of(id, prev) }]
                    } else {
                        vec![]
                    }
                }
            };
            col.write(messages).unwrap();
            col.commit().unwrap();
        }

        prop_assert_eq!(col.size(), reference.len());
        for (id, v) in &reference {
            let row = col.get(&Key::Int(*id)).expect("reference key missing from collection");
            prop_assert_eq!(row.get("value").and_then(Value::as_f64), Some(*v as f64));
        }
    }
}
