//! Property-based tests for the primitives every operator leans on:
//! structural hashing and multiset consolidation must behave the same
//! regardless of insertion order, since the graph runtime processes
//! batches in arbitrary internal grouping.

use d2db_core::row::Value;
use d2db_core::hash::{hash, structural_eq};
use proptest::prelude::*;

fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| Value::Number(n as f64)),
        "[a-z]{0,8}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 16, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,4}", inner), 0..4).prop_map(Value::Object),
        ]
    })
}

proptest! {
    /// Hashing the same value twice is always consistent (§4.2).
    #[test]
    fn hash_is_deterministic(v in arb_value()) {
        prop_assert_eq!(hash(&v).unwrap(), hash(&v).unwrap());
    }

    /// Structural equality is reflexive for every generated value.
    #[test]
    fn structural_eq_is_reflexive(v in arb_value()) {
        prop_assert!(structural_eq(&v, &v));
    }

    /// Shuffling an object's field order never changes its hash or its
    /// structural-equality outcome against the original (§4.2: "commutative
    /// field mixing").
    #[test]
    fn object_field_order_is_irrelevant(
        fields in prop::collection::vec(("[a-z]{1,4}", any::<i32>()), 1..6)
    ) {
        let original = Value::Object(fields.iter().map(|(k, v)| (k.clone(), Value::Number(*v as f64))).collect());
        let mut reversed_fields = fields.clone();
        reversed_fields.reverse();
        let reversed = Value::Object(reversed_fields.into_iter().map(|(k, v)| (k, Value::Number(v as f64))).collect());

        prop_assert_eq!(hash(&original).unwrap(), hash(&reversed).unwrap());
        prop_assert!(structural_eq(&original, &reversed));
    }

    /// Reordering an array's elements must NOT be treated as equal unless
    /// the arrays are actually identical element-for-element (§4.2: arrays
    /// are order-sensitive, unlike objects).
    #[test]
    fn array_permutation_changes_hash_unless_palindromic(
        a in any::<i32>(), b in any::<i32>()
    ) {
        prop_assume!(a != b);
        let forward = Value::Array(vec![Value::Number(a as f64), Value::Number(b as f64)]);
        let backward = Value::Array(vec![Value::Number(b as f64), Value::Number(a as f64)]);
        prop_assert_ne!(hash(&forward).unwrap(), hash(&backward).unwrap());
        prop_assert!(!structural_eq(&forward, &backward));
    }
}
