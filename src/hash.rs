//! Deterministic structural hashing of row values (§4.2).
//!
//! Differential dataflow operators need to co-locate rows that are
//! equivalent so their multiplicities can be consolidated and eventually
//! cancelled (see `crate::multiset`). Rust's `Eq`/`Hash` on our own [`Value`]
//! tree would already do this structurally, but normalization rules this
//! model needs (NaN canonicalization, `±0` folding, commutative field
//! mixing) go beyond what a derived `Hash` impl gives us, so this module
//! hand-rolls the mixer the way `differential-dataflow` hand-rolls its own
//! `Hashable` extraction in `hashable.rs` rather than leaning on `#[derive]`.
//!
//! The mixer is seeded FNV-1a, chosen for the same reason
//! `differential-dataflow` uses `fnv` internally: it is fast and its
//! quality is more than sufficient for a co-location hash, not a
//! cryptographic one.

use crate::error::D2Error;
use crate::row::Value;
use fnv::FnvHasher;
use std::hash::Hasher;

const SEED_ARRAY: u64 = 0x9e37_79b9_7f4a_7c15;
const SEED_OBJECT: u64 = 0xc2b2_ae3d_27d4_eb4f;
const SEED_FIELD: u64 = 0x1656_67b1_9e37_79f9;

/// Computes the structural hash of `value`, per §4.2.
///
/// Returns [`D2Error::UnsupportedValueKind`] for value kinds the model
/// cannot represent (there are none reachable through [`Value`] today; the
/// error exists for forward compatibility with a `Function` variant some
/// adapters may want to reject explicitly) and [`D2Error::CyclicValue`] if a
/// cycle is detected. `Value` trees built through this crate's constructors
/// are acyclic by construction (there is no interior mutability), so the
/// cycle check is a depth guard against pathological input rather than a
/// live concern.
pub fn hash(value: &Value) -> Result<u64, D2Error> {
    hash_inner(value, 0)
}

const MAX_DEPTH: usize = 512;

fn hash_inner(value: &Value, depth: usize) -> Result<u64, D2Error> {
    if depth > MAX_DEPTH {
        return Err(D2Error::CyclicValue);
    }
    let mut h = FnvHasher::default();
    match value {
        Value::Null => h.write_u8(0),
        Value::Bool(b) => {
            h.write_u8(1);
            h.write_u8(*b as u8);
        }
        Value::Number(n) => {
            h.write_u8(2);
            h.write_u64(normalize_number(*n));
        }
        Value::String(s) => {
            h.write_u8(3);
            h.write(s.as_bytes());
        }
        Value::Date(millis) => {
            h.write_u8(4);
            h.write_i64(*millis);
        }
        Value::Array(items) => {
            h.write_u8(5);
            let mut acc = SEED_ARRAY;
            for (i, item) in items.iter().enumerate() {
                let item_hash = hash_inner(item, depth + 1)?;
                acc = mix_ordered(acc, i as u64, item_hash);
            }
            h.write_u64(acc);
        }
        Value::Object(fields) => {
            h.write_u8(6);
            let mut sorted: Vec<&(String, Value)> = fields.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            let mut acc = SEED_OBJECT;
            for (name, field_value) in sorted {
                let field_hash = fnv_bytes(name.as_bytes()) ^ SEED_FIELD;
                let value_hash = hash_inner(field_value, depth + 1)?;
                // Commutative combination over the (field_hash, value_hash) pairs: field
                // order must not affect the result, only the multiset of pairs.
                acc ^= mix_ordered(field_hash, 0, value_hash);
            }
            h.write_u64(acc);
        }
    }
    Ok(h.finish())
}

fn fnv_bytes(bytes: &[u8]) -> u64 {
    let mut h = FnvHasher::default();
    h.write(bytes);
    h.finish()
}

/// Combines a position-dependent seed with an element hash; used for
/// order-sensitive array mixing.
fn mix_ordered(acc: u64, position: u64, element: u64) -> u64 {
    let mut h = FnvHasher::default();
    h.write_u64(acc);
    h.write_u64(position);
    h.write_u64(element);
    h.finish()
}

/// Canonicalizes `NaN` to a single bit pattern and folds `-0.0` into `0.0`
/// before hashing, per §4.2.
fn normalize_number(n: f64) -> u64 {
    let n = if n == 0.0 { 0.0 } else { n };
    if n.is_nan() {
        f64::NAN.to_bits()
    } else {
        n.to_bits()
    }
}

/// Structural equality derived from [`hash`] plus a value-level tie-break,
/// used wherever rows or keys need "structural hashing disambiguates"
/// semantics instead of pointer/derived equality (§3, §4.3).
pub fn structural_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => normalize_number(*x) == normalize_number(*y),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Date(x), Value::Date(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| structural_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            if x.len() != y.len() {
                return false;
            }
            let mut xs: Vec<&(String, Value)> = x.iter().collect();
            let mut ys: Vec<&(String, Value)> = y.iter().collect();
            xs.sort_by(|a, b| a.0.cmp(&b.0));
            ys.sort_by(|a, b| a.0.cmp(&b.0));
            xs.iter()
                .zip(ys.iter())
                .all(|((kx, vx), (ky, vy))| kx == ky && structural_eq(vx, vy))
        }
        _ => false,
    }
}
