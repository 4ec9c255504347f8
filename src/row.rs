//! The row data model (§3).
//!
//! A [`Row`] is an opaque, immutable record. The core never inspects a row's
//! shape directly; it always goes through an application-supplied
//! `get_key(row) -> Key` and through the IR evaluator (`crate::ir`) for
//! anything expression-shaped. [`Value`] is the closed set of primitive and
//! structured kinds the hasher (`crate::hash`) and the expression evaluator
//! both understand.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A primitive key extracted from a row by `get_key`. Only strings and
/// integers are valid keys (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Key {
    String(String),
    Int(i64),
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Key::String(a), Key::String(b)) => a == b,
            (Key::Int(a), Key::Int(b)) => a == b,
            _ => false,
        }
    }
}
impl Eq for Key {}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Key::String(s) => {
                0u8.hash(state);
                s.hash(state);
            }
            Key::Int(i) => {
                1u8.hash(state);
                i.hash(state);
            }
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Int(a), Key::Int(b)) => a.cmp(b),
            (Key::String(_), Key::Int(_)) => Ordering::Greater,
            (Key::Int(_), Key::String(_)) => Ordering::Less,
        }
    }
}
impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}
impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}
impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::String(s) => write!(f, "{s}"),
            Key::Int(i) => write!(f, "{i}"),
        }
    }
}

/// The closed value model the hasher and the IR evaluator agree on (§3,
/// §4.2, §4.6). `Null` stands in for both the source's `null` and its
/// `undefined`-analog: absent is absent, there is nothing downstream that
/// distinguishes the two.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Epoch milliseconds, per the hasher contract (§4.2).
    Date(i64),
    Array(Vec<Value>),
    /// Insertion order is preserved for round-tripping; the hasher sorts by
    /// field name before mixing (§4.2), so order here is not semantically
    /// significant.
    Object(Vec<(String, Value)>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        crate::hash::structural_eq(self, other)
    }
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.iter().find(|(k, _)| k == field).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Walks a dotted path (`PropRef`, §3) starting from this value.
    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        let mut cur = self;
        for seg in path {
            cur = cur.get(seg)?;
        }
        Some(cur)
    }

    /// Extracts a [`Key`] from this value if it is a primitive key type.
    pub fn as_key(&self) -> Option<Key> {
        match self {
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Number(n) if n.fract() == 0.0 => Some(Key::Int(*n as i64)),
            _ => None,
        }
    }
}

impl From<Key> for Value {
    fn from(k: Key) -> Self {
        match k {
            Key::String(s) => Value::String(s),
            Key::Int(i) => Value::Number(i as f64),
        }
    }
}

/// An opaque immutable record (§3). Structural equality (used by
/// consolidation and indexing) is defined over the wrapped [`Value`] via
/// `crate::hash`, not Rust's derived equality: rows have no `Ord`, and
/// structural hashing is what disambiguates them when identity alone
/// doesn't (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row(pub Value);

impl Row {
    pub fn new(v: Value) -> Self {
        Row(v)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        self.0.get_path(path)
    }
}

/// Application-supplied key extractor, required by every [`crate::collection::Collection`].
pub type GetKey = std::sync::Arc<dyn Fn(&Row) -> Key + Send + Sync>;
