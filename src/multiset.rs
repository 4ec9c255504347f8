//! Multiset: a signed-multiplicity container of `(row, n)` pairs (§3, §4.1).
//!
//! This plays the role `differential-dataflow::consolidation` plays for its
//! own `Vec<(T, R)>` update batches, but where that crate sorts by `Ord`
//! (its rows are typically small `Ord` keys), our rows have no total order —
//! only structural equality via `crate::hash` — so consolidation here groups
//! by structural hash first and then by structural equality within a hash
//! bucket, rather than sorting.

use crate::hash::{hash, structural_eq};
use crate::row::Row;
use fnv::FnvHashMap;
use std::fmt;

/// A signed multiplicity. Positive means the row is present that many
/// times; negative means it has been retracted that many times.
pub type Multiplicity = i64;

/// An ordered sequence of `(row, multiplicity)` pairs (§3). Not
/// automatically consolidated — call [`Multiset::consolidate_in_place`]
/// when the invariant (at most one entry per distinct row, no zero entries)
/// is needed.
#[derive(Debug, Clone, Default)]
pub struct Multiset<T = Row> {
    entries: Vec<(T, Multiplicity)>,
}

impl<T> Multiset<T> {
    pub fn new() -> Self {
        Multiset { entries: Vec::new() }
    }

    pub fn push(&mut self, row: T, m: Multiplicity) {
        if m != 0 {
            self.entries.push((row, m));
        }
    }

    pub fn extend(&mut self, other: Multiset<T>) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(T, Multiplicity)> {
        self.entries.iter()
    }

    pub fn into_iter(self) -> impl Iterator<Item = (T, Multiplicity)> {
        self.entries.into_iter()
    }

    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Multiset<U> {
        Multiset {
            entries: self.entries.into_iter().map(|(row, m)| (f(row), m)).collect(),
        }
    }

    pub fn filter(self, mut p: impl FnMut(&T) -> bool) -> Multiset<T> {
        Multiset {
            entries: self.entries.into_iter().filter(|(row, _)| p(row)).collect(),
        }
    }

    /// Multiplies every multiplicity by `-1` (§4.1).
    pub fn negate(mut self) -> Multiset<T> {
        for (_, m) in self.entries.iter_mut() {
            *m = -*m;
        }
        self
    }

    pub fn from_vec(entries: Vec<(T, Multiplicity)>) -> Self {
        Multiset { entries }
    }

    pub fn into_vec(self) -> Vec<(T, Multiplicity)> {
        self.entries
    }
}

impl<T: Clone> Multiset<T> {
    /// A consolidated copy: at most one entry per distinct row, no
    /// zero-multiplicity entries.
    pub fn consolidated(&self, structural_hash: impl Fn(&T) -> u64, eq: impl Fn(&T, &T) -> bool) -> Multiset<T> {
        let mut clone = self.clone();
        clone.consolidate_in_place_with(structural_hash, eq);
        clone
    }
}

impl<T> Multiset<T> {
    /// Consolidates in place using caller-supplied hash/eq functions —
    /// generic over `T` so non-`Row` payloads (join tuples, group keys) can
    /// reuse the same algorithm.
    pub fn consolidate_in_place_with(&mut self, structural_hash: impl Fn(&T) -> u64, eq: impl Fn(&T, &T) -> bool) {
        if self.entries.len() <= 1 {
            self.entries.retain(|(_, m)| *m != 0);
            return;
        }
        let mut buckets: FnvHashMap<u64, Vec<usize>> = FnvHashMap::default();
        for (i, (row, _)) in self.entries.iter().enumerate() {
            buckets.entry(structural_hash(row)).or_default().push(i);
        }
        let mut consolidated: Vec<(T, Multiplicity)> = Vec::with_capacity(self.entries.len());
        let mut taken = vec![false; self.entries.len()];
        let mut owned: Vec<Option<(T, Multiplicity)>> = std::mem::take(&mut self.entries).into_iter().map(Some).collect();
        for (_, indices) in buckets {
            for &i in &indices {
                if taken[i] {
                    continue;
                }
                let (row_i, mut sum) = owned[i].take().unwrap();
                taken[i] = true;
                for &j in &indices {
                    if j == i || taken[j] {
                        continue;
                    }
                    if let Some((row_j, m_j)) = &owned[j] {
                        if eq(&row_i, row_j) {
                            sum += *m_j;
                            owned[j] = None;
                            taken[j] = true;
                        }
                    }
                }
                if sum != 0 {
                    consolidated.push((row_i, sum));
                }
            }
        }
        self.entries = consolidated;
    }
}

impl Multiset<Row> {
    /// Consolidates a multiset of [`Row`]s using the crate's structural
    /// hasher (§4.1).
    pub fn consolidate_in_place(&mut self) {
        self.consolidate_in_place_with(
            |row| hash(&row.0).unwrap_or(0),
            |a, b| structural_eq(&a.0, &b.0),
        );
    }
}

impl<T> FromIterator<(T, Multiplicity)> for Multiset<T> {
    fn from_iter<I: IntoIterator<Item = (T, Multiplicity)>>(iter: I) -> Self {
        Multiset {
            entries: iter.into_iter().filter(|(_, m)| *m != 0).collect(),
        }
    }
}

impl<T> IntoIterator for Multiset<T> {
    type Item = (T, Multiplicity);
    type IntoIter = std::vec::IntoIter<(T, Multiplicity)>;
    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<T: fmt::Debug> fmt::Display for Multiset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Multiset[")?;
        for (i, (row, m)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{row:?}@{m}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;

    fn row(n: i64) -> Row {
        Row::new(Value::Number(n as f64))
    }

    #[test]
    fn consolidate_merges_duplicates() {
        let mut m = Multiset::new();
        m.push(row(1), 2);
        m.push(row(1), -1);
        m.push(row(2), 3);
        m.push(row(1), -1);
        m.consolidate_in_place();
        let mut out: Vec<_> = m.into_iter().collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, 3);
    }

    #[test]
    fn consolidate_drops_zero_sums() {
        let mut m = Multiset::new();
        m.push(row(1), 1);
        m.push(row(1), -1);
        m.consolidate_in_place();
        assert!(m.is_empty());
    }

    #[test]
    fn consolidate_idempotent() {
        let mut m = Multiset::new();
        m.push(row(1), 2);
        m.push(row(1), 3);
        m.push(row(2), -4);
        m.consolidate_in_place();
        let once = m.clone();
        m.consolidate_in_place();
        assert_eq!(once.len(), m.len());
        for (row, mult) in once.iter() {
            assert!(m.iter().any(|(r2, m2)| structural_eq(&row.0, &r2.0) && mult == m2));
        }
    }

    #[test]
    fn negate_flips_sign() {
        let mut m = Multiset::new();
        m.push(row(1), 3);
        let negated = m.clone().negate();
        assert_eq!(negated.into_iter().next().unwrap().1, -3);
        let _ = m.len();
    }
}
