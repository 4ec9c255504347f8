//! Tiered keyed index used by join and reduce (§3, §4.3).
//!
//! This is the systems-language analogue of `differential-dataflow`'s
//! arranged traces (its `trace/` module keeps a key -> `(val, time, diff)`
//! structure with its own tiering between flat and hierarchical layouts).
//! Our rows have no `Ord`, only the structural hash from `crate::hash`, so
//! where `trace/layers` tiers on sorted runs, this index tiers on "how many
//! distinct values share a key" and whether those values decompose into a
//! `[prefix, remainder]` shape, per §4.3.
//!
//! An `Index` is owned exclusively by the operator that built it (the join
//! or reduce operator in `crate::graph::operators`); there is no sharing
//! across operator invocations.

use crate::error::D2Error;
use crate::multiset::{Multiplicity, Multiset};
use crate::row::Key;
use fnv::FnvHashMap;
use std::sync::Arc;

/// How to derive a structural hash and equality for `T`, and — optionally —
/// how to split a value into a `(prefix_key, remainder)` pair for the
/// prefix-map tier (§4.3). Types that never carry a prefix (the common
/// case) just return `None` from `split_prefix`.
pub struct ValueOps<T> {
    pub hash: Arc<dyn Fn(&T) -> u64 + Send + Sync>,
    pub eq: Arc<dyn Fn(&T, &T) -> bool + Send + Sync>,
    pub split_prefix: Arc<dyn Fn(&T) -> Option<(Key, T)> + Send + Sync>,
}

impl<T> Clone for ValueOps<T> {
    fn clone(&self) -> Self {
        ValueOps {
            hash: self.hash.clone(),
            eq: self.eq.clone(),
            split_prefix: self.split_prefix.clone(),
        }
    }
}

impl<T: 'static> ValueOps<T> {
    /// Builds a `ValueOps` for a type with no prefix structure: always a
    /// value-map (or single slot) on upgrade, never a prefix map.
    pub fn flat(hash: impl Fn(&T) -> u64 + Send + Sync + 'static, eq: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        ValueOps {
            hash: Arc::new(hash),
            eq: Arc::new(eq),
            split_prefix: Arc::new(|_| None),
        }
    }
}

/// One hash bucket inside a value-map: entries whose values hash the same,
/// disambiguated by the supplied equality function.
type Bucket<T> = Vec<(T, Multiplicity)>;

enum Slot<T> {
    Single(T, Multiplicity),
    ValueMap(FnvHashMap<u64, Bucket<T>>),
    /// `prefix_key -> value-map of remainders` (§4.3): the prefix format is
    /// single-level, so a prefix map's leaves are always value-maps, never
    /// nested prefix maps.
    PrefixMap(FnvHashMap<Key, FnvHashMap<u64, Bucket<T>>>),
}

impl<T> Slot<T> {
    fn is_empty(&self) -> bool {
        match self {
            Slot::Single(_, m) => *m == 0,
            Slot::ValueMap(buckets) => buckets.values().all(|b| b.is_empty()),
            Slot::PrefixMap(prefixes) => prefixes.values().all(|vm| vm.values().all(|b| b.is_empty())),
        }
    }
}

/// A `Key -> multiset of T` mapping with the tiered storage described in
/// §4.3.
pub struct Index<T> {
    ops: ValueOps<T>,
    map: FnvHashMap<Key, Slot<T>>,
}

impl<T: Clone> Index<T> {
    pub fn new(ops: ValueOps<T>) -> Self {
        Index { ops, map: FnvHashMap::default() }
    }

    pub fn has(&self, key: &Key) -> bool {
        self.map.contains_key(key)
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    /// Iterates the `(value, multiplicity)` pairs stored under `key`.
    pub fn get(&self, key: &Key) -> Vec<(&T, Multiplicity)> {
        match self.map.get(key) {
            None => Vec::new(),
            Some(Slot::Single(v, m)) => vec![(v, *m)],
            Some(Slot::ValueMap(buckets)) => buckets.values().flat_map(|b| b.iter().map(|(v, m)| (v, *m))).collect(),
            Some(Slot::PrefixMap(prefixes)) => prefixes
                .values()
                .flat_map(|vm| vm.values().flat_map(|b| b.iter().map(|(v, m)| (v, *m))))
                .collect(),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.map.keys()
    }

    /// Adds `(value, m)` under `key`. A zero multiplicity is a no-op; a
    /// negative multiplicity against an existing entry subtracts, removing
    /// the entry if the sum reaches zero (§4.3).
    pub fn add_value(&mut self, key: Key, value: T, m: Multiplicity) -> Result<(), D2Error> {
        if m == 0 {
            return Ok(());
        }
        let remove_key = {
            let ops = self.ops.clone();
            let slot = self.map.entry(key.clone()).or_insert_with(|| Slot::Single(value.clone(), 0));
            Self::add_to_slot(slot, &ops, value, m)?;
            slot.is_empty()
        };
        if remove_key {
            self.map.remove(&key);
        }
        Ok(())
    }

    fn add_to_slot(slot: &mut Slot<T>, ops: &ValueOps<T>, value: T, m: Multiplicity) -> Result<(), D2Error> {
        match slot {
            Slot::Single(existing, existing_m) => {
                if *existing_m == 0 {
                    *existing = value;
                    *existing_m = m;
                    return Ok(());
                }
                if (ops.eq)(existing, &value) {
                    *existing_m += m;
                    return Ok(());
                }
                // Second distinct value: upgrade the tier (§4.3).
                let first = (existing.clone(), *existing_m);
                let upgraded = Self::upgrade_pair(ops, first, (value, m));
                *slot = upgraded;
                Ok(())
            }
            Slot::ValueMap(buckets) => {
                Self::add_to_bucket_map(buckets, ops, value, m);
                Ok(())
            }
            Slot::PrefixMap(prefixes) => {
                let Some((prefix_key, remainder)) = (ops.split_prefix)(&value) else {
                    return Err(D2Error::IndexInvariant(
                        "value without a prefix reached a prefix-map slot".to_string(),
                    ));
                };
                let bucket_map = prefixes.entry(prefix_key).or_default();
                Self::add_to_bucket_map(bucket_map, ops, remainder, m);
                Ok(())
            }
        }
    }

    fn add_to_bucket_map(buckets: &mut FnvHashMap<u64, Bucket<T>>, ops: &ValueOps<T>, value: T, m: Multiplicity) {
        let h = (ops.hash)(&value);
        let bucket = buckets.entry(h).or_default();
        if let Some(slot) = bucket.iter_mut().find(|(v, _)| (ops.eq)(v, &value)) {
            slot.1 += m;
            if slot.1 == 0 {
                bucket.retain(|(_, mm)| *mm != 0);
            }
        } else {
            bucket.push((value, m));
        }
    }

    fn upgrade_pair(ops: &ValueOps<T>, a: (T, Multiplicity), b: (T, Multiplicity)) -> Slot<T> {
        let prefix_a = (ops.split_prefix)(&a.0);
        let prefix_b = (ops.split_prefix)(&b.0);
        match (prefix_a, prefix_b) {
            (Some((pa, ra)), Some((pb, rb))) => {
                // Both values decompose into a prefix: sub-key by prefix. If
                // `pa == pb` they land in the same value-map leaf and are
                // merged/disambiguated there by remainder hash, per §4.3.
                let mut prefixes: FnvHashMap<Key, FnvHashMap<u64, Bucket<T>>> = FnvHashMap::default();
                Self::add_to_bucket_map(prefixes.entry(pa).or_default(), ops, ra, a.1);
                Self::add_to_bucket_map(prefixes.entry(pb).or_default(), ops, rb, b.1);
                Slot::PrefixMap(prefixes)
            }
            _ => {
                // At least one value has no prefix: fall back to a flat
                // value-map keyed by structural hash of the whole value.
                let mut buckets: FnvHashMap<u64, Bucket<T>> = FnvHashMap::default();
                Self::add_to_bucket_map(&mut buckets, ops, a.0, a.1);
                Self::add_to_bucket_map(&mut buckets, ops, b.0, b.1);
                Slot::ValueMap(buckets)
            }
        }
    }

    /// Merges `other` into `self`.
    pub fn append(&mut self, other: Index<T>) -> Result<(), D2Error> {
        for (key, slot) in other.map {
            match slot {
                Slot::Single(v, m) => self.add_value(key, v, m)?,
                Slot::ValueMap(buckets) => {
                    for (_, bucket) in buckets {
                        for (v, m) in bucket {
                            self.add_value(key.clone(), v, m)?;
                        }
                    }
                }
                Slot::PrefixMap(prefixes) => {
                    for (_, buckets) in prefixes {
                        for (_, bucket) in buckets {
                            for (v, m) in bucket {
                                self.add_value(key.clone(), v, m)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// A quick tier census for operational visibility (§ SPEC_FULL ambient
    /// additions): counts of keys currently in each tier.
    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats::default();
        for slot in self.map.values() {
            match slot {
                Slot::Single(..) => stats.single += 1,
                Slot::ValueMap(..) => stats.value_map += 1,
                Slot::PrefixMap(..) => stats.prefix_map += 1,
            }
        }
        stats
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub single: usize,
    pub value_map: usize,
    pub prefix_map: usize,
}

impl<T: Clone + 'static> Index<T> {
    /// Equi-join on key: the cartesian product of values sharing a key,
    /// with multiplicity `m1 * m2`. Iterates the smaller side first (§4.3,
    /// §4.4) purely for the constant-factor win; the result is identical
    /// either way (commutative up to tuple order, §8 property 4).
    pub fn join<T2: Clone + 'static>(&self, other: &Index<T2>) -> Multiset<(Key, (T, T2))> {
        let mut out = Multiset::new();
        if self.size() <= other.size() {
            for (key, slot) in &self.map {
                if let Some(other_slot) = other.map.get(key) {
                    for (lv, lm) in Self::iter_slot(slot) {
                        for (rv, rm) in Index::<T2>::iter_slot(other_slot) {
                            let m = lm * rm;
                            if m != 0 {
                                out.push((key.clone(), (lv.clone(), rv.clone())), m);
                            }
                        }
                    }
                }
            }
        } else {
            for (key, other_slot) in &other.map {
                if let Some(slot) = self.map.get(key) {
                    for (rv, rm) in Index::<T2>::iter_slot(other_slot) {
                        for (lv, lm) in Self::iter_slot(slot) {
                            let m = lm * rm;
                            if m != 0 {
                                out.push((key.clone(), (lv.clone(), rv.clone())), m);
                            }
                        }
                    }
                }
            }
        }
        out
    }

    fn iter_slot(slot: &Slot<T>) -> Vec<(&T, Multiplicity)> {
        match slot {
            Slot::Single(v, m) => vec![(v, *m)],
            Slot::ValueMap(buckets) => buckets.values().flat_map(|b| b.iter().map(|(v, m)| (v, *m))).collect(),
            Slot::PrefixMap(prefixes) => prefixes
                .values()
                .flat_map(|vm| vm.values().flat_map(|b| b.iter().map(|(v, m)| (v, *m))))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_ops() -> ValueOps<i64> {
        ValueOps::flat(|v| *v as u64, |a, b| a == b)
    }

    #[test]
    fn round_trip_sums_multiplicities() {
        let mut idx = Index::new(flat_ops());
        idx.add_value(Key::Int(1), 10, 2).unwrap();
        idx.add_value(Key::Int(1), 10, 3).unwrap();
        idx.add_value(Key::Int(1), 20, 1).unwrap();
        let mut values = idx.get(&Key::Int(1));
        values.sort();
        assert_eq!(values, vec![(&10, 5), (&20, 1)]);
    }

    #[test]
    fn empty_keys_are_absent() {
        let mut idx = Index::new(flat_ops());
        idx.add_value(Key::Int(1), 10, 2).unwrap();
        idx.add_value(Key::Int(1), 10, -2).unwrap();
        assert!(!idx.has(&Key::Int(1)));
        assert_eq!(idx.size(), 0);
    }

    #[test]
    fn zero_write_is_noop() {
        let mut idx = Index::new(flat_ops());
        idx.add_value(Key::Int(1), 10, 0).unwrap();
        assert!(!idx.has(&Key::Int(1)));
    }

    #[test]
    fn join_commutative_up_to_swap() {
        let mut l = Index::new(flat_ops());
        let mut r = Index::new(flat_ops());
        l.add_value(Key::Int(1), 1, 1).unwrap();
        l.add_value(Key::Int(1), 2, 1).unwrap();
        r.add_value(Key::Int(1), 100, 1).unwrap();

        let lr: Vec<_> = l.join(&r).into_iter().map(|((k, (a, b)), m)| (k, a, b, m)).collect();
        let rl: Vec<_> = r.join(&l).into_iter().map(|((k, (a, b)), m)| (k, b, a, m)).collect();
        let mut lr_sorted = lr.clone();
        let mut rl_sorted = rl.clone();
        lr_sorted.sort();
        rl_sorted.sort();
        assert_eq!(lr_sorted, rl_sorted);
    }

    #[test]
    fn value_map_upgrade_on_second_distinct_value() {
        let mut idx = Index::new(flat_ops());
        idx.add_value(Key::Int(1), 1, 1).unwrap();
        assert_eq!(idx.stats().single, 1);
        idx.add_value(Key::Int(1), 2, 1).unwrap();
        assert_eq!(idx.stats().value_map, 1);
    }
}
