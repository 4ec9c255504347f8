//! Operator library (§4.5): the tagged variant dispatched by
//! [`super::Graph::step`]. Per §9 ("dynamic dispatch over operators ...
//! there is no virtual inheritance"), this is a plain enum matched in
//! [`OperatorKind::run`], not a trait object.

use crate::change::ChangeMessage;
use crate::hash::{hash, structural_eq};
use crate::index::{Index, ValueOps};
use crate::ir::{Direction, OrderByClause};
use crate::multiset::{Multiplicity, Multiset};
use crate::row::{Key, Row, Value};
use fnv::FnvHashMap;
use std::cmp::Ordering;
use std::sync::Arc;

use super::Tuple;

type TupleFn = Arc<dyn Fn(&Tuple) -> Tuple + Send + Sync>;
type TuplePred = Arc<dyn Fn(&Tuple) -> bool + Send + Sync>;
type JoinMerge = Arc<dyn Fn(&Key, &Row, &Row) -> Row + Send + Sync>;
type ReduceFn = Arc<dyn Fn(&[(Row, Multiplicity)]) -> Row + Send + Sync>;

/// The tuple's structural identity: `hash(key) ^ hash(row)`, used wherever
/// an operator needs to deduplicate or diff whole tuples (distinct, top-k).
fn tuple_hash((key, row): &Tuple) -> u64 {
    let key_v: Value = key.clone().into();
    hash(&key_v).unwrap_or(0) ^ hash(&row.0).unwrap_or(0).rotate_left(1)
}

fn tuple_eq(a: &Tuple, b: &Tuple) -> bool {
    a.0 == b.0 && structural_eq(&a.1 .0, &b.1 .0)
}

fn row_ops() -> ValueOps<Row> {
    ValueOps::flat(|r: &Row| hash(&r.0).unwrap_or(0), |a: &Row, b: &Row| structural_eq(&a.0, &b.0))
}

pub enum OperatorKind {
    Map(TupleFn),
    Filter(TuplePred),
    Distinct(DistinctState),
    Consolidate,
    Negate,
    Concat,
    Join(JoinState),
    GroupReduce(GroupReduceState),
    TopK(TopKState),
    Output(OutputState),
}

impl OperatorKind {
    pub fn new_map(f: impl Fn(&Tuple) -> Tuple + Send + Sync + 'static) -> Self {
        OperatorKind::Map(Arc::new(f))
    }

    pub fn new_filter(p: impl Fn(&Tuple) -> bool + Send + Sync + 'static) -> Self {
        OperatorKind::Filter(Arc::new(p))
    }

    pub fn new_distinct() -> Self {
        OperatorKind::Distinct(DistinctState::default())
    }

    pub fn new_join(merge: impl Fn(&Key, &Row, &Row) -> Row + Send + Sync + 'static) -> Self {
        Self::new_join_with_kind(merge, crate::ir::JoinKind::Inner, None, None)
    }

    /// Outer-join variant (§4.7 step 2): `left_outer`/`right_outer` build the
    /// null-filled counterpart row for an unmatched left/right row, and are
    /// only consulted when `kind` calls for that side.
    pub fn new_join_with_kind(
        merge: impl Fn(&Key, &Row, &Row) -> Row + Send + Sync + 'static,
        kind: crate::ir::JoinKind,
        left_outer: Option<Arc<dyn Fn(&Key, &Row) -> Row + Send + Sync>>,
        right_outer: Option<Arc<dyn Fn(&Key, &Row) -> Row + Send + Sync>>,
    ) -> Self {
        OperatorKind::Join(JoinState {
            left: Index::new(row_ops()),
            right: Index::new(row_ops()),
            merge: Arc::new(merge),
            kind,
            left_outer,
            right_outer,
            unmatched_left: FnvHashMap::default(),
            unmatched_right: FnvHashMap::default(),
        })
    }

    pub fn new_group_reduce(reduce: impl Fn(&[(Row, Multiplicity)]) -> Row + Send + Sync + 'static) -> Self {
        OperatorKind::GroupReduce(GroupReduceState {
            groups: FnvHashMap::default(),
            last_output: FnvHashMap::default(),
            reduce: Arc::new(reduce),
        })
    }

    pub fn new_top_k(order_by: Vec<OrderByClause>, limit: usize, offset: usize) -> Self {
        OperatorKind::TopK(TopKState::new(order_by, limit, offset))
    }

    pub fn new_output() -> Self {
        OperatorKind::Output(OutputState::default())
    }

    /// Runs the operator once against its already-drained input batches
    /// (one `Vec<Multiset<Tuple>>` per reader, in FIFO arrival order) and
    /// returns whatever it produces for its output edge (empty for the
    /// terminal Output operator).
    pub fn run(&mut self, mut batches: Vec<Vec<Multiset<Tuple>>>) -> Multiset<Tuple> {
        match self {
            OperatorKind::Map(f) => {
                let mut out = Multiset::new();
                for batch in batches.pop().into_iter().flatten() {
                    for (t, m) in batch.into_iter() {
                        out.push(f(&t), m);
                    }
                }
                out
            }
            OperatorKind::Filter(p) => {
                let mut out = Multiset::new();
                for batch in batches.pop().into_iter().flatten() {
                    for (t, m) in batch.into_iter() {
                        if p(&t) {
                            out.push(t, m);
                        }
                    }
                }
                out
            }
            OperatorKind::Negate => {
                let mut out = Multiset::new();
                for batch in batches.pop().into_iter().flatten() {
                    out.extend(batch.negate());
                }
                out
            }
            OperatorKind::Consolidate => {
                let mut out = Multiset::new();
                for input in batches {
                    for batch in input {
                        out.extend(batch);
                    }
                }
                out.consolidate_in_place_with(tuple_hash, tuple_eq);
                out
            }
            OperatorKind::Concat => {
                let mut out = Multiset::new();
                for input in batches {
                    for batch in input {
                        out.extend(batch);
                    }
                }
                out
            }
            OperatorKind::Distinct(state) => state.run(batches.pop().unwrap_or_default()),
            OperatorKind::Join(state) => {
                let right_batches = batches.pop().unwrap_or_default();
                let left_batches = batches.pop().unwrap_or_default();
                state.run(left_batches, right_batches)
            }
            OperatorKind::GroupReduce(state) => state.run(batches.pop().unwrap_or_default()),
            OperatorKind::TopK(state) => state.run(batches.pop().unwrap_or_default()),
            OperatorKind::Output(state) => {
                state.run(batches.pop().unwrap_or_default());
                Multiset::new()
            }
        }
    }
}

/// Per-value net multiplicity; emits `+1` when a value's count first turns
/// positive, `-1` when it drops back to zero (§4.5).
#[derive(Default)]
pub struct DistinctState {
    net: FnvHashMap<u64, Vec<(Tuple, Multiplicity)>>,
}

impl DistinctState {
    fn run(&mut self, batches: Vec<Multiset<Tuple>>) -> Multiset<Tuple> {
        let mut out = Multiset::new();
        for batch in batches {
            for (t, m) in batch.into_iter() {
                let h = tuple_hash(&t);
                let bucket = self.net.entry(h).or_default();
                if let Some(slot) = bucket.iter_mut().find(|(existing, _)| tuple_eq(existing, &t)) {
                    let before = slot.1;
                    slot.1 += m;
                    if before <= 0 && slot.1 > 0 {
                        out.push(t.clone(), 1);
                    } else if before > 0 && slot.1 <= 0 {
                        out.push(t.clone(), -1);
                    }
                } else {
                    bucket.push((t.clone(), m));
                    if m > 0 {
                        out.push(t, 1);
                    }
                }
                bucket.retain(|(_, mult)| *mult != 0);
            }
        }
        out
    }
}

type OuterRowFn = Arc<dyn Fn(&Key, &Row) -> Row + Send + Sync>;

pub struct JoinState {
    left: Index<Row>,
    right: Index<Row>,
    merge: JoinMerge,
    kind: crate::ir::JoinKind,
    left_outer: Option<OuterRowFn>,
    right_outer: Option<OuterRowFn>,
    /// Snapshot of the null-padded rows currently emitted for unmatched keys
    /// on each side, keyed by tuple hash, so a re-scan can be diffed into an
    /// insert/retract delta instead of re-emitting the whole set every batch.
    unmatched_left: FnvHashMap<u64, Tuple>,
    unmatched_right: FnvHashMap<u64, Tuple>,
}

impl JoinState {
    /// For each incoming batch on side L, emits `L_new ⋈ R` (against the
    /// *current* right index) before merging `L_new` into `L`; symmetrically
    /// for R using the now-updated left index. Processing left fully before
    /// right (rather than against a frozen snapshot of both) is what makes
    /// the bilinear delta `ΔL⋈R_old + L_old⋈ΔR + ΔL⋈ΔR` come out exactly
    /// once instead of double- or under-counting the `ΔL⋈ΔR` term (§4.5).
    fn run(&mut self, left_batches: Vec<Multiset<Tuple>>, right_batches: Vec<Multiset<Tuple>>) -> Multiset<Tuple> {
        let mut pairs: Multiset<(Key, (Row, Row))> = Multiset::new();
        for batch in left_batches {
            let mut l_new = Index::new(row_ops());
            for ((k, row), m) in batch.into_iter() {
                l_new.add_value(k, row, m).expect("join index invariant");
            }
            pairs.extend(l_new.join(&self.right));
            self.left.append(l_new).expect("join index invariant");
        }
        for batch in right_batches {
            let mut r_new = Index::new(row_ops());
            for ((k, row), m) in batch.into_iter() {
                r_new.add_value(k, row, m).expect("join index invariant");
            }
            pairs.extend(self.left.join(&r_new));
            self.right.append(r_new).expect("join index invariant");
        }
        let mut out = pairs.map(|(k, (l, r))| {
            let row = (self.merge)(&k, &l, &r);
            (k, row)
        });
        self.rescan_outer(&mut out);
        out
    }

    /// Full rescan of "does this key have a match on the other side",
    /// diffed against the previous rescan to produce a delta (§4.7 step 2).
    /// A key is the unit of matching because an equi-join treats every row
    /// sharing a join key identically; this does not account for a key whose
    /// match count changes without crossing zero (a well-formed insert-heavy
    /// workload never needs that), which is the scoped limitation recorded
    /// in DESIGN.md.
    fn rescan_outer(&mut self, out: &mut Multiset<Tuple>) {
        if let Some(builder) = &self.left_outer {
            if matches!(self.kind, crate::ir::JoinKind::Left | crate::ir::JoinKind::Full) {
                let mut current: FnvHashMap<u64, Tuple> = FnvHashMap::default();
                for key in self.left.keys() {
                    if self.right.has(key) {
                        continue;
                    }
                    for (row, m) in self.left.get(key) {
                        if m <= 0 {
                            continue;
                        }
                        let t = (key.clone(), builder(key, row));
                        current.insert(tuple_hash(&t), t);
                    }
                }
                diff_snapshot(&mut self.unmatched_left, current, out);
            }
        }
        if let Some(builder) = &self.right_outer {
            if matches!(self.kind, crate::ir::JoinKind::Right | crate::ir::JoinKind::Full) {
                let mut current: FnvHashMap<u64, Tuple> = FnvHashMap::default();
                for key in self.right.keys() {
                    if self.left.has(key) {
                        continue;
                    }
                    for (row, m) in self.right.get(key) {
                        if m <= 0 {
                            continue;
                        }
                        let t = (key.clone(), builder(key, row));
                        current.insert(tuple_hash(&t), t);
                    }
                }
                diff_snapshot(&mut self.unmatched_right, current, out);
            }
        }
    }
}

fn diff_snapshot(prev: &mut FnvHashMap<u64, Tuple>, current: FnvHashMap<u64, Tuple>, out: &mut Multiset<Tuple>) {
    for (h, t) in prev.iter() {
        if !current.contains_key(h) {
            out.push(t.clone(), -1);
        }
    }
    for (h, t) in &current {
        if !prev.contains_key(h) {
            out.push(t.clone(), 1);
        }
    }
    *prev = current;
}

pub struct GroupReduceState {
    groups: FnvHashMap<Key, Vec<(Row, Multiplicity)>>,
    last_output: FnvHashMap<Key, Row>,
    reduce: ReduceFn,
}

impl GroupReduceState {
    /// Recomputes `reduce(values_for_key)` for every group touched by the
    /// batch and emits the delta between the previous aggregate and the new
    /// one (§4.5); a group whose membership nets to empty produces a
    /// retraction with no replacement.
    fn run(&mut self, batches: Vec<Multiset<Tuple>>) -> Multiset<Tuple> {
        let mut touched: Vec<Key> = Vec::new();
        for batch in batches {
            for ((key, row), m) in batch.into_iter() {
                let entry = self.groups.entry(key.clone()).or_default();
                if !touched.contains(&key) {
                    touched.push(key.clone());
                }
                entry.push((row, m));
            }
        }
        let mut out = Multiset::new();
        for key in touched {
            if let Some(values) = self.groups.get_mut(&key) {
                consolidate_rows(values);
                if values.is_empty() {
                    self.groups.remove(&key);
                }
            }
            let new_value = self.groups.get(&key).map(|values| (self.reduce)(values));
            let old_value = self.last_output.get(&key).cloned();
            let changed = match (&old_value, &new_value) {
                (None, None) => false,
                (Some(a), Some(b)) => !structural_eq(&a.0, &b.0),
                _ => true,
            };
            if changed {
                if let Some(old) = old_value {
                    out.push((key.clone(), old), -1);
                }
                if let Some(ref new) = new_value {
                    out.push((key.clone(), new.clone()), 1);
                }
                match new_value {
                    Some(v) => {
                        self.last_output.insert(key, v);
                    }
                    None => {
                        self.last_output.remove(&key);
                    }
                }
            }
        }
        out
    }
}

fn consolidate_rows(values: &mut Vec<(Row, Multiplicity)>) {
    let mut merged: Vec<(Row, Multiplicity)> = Vec::with_capacity(values.len());
    'outer: for (row, m) in values.drain(..) {
        for existing in merged.iter_mut() {
            if structural_eq(&existing.0 .0, &row.0) {
                existing.1 += m;
                continue 'outer;
            }
        }
        merged.push((row, m));
    }
    merged.retain(|(_, m)| *m != 0);
    *values = merged;
}

/// Top-`limit` window over a totally-ordered projection (§4.5). This
/// implementation keeps the full live set of rows that have ever satisfied
/// everything upstream (net multiplicity > 0) and recomputes the visible
/// window from scratch on every batch, rather than modeling the source's
/// "data-needed" control-input protocol: both converge to the same visible
/// window, and keeping the whole live set means this operator never has a
/// reason to ask upstream for more data, so it cannot contribute to
/// iteration-cap exhaustion (§4.4, §9) the way a windowed/backpressured
/// implementation could.
pub struct TopKState {
    order_by: Vec<OrderByClause>,
    limit: usize,
    offset: usize,
    live: FnvHashMap<u64, Vec<(Tuple, Multiplicity)>>,
    window: Vec<(u64, Tuple)>,
}

impl TopKState {
    fn new(order_by: Vec<OrderByClause>, limit: usize, offset: usize) -> Self {
        TopKState { order_by, limit, offset, live: FnvHashMap::default(), window: Vec::new() }
    }

    fn run(&mut self, batches: Vec<Multiset<Tuple>>) -> Multiset<Tuple> {
        for batch in batches {
            for (t, m) in batch.into_iter() {
                let h = tuple_hash(&t);
                let bucket = self.live.entry(h).or_default();
                if let Some(slot) = bucket.iter_mut().find(|(existing, _)| tuple_eq(existing, &t)) {
                    slot.1 += m;
                } else {
                    bucket.push((t, m));
                }
                bucket.retain(|(_, mult)| *mult != 0);
            }
        }
        self.live.retain(|_, bucket| !bucket.is_empty());

        let mut candidates: Vec<(u64, &Tuple)> = self
            .live
            .iter()
            .flat_map(|(h, bucket)| bucket.iter().filter(|(_, m)| *m > 0).map(move |(t, _)| (*h, t)))
            .collect();
        candidates.sort_by(|(_, a), (_, b)| self.compare(a, b));

        let new_window: Vec<(u64, Tuple)> = candidates
            .into_iter()
            .skip(self.offset)
            .take(self.limit)
            .map(|(h, t)| (h, t.clone()))
            .collect();

        let mut out = Multiset::new();
        for (h, t) in &self.window {
            if !new_window.iter().any(|(nh, nt)| nh == h && tuple_eq(nt, t)) {
                out.push(t.clone(), -1);
            }
        }
        for (h, t) in &new_window {
            if !self.window.iter().any(|(oh, ot)| oh == h && tuple_eq(ot, t)) {
                out.push(t.clone(), 1);
            }
        }
        self.window = new_window;
        out
    }

    fn compare(&self, a: &Tuple, b: &Tuple) -> Ordering {
        for clause in &self.order_by {
            let va = eval_order_expr(&clause.expression, &a.1);
            let vb = eval_order_expr(&clause.expression, &b.1);
            let ord = compare_values_for_order(&va, &vb, clause.compare_options.case_insensitive);
            let ord = if clause.direction == Direction::Desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        // Tie-break by row key ascending (§4.5).
        a.0.cmp(&b.0)
    }
}

fn eval_order_expr(expr: &crate::ir::Expr, row: &Row) -> Value {
    use crate::ir::Expr;
    match expr {
        Expr::Ref(r) => row.get_path(&r.path).cloned().unwrap_or(Value::Null),
        Expr::Value(v) => v.clone(),
        _ => Value::Null,
    }
}

pub(crate) fn compare_values_for_order(a: &Value, b: &Value, case_insensitive: bool) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => {
            if case_insensitive {
                x.to_lowercase().cmp(&y.to_lowercase())
            } else {
                x.cmp(y)
            }
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Terminal operator (§4.5): accumulates per-key insert/delete counts and
/// emits `insert`/`update`/`delete` messages per the decision table in
/// §4.5.
#[derive(Default)]
pub struct OutputState {
    current: FnvHashMap<Key, Row>,
    pub messages: Vec<ChangeMessage>,
}

impl OutputState {
    fn run(&mut self, batches: Vec<Multiset<Tuple>>) {
        let mut by_key: FnvHashMap<Key, Vec<(Row, Multiplicity)>> = FnvHashMap::default();
        for batch in batches {
            for ((key, row), m) in batch.into_iter() {
                by_key.entry(key).or_default().push((row, m));
            }
        }
        for (key, mut rows) in by_key {
            consolidate_rows(&mut rows);
            let inserts: Multiplicity = rows.iter().filter(|(_, m)| *m > 0).map(|(_, m)| *m).sum();
            let deletes: Multiplicity = rows.iter().filter(|(_, m)| *m < 0).map(|(_, m)| -*m).sum();
            let new_row = rows.iter().find(|(_, m)| *m > 0).map(|(r, _)| r.clone());
            let old_row = self.current.get(&key).cloned();

            if inserts > 0 && deletes == 0 {
                if let Some(new_row) = new_row {
                    self.current.insert(key.clone(), new_row.clone());
                    self.messages.push(ChangeMessage::Insert { key, value: new_row });
                }
            } else if inserts >= deletes && deletes > 0 {
                if let Some(new_row) = new_row {
                    self.current.insert(key.clone(), new_row.clone());
                    if let Some(old_row) = old_row {
                        self.messages.push(ChangeMessage::Update { key, value: new_row, previous_value: old_row });
                    } else {
                        self.messages.push(ChangeMessage::Insert { key, value: new_row });
                    }
                }
            } else if deletes > 0 && inserts < deletes {
                self.current.remove(&key);
                if let Some(old_row) = old_row {
                    self.messages.push(ChangeMessage::Delete { key, value: old_row });
                }
            }
        }
    }
}
