//! The D2 graph runtime (§4.4, §9).
//!
//! `differential-dataflow` sidesteps the back-reference problem operators,
//! writers, and readers would otherwise have by building on `timely`'s
//! scope/stream graph, which owns its own arena of channels. There is no
//! `timely` scope here (this engine is single-threaded and synchronous end
//! to end, per §5), so per §9 the back-edges are modeled explicitly:
//! operators and edges live in arenas owned by [`Graph`], addressed by
//! stable indices (`OperatorId`, `EdgeId`). Nothing in this module holds an
//! owning reference to another node in the graph.

pub mod operators;

use crate::error::D2Error;
use crate::multiset::Multiset;
use crate::row::{Key, Row};
use operators::OperatorKind;
use smallvec::SmallVec;
use std::collections::VecDeque;

/// A `(key, row)` pair — the uniform payload type flowing along every edge
/// of a compiled graph. The query compiler (`crate::compiler`) attaches a
/// key to every tuple as the first step of planning (§4.7 step 1), so the
/// runtime itself never needs to be generic over the tuple shape.
pub type Tuple = (Key, Row);

/// Default bound on `Graph::run` iterations (§4.4).
pub const DEFAULT_ITERATION_CAP: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperatorId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(usize);

/// A reader's position within an edge's reader list. Reading from a
/// `ReaderRef` never affects any other reader attached to the same edge
/// (§3, "non-destructive relative to other readers").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderRef {
    edge: EdgeId,
    index: usize,
}

struct EdgeState {
    readers: Vec<VecDeque<Multiset<Tuple>>>,
}

struct OperatorEntry {
    kind: OperatorKind,
    inputs: SmallVec<[ReaderRef; 2]>,
    output: Option<EdgeId>,
}

/// Owns every operator and edge in one compiled dataflow. See the module
/// doc for why ownership is centralized here instead of distributed across
/// the nodes themselves.
pub struct Graph {
    operators: Vec<OperatorEntry>,
    edges: Vec<EdgeState>,
    finalized: bool,
    iteration_cap: usize,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            operators: Vec::new(),
            edges: Vec::new(),
            finalized: false,
            iteration_cap: DEFAULT_ITERATION_CAP,
        }
    }

    pub fn with_iteration_cap(mut self, cap: usize) -> Self {
        self.iteration_cap = cap;
        self
    }

    fn check_mutable(&self) -> Result<(), D2Error> {
        if self.finalized {
            Err(D2Error::GraphFinalized)
        } else {
            Ok(())
        }
    }

    /// Allocates a fresh edge with no readers yet. Used both for graph
    /// inputs (the caller pushes directly into the edge) and, internally,
    /// for every operator's output.
    pub fn new_edge(&mut self) -> Result<EdgeId, D2Error> {
        self.check_mutable()?;
        self.edges.push(EdgeState { readers: Vec::new() });
        Ok(EdgeId(self.edges.len() - 1))
    }

    /// Registers a new reader on `edge`, returning a handle that can be
    /// passed as one of an operator's inputs.
    pub fn add_reader(&mut self, edge: EdgeId) -> Result<ReaderRef, D2Error> {
        self.check_mutable()?;
        let state = &mut self.edges[edge.0];
        state.readers.push(VecDeque::new());
        Ok(ReaderRef { edge, index: state.readers.len() - 1 })
    }

    /// Adds an operator reading from `inputs`, allocating a fresh output
    /// edge for it. Returns the operator id and that output edge, so the
    /// caller can immediately `add_reader` on it to wire up the next stage.
    pub fn add_operator(&mut self, kind: OperatorKind, inputs: Vec<ReaderRef>) -> Result<(OperatorId, EdgeId), D2Error> {
        self.check_mutable()?;
        let output = self.new_edge()?;
        self.operators.push(OperatorEntry {
            kind,
            inputs: inputs.into(),
            output: Some(output),
        });
        Ok((OperatorId(self.operators.len() - 1), output))
    }

    /// Adds the terminal Output operator, which produces change messages
    /// instead of a downstream edge.
    pub fn add_output_operator(&mut self, input: ReaderRef) -> Result<OperatorId, D2Error> {
        self.check_mutable()?;
        self.operators.push(OperatorEntry {
            kind: OperatorKind::new_output(),
            inputs: smallvec::smallvec![input],
            output: None,
        });
        Ok(OperatorId(self.operators.len() - 1))
    }

    /// Ends the build phase: further structural mutation fails with
    /// `GraphFinalized` (§4.4).
    pub fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Pushes a batch of data directly into `edge`, fanning it out to every
    /// reader attached to it.
    pub fn push_input(&mut self, edge: EdgeId, data: Multiset<Tuple>) {
        if data.is_empty() {
            return;
        }
        for reader_queue in &mut self.edges[edge.0].readers {
            reader_queue.push_back(data.clone());
        }
    }

    fn drain_reader(&mut self, reader: ReaderRef) -> Vec<Multiset<Tuple>> {
        self.edges[reader.edge.0].readers[reader.index].drain(..).collect()
    }

    fn reader_has_pending(&self, reader: ReaderRef) -> bool {
        !self.edges[reader.edge.0].readers[reader.index].is_empty()
    }

    /// Runs every operator once, in construction order (§4.4: "deterministic
    /// in construction order"). An operator with no pending input on any
    /// reader is a no-op. Returns whether any operator did work.
    pub fn step(&mut self) -> bool {
        let mut did_work = false;
        for idx in 0..self.operators.len() {
            if self.run_operator_at(idx) {
                did_work = true;
            }
        }
        did_work
    }

    fn run_operator_at(&mut self, idx: usize) -> bool {
        let inputs = self.operators[idx].inputs.clone();
        if !inputs.iter().any(|r| self.reader_has_pending(*r)) {
            return false;
        }
        let batches: SmallVec<[Vec<Multiset<Tuple>>; 2]> = inputs.iter().map(|r| self.drain_reader(*r)).collect();
        let output_edge = self.operators[idx].output;
        // Swap the operator's state out so `run` can mutate it while we
        // still hold `&mut self` for edge access (no owning back-reference
        // from operator to graph exists, per the module doc).
        let mut kind = std::mem::replace(&mut self.operators[idx].kind, OperatorKind::Negate);
        let out = kind.run(batches.into_vec());
        self.operators[idx].kind = kind;
        if let Some(edge) = output_edge {
            self.push_input(edge, out);
        }
        true
    }

    fn any_pending(&self) -> bool {
        self.edges.iter().any(|e| e.readers.iter().any(|q| !q.is_empty()))
    }

    /// Operator ids (as raw indices) whose inputs still have queued data —
    /// used for the iteration-cap diagnostic (§4.4, §9).
    pub fn pending_operator_ids(&self) -> Vec<usize> {
        self.operators
            .iter()
            .enumerate()
            .filter(|(_, op)| op.inputs.iter().any(|r| self.reader_has_pending(*r)))
            .map(|(i, _)| i)
            .collect()
    }

    /// Runs `step` to quiescence, bounded by the iteration cap. Per §4.4
    /// and §7 (`GraphIterationLimit`), exhausting the cap is **not** an
    /// error: diagnostic state is logged and `run` returns normally,
    /// trusting a later `run` to make further progress.
    pub fn run(&mut self) -> RunOutcome {
        let mut iterations = 0;
        while self.any_pending() {
            if iterations >= self.iteration_cap {
                let pending = self.pending_operator_ids();
                tracing::warn!(
                    iterations,
                    pending_operators = ?pending,
                    "{}",
                    D2Error::GraphIterationLimit(iterations, pending.clone())
                );
                return RunOutcome { iterations, hit_cap: true };
            }
            self.step();
            iterations += 1;
            tracing::trace!(iterations, "graph step");
        }
        RunOutcome { iterations, hit_cap: false }
    }

    /// Drains whatever change messages the Output operator at `op` has
    /// accumulated since the last drain.
    pub fn drain_output(&mut self, op: OperatorId) -> Vec<crate::change::ChangeMessage> {
        match &mut self.operators[op.0].kind {
            OperatorKind::Output(state) => std::mem::take(&mut state.messages),
            _ => Vec::new(),
        }
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }
}

/// Summary of one `Graph::run` invocation.
#[derive(Debug, Clone, Copy)]
pub struct RunOutcome {
    pub iterations: usize,
    pub hit_cap: bool,
}
