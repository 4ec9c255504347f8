//! Error kinds raised by the core.
//!
//! Most of these indicate a programmer error (malformed IR, a structural
//! mutation after the graph was finalized) rather than a transient runtime
//! condition; callers are expected to treat them as fatal to the operation
//! that raised them, per the propagation policy each variant documents.

use thiserror::Error;

/// Errors raised by the query compiler, the dataflow graph, the tiered
/// index, the hasher, and the collection's sync session guard.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum D2Error {
    /// The IR is malformed: an aggregate outside `group_by`/`having`, a
    /// reference to an unknown alias, or another shape violation. Fatal to
    /// the query; the caller must rebuild the IR.
    #[error("query shape error: {0}")]
    QueryShapeError(String),

    /// A join condition does not reduce to `eq(ref_a, ref_b)`. Fatal to that
    /// query.
    #[error("unsupported join predicate: {0}")]
    UnsupportedJoinPredicate(String),

    /// Internal inconsistency in the tiered index (e.g. a differing prefix
    /// reached a slot that expects a fixed one). Indicates a bug; surfaced
    /// to the nearest operator boundary, where it becomes fatal to the
    /// graph.
    #[error("index invariant violated: {0}")]
    IndexInvariant(String),

    /// A structural mutation (`add_operator`, `add_edge`, ...) was attempted
    /// on a graph after `finalize`. Programmer error.
    #[error("graph already finalized")]
    GraphFinalized,

    /// `begin` was called on a collection before an outstanding session's
    /// `commit`. Fatal to the second session; the first may proceed.
    #[error("nested sync session on collection {0:?}")]
    NestedSyncSession(Option<String>),

    /// The hasher encountered a value kind it cannot hash (functions,
    /// anything outside the supported value model).
    #[error("unsupported value kind: {0}")]
    UnsupportedValueKind(String),

    /// The hasher detected a cyclic reference while walking a value.
    #[error("cyclic value detected")]
    CyclicValue,

    /// `Graph::run` exhausted its iteration cap. Non-fatal: logged with
    /// diagnostic state, and the next `run` will retry.
    #[error("graph iteration limit reached ({0} iterations); operators still pending: {1:?}")]
    GraphIterationLimit(usize, Vec<usize>),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, D2Error>;
