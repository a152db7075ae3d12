//! Schedule engine error types

use thiserror::Error;

/// Errors raised by schedule primitives and dataflow rewrites.
///
/// Every kind maps 1:1 to a distinct failure mode; none of them are
/// swallowed, and a primitive that returns an error leaves the
/// `Schedule`/`Stage` it was called on untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    /// A primitive named an `IterVar` that is not a leaf (or not in
    /// `all_iter_vars`) of the stage it was called on.
    #[error("unknown iter var '{iter_var}' in stage '{stage}'")]
    UnknownIterVar { stage: String, iter_var: String },

    /// `fuse` was called on two leaves that are not adjacent.
    #[error("fuse requires adjacent leaves, got '{outer}' and '{inner}' in stage '{stage}'")]
    NonAdjacentFuse {
        stage: String,
        outer: String,
        inner: String,
    },

    /// `reorder`'s `order` argument is not a permutation of a leaf subset.
    #[error("reorder order is not a permutation of a leaf subset in stage '{stage}'")]
    BadReorder { stage: String },

    /// A primitive requires a specific `IterVarType` and the named axis has
    /// an incompatible one (e.g. `vectorize` on a `CommReduce` axis).
    #[error("iter var '{iter_var}' has incompatible iter type {actual:?} for this operation (expected one of {expected:?})")]
    IncompatibleIterType {
        iter_var: String,
        actual: crate::itervar::IterVarType,
        expected: Vec<crate::itervar::IterVarType>,
    },

    /// `cache_read`'s reader list names an operation that does not actually
    /// consume the target tensor.
    #[error("operation '{reader}' does not consume tensor '{target}'")]
    UnknownConsumer { target: String, reader: String },

    /// `cache_write` was called on a non-`Compute` operation, or one with
    /// more than one output.
    #[error("cache_write requires a single-output compute operation, got '{op}'")]
    CacheWriteNotCompute { op: String },

    /// `rfactor`'s target axis influences a non-reduce (data-parallel) root.
    #[error("rfactor axis '{axis}' touches data-parallel root '{root}'")]
    FactorTouchesDataPar { axis: String, root: String },

    /// `rfactor` was called on an axis that is not `CommReduce`.
    #[error("rfactor axis '{axis}' is not a CommReduce axis")]
    FactorAxisNotReduction { axis: String },

    /// `reuse_at`'s target tensor is not an input of the named parent
    /// operation.
    #[error("reuse_at target '{target}' is not an input of operation '{parent}'")]
    ReuseNotInput { parent: String, target: String },

    /// `reuse_at`'s target `For` loop has a body shape the rewrite cannot
    /// generalize over.
    #[error("reuse_at could not locate a reusable loop body for axis '{axis}' in operation '{parent}'")]
    ReuseBadParentShape { parent: String, axis: String },

    /// `compute_inline` was applied to a non-`Compute` operation, or one
    /// with more than one body expression.
    #[error("compute_inline requires a single-body compute operation, got '{op}'")]
    InlineNotCompute { op: String },

    /// During inject-inline, a multi-output `Compute` operation had `Reduce`
    /// bodies whose combiner/source/axis/condition disagreed.
    #[error("inconsistent reduce bodies in operation '{op}'")]
    InconsistentReduce { op: String },
}

/// Result alias used throughout the schedule engine.
pub type ScheduleResult<T> = Result<T, ScheduleError>;
