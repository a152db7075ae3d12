//! Entity layer: `IterVar`, `IterVarRelation`, `IterVarAttr`, and the small
//! wire-stable enums (`AttachType`, `PartitionType`) that a `Stage` and
//! `Schedule` build and rewrite.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::ir::expr::fresh_id;
use crate::ir::{Expr, Range, Var};

/// The kind of loop an `IterVar` represents once emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterVarType {
    DataPar,
    CommReduce,
    Ordered,
    Opaque,
    Unrolled,
    Vectorized,
    Parallelized,
    Tensorized,
    Pipelined,
}

/// A loop variable with a (possibly still-unresolved) domain. Identity is
/// by `id`, not `name` — `split`/`fuse`/`rebase`/`rfactor` all mint fresh
/// `IterVar`s that may legitimately share a display name with their parent.
#[derive(Debug)]
pub struct IterVarNode {
    pub id: u64,
    pub var: Var,
    pub dom: Option<Range>,
    pub iter_type: IterVarType,
    pub thread_tag: Option<String>,
}

impl PartialEq for IterVarNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for IterVarNode {}
impl Hash for IterVarNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl fmt::Display for IterVarNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.var.name)
    }
}

pub type IterVar = Rc<IterVarNode>;

pub fn new_iter_var(name: impl Into<String>, dom: Option<Range>, iter_type: IterVarType) -> IterVar {
    let name = name.into();
    Rc::new(IterVarNode {
        id: fresh_id(),
        var: crate::ir::new_var(name),
        dom,
        iter_type,
        thread_tag: None,
    })
}

/// Builds an `IterVar` over `[0, extent)` — the common case for a freshly
/// declared root axis.
pub fn range_iter_var(name: impl Into<String>, extent: Expr, iter_type: IterVarType) -> IterVar {
    new_iter_var(name, Some(Range::make_by_min_extent(Expr::int(0), extent)), iter_type)
}

/// A hyperedge recording how one or more leaves were derived from a parent
/// (or parents) in a stage's iter var DAG.
#[derive(Debug, Clone)]
pub enum IterVarRelation {
    Split {
        parent: IterVar,
        outer: IterVar,
        inner: IterVar,
        factor: Option<Expr>,
        nparts: Option<Expr>,
    },
    Fuse {
        outer: IterVar,
        inner: IterVar,
        fused: IterVar,
    },
    Reorder {
        order: Vec<IterVar>,
    },
    Rebase {
        parent: IterVar,
        rebased: IterVar,
    },
}

/// Per-IterVar scheduling annotation. `dim_align` supports `storage_align`;
/// `pragmas`/`for_loop_annotations` are open-ended, free-form carry channels
/// (recognized keys are not enumerated here — lowering interprets them).
#[derive(Debug, Clone, Default)]
pub struct IterVarAttr {
    pub iter_type_override: Option<IterVarType>,
    pub bind_thread: Option<IterVar>,
    pub prefetch_offsets: Vec<Expr>,
    pub tensorize_intrin: Option<String>,
    pub dim_align: Option<(i64, i64)>,
    pub pragmas: Vec<(String, Expr)>,
    pub for_loop_annotations: Vec<(String, Expr)>,
}

/// Where a `Stage`'s output currently attaches. Wire-stable — these
/// discriminants are exposed to external serializers and must not shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum AttachType {
    GroupRoot = 1,
    Inline = 2,
    InlinedAlready = 3,
    Scope = 4,
    ScanUpdate = 5,
}

/// Array-partition directive kind, passed through verbatim to lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionType {
    Complete,
    Block,
    Cyclic,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iter_var_identity_ignores_name() {
        let a = range_iter_var("i", Expr::int(10), IterVarType::DataPar);
        let b = range_iter_var("i", Expr::int(10), IterVarType::DataPar);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_attach_type_wire_values_pinned() {
        assert_eq!(AttachType::GroupRoot as i32, 1);
        assert_eq!(AttachType::Inline as i32, 2);
        assert_eq!(AttachType::InlinedAlready as i32, 3);
        assert_eq!(AttachType::Scope as i32, 4);
        assert_eq!(AttachType::ScanUpdate as i32, 5);
    }
}
