//! Minimal expression substrate: variables, ranges, and the expression tree
//! the schedule engine reads and rewrites.
//!
//! This module owns just enough of the IR — symbolic variables with unique
//! identity, integer/float arithmetic, comparisons, `Select`, tensor reads,
//! and `Reduce` — for the dataflow rewrites in [`crate::schedule`] to have
//! something concrete to manipulate.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::operation::Tensor;
use crate::itervar::IterVar;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a fresh identity, used for `Var`, `IterVar`, `Operation`, and
/// `Buffer` nodes. Identity is by this id, never by name.
pub fn fresh_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// A symbolic scalar variable. Two `Var`s are equal iff they are the same
/// allocation (same `id`), regardless of `name` — names collide routinely
/// (`split` always produces an `outer`/`inner` pair named after the parent).
#[derive(Debug)]
pub struct VarNode {
    pub id: u64,
    pub name: String,
}

impl PartialEq for VarNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for VarNode {}
impl Hash for VarNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl fmt::Display for VarNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

pub type Var = Rc<VarNode>;

/// Constructs a fresh `Var` with a new identity.
pub fn new_var(name: impl Into<String>) -> Var {
    Rc::new(VarNode {
        id: fresh_id(),
        name: name.into(),
    })
}

/// An inclusive-exclusive `[min, min + extent)` domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub min: Box<Expr>,
    pub extent: Box<Expr>,
}

impl Range {
    pub fn make_by_min_extent(min: Expr, extent: Expr) -> Range {
        Range {
            min: Box::new(min),
            extent: Box::new(extent),
        }
    }
}

/// A commutative-associative reducer: `result = f(lhs, rhs)` seeded at
/// `identity_element`, used by `Reduce` nodes and by `rfactor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommReducer {
    pub lhs: Vec<Var>,
    pub rhs: Vec<Var>,
    pub result: Vec<Expr>,
    pub identity_element: Vec<Expr>,
}

impl CommReducer {
    /// The conventional single-value `sum` reducer over integers.
    pub fn sum(ty_zero: Expr) -> CommReducer {
        let l = new_var("reduce_lhs");
        let r = new_var("reduce_rhs");
        CommReducer {
            result: vec![Expr::Add(
                Box::new(Expr::Var(l.clone())),
                Box::new(Expr::Var(r.clone())),
            )],
            lhs: vec![l],
            rhs: vec![r],
            identity_element: vec![ty_zero],
        }
    }
}

/// A reduction over one or more `CommReduce` axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceNode {
    pub combiner: CommReducer,
    pub source: Vec<Expr>,
    pub axis: Vec<IterVar>,
    pub condition: Box<Expr>,
    pub value_index: usize,
}

/// Returns true iff `a` and `b` could be produced by the same multi-output
/// `Reduce` construction, differing only in `value_index` — the check
/// inject-inline uses before collapsing several reduce elements into one
/// inlined reference (`InconsistentReduce` otherwise).
pub fn reduce_consistent(a: &ReduceNode, b: &ReduceNode) -> bool {
    a.combiner == b.combiner && a.source == b.source && a.axis == b.axis && a.condition == b.condition
}

/// The expression tree. Intentionally small: this is the part of the node
/// zoo the schedule engine actually pattern-matches on (tensor reads for
/// substitution, `Reduce` for rfactor/inline, comparisons for bound checks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Var(Var),
    IntImm(i64),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Mod(Box<Expr>, Box<Expr>),
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
    Lt(Box<Expr>, Box<Expr>),
    Le(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    Ge(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Select {
        cond: Box<Expr>,
        t: Box<Expr>,
        f: Box<Expr>,
    },
    /// A read of `tensor[args...]`.
    TensorCall { tensor: Tensor, args: Vec<Expr> },
    Reduce(Box<ReduceNode>),
}

impl Expr {
    pub fn int(v: i64) -> Expr {
        Expr::IntImm(v)
    }

    pub fn add(a: Expr, b: Expr) -> Expr {
        Expr::Add(Box::new(a), Box::new(b))
    }

    pub fn mul(a: Expr, b: Expr) -> Expr {
        Expr::Mul(Box::new(a), Box::new(b))
    }
}

/// `is_zero(e)`: true for the literal integer 0.
pub fn is_zero(e: &Expr) -> bool {
    matches!(e, Expr::IntImm(0))
}

/// `is_one(e)`: true for the literal integer 1. Deliberately syntactic, not
/// "provably equal to 1 under the domain's constraints" — matching the
/// literal check `CacheWriteWithReLayout` performs on `dom->min` in source.
pub fn is_one(e: &Expr) -> bool {
    matches!(e, Expr::IntImm(1))
}

pub fn make_zero() -> Expr {
    Expr::IntImm(0)
}

pub fn const_true() -> Expr {
    Expr::IntImm(1)
}

/// Folds a conjunction of predicates the way `arith::ComputeReduce<And>`
/// does: empty input is `const_true()`, otherwise a left fold of `And`.
pub fn compute_reduce_and(preds: Vec<Expr>) -> Expr {
    let mut iter = preds.into_iter();
    let Some(first) = iter.next() else {
        return const_true();
    };
    iter.fold(first, |acc, p| Expr::And(Box::new(acc), Box::new(p)))
}
