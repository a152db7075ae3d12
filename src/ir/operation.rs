//! Operations and tensors: the three operator variants the schedule engine
//! consumes (`Placeholder`, `Compute`, `Extern`), plus `ReplaceInputs`
//! substitution used by every dataflow rewrite's `ReplaceDataFlow` step.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use super::expr::{fresh_id, Expr};
use super::stmt::{Buffer, Stmt};
use crate::itervar::IterVar;

/// A read-only input: declared shape, no producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceholderOp {
    pub shape: Vec<Expr>,
}

/// A pure element-wise (or reduction) computation. `axis` holds the
/// data-parallel root iter vars; `reduce_axis` holds the `CommReduce` root
/// iter vars (empty for a non-reduction). `body` has one expression per
/// output; when the operation is a reduction every element is a `Reduce`
/// sharing combiner/source/axis/condition and differing only by
/// `value_index` (see [`crate::ir::expr::reduce_consistent`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeOp {
    pub axis: Vec<IterVar>,
    pub reduce_axis: Vec<IterVar>,
    pub body: Vec<Expr>,
}

/// An opaque imperative computation with declared input/output buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternOp {
    pub axis: Vec<IterVar>,
    pub inputs: Vec<Tensor>,
    pub input_placeholders: Vec<Buffer>,
    pub output_placeholders: Vec<Buffer>,
    pub body: Stmt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Placeholder(PlaceholderOp),
    Compute(ComputeOp),
    Extern(ExternOp),
}

#[derive(Debug)]
pub struct OperationNode {
    pub id: u64,
    pub name: String,
    pub tag: String,
    pub kind: OperationKind,
}

impl PartialEq for OperationNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for OperationNode {}
impl Hash for OperationNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl fmt::Display for OperationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

pub type Operation = Rc<OperationNode>;

/// A single output slot of an `Operation`. Equality/hash is by
/// `(op identity, value_index)`, delegating `op`'s equality to
/// `OperationNode`'s id-based impl.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tensor {
    pub op: Operation,
    pub value_index: usize,
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.op.num_outputs() <= 1 {
            write!(f, "{}", self.op.name)
        } else {
            write!(f, "{}.v{}", self.op.name, self.value_index)
        }
    }
}

pub fn placeholder_op(name: impl Into<String>, shape: Vec<Expr>) -> Operation {
    Rc::new(OperationNode {
        id: fresh_id(),
        name: name.into(),
        tag: String::new(),
        kind: OperationKind::Placeholder(PlaceholderOp { shape }),
    })
}

pub fn compute_op(
    name: impl Into<String>,
    tag: impl Into<String>,
    axis: Vec<IterVar>,
    reduce_axis: Vec<IterVar>,
    body: Vec<Expr>,
) -> Operation {
    Rc::new(OperationNode {
        id: fresh_id(),
        name: name.into(),
        tag: tag.into(),
        kind: OperationKind::Compute(ComputeOp {
            axis,
            reduce_axis,
            body,
        }),
    })
}

pub fn extern_op(
    name: impl Into<String>,
    tag: impl Into<String>,
    axis: Vec<IterVar>,
    inputs: Vec<Tensor>,
    input_placeholders: Vec<Buffer>,
    output_placeholders: Vec<Buffer>,
    body: Stmt,
) -> Operation {
    Rc::new(OperationNode {
        id: fresh_id(),
        name: name.into(),
        tag: tag.into(),
        kind: OperationKind::Extern(ExternOp {
            axis,
            inputs,
            input_placeholders,
            output_placeholders,
            body,
        }),
    })
}

impl OperationNode {
    pub fn num_outputs(&self) -> usize {
        match &self.kind {
            OperationKind::Placeholder(_) => 1,
            OperationKind::Compute(c) => c.body.len().max(1),
            OperationKind::Extern(e) => e.output_placeholders.len().max(1),
        }
    }

    /// Root iter vars in declaration order: data-parallel axes first, then
    /// reduce axes (empty for `Placeholder`/`Extern` reductions aren't
    /// modeled on `Extern`, matching source where only `ComputeOpNode`
    /// carries `reduce_axis`).
    pub fn root_iter_vars(&self) -> Vec<IterVar> {
        match &self.kind {
            OperationKind::Placeholder(_) => Vec::new(),
            OperationKind::Compute(c) => {
                let mut v = c.axis.clone();
                v.extend(c.reduce_axis.clone());
                v
            }
            OperationKind::Extern(e) => e.axis.clone(),
        }
    }

    /// Tensor inputs this operation reads from. For `Compute`, this is
    /// every distinct tensor referenced by a `TensorCall` in its body
    /// (found via post-order walk); for `Extern`, the declared `inputs`.
    pub fn input_tensors(&self) -> Vec<Tensor> {
        match &self.kind {
            OperationKind::Placeholder(_) => Vec::new(),
            OperationKind::Compute(c) => {
                let mut seen = Vec::new();
                for e in &c.body {
                    collect_tensor_calls(e, &mut seen);
                }
                seen
            }
            OperationKind::Extern(e) => e.inputs.clone(),
        }
    }
}

fn collect_tensor_calls(e: &Expr, out: &mut Vec<Tensor>) {
    match e {
        Expr::TensorCall { tensor, args } => {
            if !out.contains(tensor) {
                out.push(tensor.clone());
            }
            for a in args {
                collect_tensor_calls(a, out);
            }
        }
        Expr::Add(a, b)
        | Expr::Sub(a, b)
        | Expr::Mul(a, b)
        | Expr::Div(a, b)
        | Expr::Mod(a, b)
        | Expr::Min(a, b)
        | Expr::Max(a, b)
        | Expr::Eq(a, b)
        | Expr::Ne(a, b)
        | Expr::Lt(a, b)
        | Expr::Le(a, b)
        | Expr::Gt(a, b)
        | Expr::Ge(a, b)
        | Expr::And(a, b)
        | Expr::Or(a, b) => {
            collect_tensor_calls(a, out);
            collect_tensor_calls(b, out);
        }
        Expr::Not(a) => collect_tensor_calls(a, out),
        Expr::Select { cond, t, f } => {
            collect_tensor_calls(cond, out);
            collect_tensor_calls(t, out);
            collect_tensor_calls(f, out);
        }
        Expr::Reduce(r) => {
            for s in &r.source {
                collect_tensor_calls(s, out);
            }
            collect_tensor_calls(&r.condition, out);
        }
        Expr::Var(_) | Expr::IntImm(_) => {}
    }
}

/// Builds `tensor[args]`, reusing `Rc` identity, no new allocation of
/// `Operation`.
pub fn call(tensor: Tensor, args: Vec<Expr>) -> Expr {
    Expr::TensorCall { tensor, args }
}

pub fn output_tensor(op: &Operation, value_index: usize) -> Tensor {
    Tensor {
        op: op.clone(),
        value_index,
    }
}

/// Structural substitution of tensor inputs: `op.replace_inputs(vmap)`
/// returns `op` unchanged (same `Rc`, no new identity) if none of `vmap`'s
/// keys occur in it, otherwise a freshly constructed `Operation` with every
/// occurrence of `old` rewritten to `new`.
pub fn replace_inputs(op: &Operation, vmap: &HashMap<Tensor, Tensor>) -> Operation {
    if vmap.is_empty() {
        return op.clone();
    }
    match &op.kind {
        OperationKind::Placeholder(_) => op.clone(),
        OperationKind::Compute(c) => {
            let mut changed = false;
            let new_body: Vec<Expr> = c
                .body
                .iter()
                .map(|e| {
                    let (e2, ch) = substitute_tensors(e, vmap);
                    changed |= ch;
                    e2
                })
                .collect();
            if !changed {
                return op.clone();
            }
            compute_op(op.name.clone(), op.tag.clone(), c.axis.clone(), c.reduce_axis.clone(), new_body)
        }
        OperationKind::Extern(e) => {
            let mut changed = false;
            let new_inputs: Vec<Tensor> = e
                .inputs
                .iter()
                .map(|t| {
                    if let Some(n) = vmap.get(t) {
                        changed = true;
                        n.clone()
                    } else {
                        t.clone()
                    }
                })
                .collect();
            if !changed {
                return op.clone();
            }
            extern_op(
                op.name.clone(),
                op.tag.clone(),
                e.axis.clone(),
                new_inputs,
                e.input_placeholders.clone(),
                e.output_placeholders.clone(),
                e.body.clone(),
            )
        }
    }
}

/// Substitutes tensor references in `e` per `vmap`, reporting whether
/// anything actually changed (the `changed` tracking the design note calls
/// for, so unrelated expressions keep their original allocation — not that
/// it matters for `Expr` which is a plain value type, but it mirrors the
/// `Operation`-level short-circuit which does matter for identity).
pub fn substitute_tensors(e: &Expr, vmap: &HashMap<Tensor, Tensor>) -> (Expr, bool) {
    match e {
        Expr::TensorCall { tensor, args } => {
            let mut changed = false;
            let new_args: Vec<Expr> = args
                .iter()
                .map(|a| {
                    let (a2, ch) = substitute_tensors(a, vmap);
                    changed |= ch;
                    a2
                })
                .collect();
            if let Some(new_t) = vmap.get(tensor) {
                (
                    Expr::TensorCall {
                        tensor: new_t.clone(),
                        args: new_args,
                    },
                    true,
                )
            } else {
                (
                    Expr::TensorCall {
                        tensor: tensor.clone(),
                        args: new_args,
                    },
                    changed,
                )
            }
        }
        Expr::Add(a, b) => bin(e, a, b, vmap, Expr::Add),
        Expr::Sub(a, b) => bin(e, a, b, vmap, Expr::Sub),
        Expr::Mul(a, b) => bin(e, a, b, vmap, Expr::Mul),
        Expr::Div(a, b) => bin(e, a, b, vmap, Expr::Div),
        Expr::Mod(a, b) => bin(e, a, b, vmap, Expr::Mod),
        Expr::Min(a, b) => bin(e, a, b, vmap, Expr::Min),
        Expr::Max(a, b) => bin(e, a, b, vmap, Expr::Max),
        Expr::Eq(a, b) => bin(e, a, b, vmap, Expr::Eq),
        Expr::Ne(a, b) => bin(e, a, b, vmap, Expr::Ne),
        Expr::Lt(a, b) => bin(e, a, b, vmap, Expr::Lt),
        Expr::Le(a, b) => bin(e, a, b, vmap, Expr::Le),
        Expr::Gt(a, b) => bin(e, a, b, vmap, Expr::Gt),
        Expr::Ge(a, b) => bin(e, a, b, vmap, Expr::Ge),
        Expr::And(a, b) => bin(e, a, b, vmap, Expr::And),
        Expr::Or(a, b) => bin(e, a, b, vmap, Expr::Or),
        Expr::Not(a) => {
            let (a2, ch) = substitute_tensors(a, vmap);
            (Expr::Not(Box::new(a2)), ch)
        }
        Expr::Select { cond, t, f } => {
            let (c2, ch1) = substitute_tensors(cond, vmap);
            let (t2, ch2) = substitute_tensors(t, vmap);
            let (f2, ch3) = substitute_tensors(f, vmap);
            (
                Expr::Select {
                    cond: Box::new(c2),
                    t: Box::new(t2),
                    f: Box::new(f2),
                },
                ch1 || ch2 || ch3,
            )
        }
        Expr::Reduce(r) => {
            let mut changed = false;
            let new_source: Vec<Expr> = r
                .source
                .iter()
                .map(|s| {
                    let (s2, ch) = substitute_tensors(s, vmap);
                    changed |= ch;
                    s2
                })
                .collect();
            let (cond2, ch) = substitute_tensors(&r.condition, vmap);
            changed |= ch;
            (
                Expr::Reduce(Box::new(super::expr::ReduceNode {
                    combiner: r.combiner.clone(),
                    source: new_source,
                    axis: r.axis.clone(),
                    condition: Box::new(cond2),
                    value_index: r.value_index,
                })),
                changed,
            )
        }
        Expr::Var(_) | Expr::IntImm(_) => (e.clone(), false),
    }
}

fn bin(
    _orig: &Expr,
    a: &Expr,
    b: &Expr,
    vmap: &HashMap<Tensor, Tensor>,
    ctor: fn(Box<Expr>, Box<Expr>) -> Expr,
) -> (Expr, bool) {
    let (a2, ch1) = substitute_tensors(a, vmap);
    let (b2, ch2) = substitute_tensors(b, vmap);
    (ctor(Box::new(a2), Box::new(b2)), ch1 || ch2)
}
