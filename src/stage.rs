//! Primitive layer: the in-place mutations on a single `Stage`.
//!
//! Every method here either commits its whole mutation or returns an error
//! before touching any field — a failed primitive must never leave its
//! `Stage` partially mutated.

use std::collections::HashMap;

use crate::error::{ScheduleError, ScheduleResult};
use crate::ir::{fresh_id, Expr, Operation};
use crate::itervar::{new_iter_var, AttachType, IterVar, IterVarAttr, IterVarRelation, IterVarType};

/// One unit of scheduling, corresponding to one `Operation` (or a *group*
/// stage, whose `op` the caller leaves conceptually absent — modeled here
/// as a `Placeholder` with no axes; see [`crate::schedule::Schedule::create_group`]).
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: u64,
    pub op: Operation,
    pub origin_op: Operation,
    pub all_iter_vars: Vec<IterVar>,
    pub leaf_iter_vars: Vec<IterVar>,
    pub iter_var_exprs_before_reorder: Vec<Expr>,
    pub iter_var_exprs_after_reorder: Vec<Expr>,
    pub env_threads: Vec<IterVar>,
    pub store_predicate: Option<Expr>,
    pub relations: Vec<IterVarRelation>,
    pub iter_var_attrs: HashMap<IterVar, IterVarAttr>,
    pub attach_type: AttachType,
    pub attach_ivar: Option<IterVar>,
    pub attach_stage: Option<u64>,
    pub attach_level: i32,
    pub origin_attach_ivar: Option<IterVar>,
    pub scope: String,
    pub is_output: bool,
    pub is_opengl: bool,
    pub double_buffer: bool,
    pub stencil: bool,
    pub stream: bool,
    pub group: Option<u64>,
    pub num_child_stages: usize,
}

impl Stage {
    pub fn new(op: Operation) -> Stage {
        let roots = op.root_iter_vars();
        Stage {
            id: fresh_id(),
            op: op.clone(),
            origin_op: op,
            all_iter_vars: roots.clone(),
            leaf_iter_vars: roots,
            iter_var_exprs_before_reorder: Vec::new(),
            iter_var_exprs_after_reorder: Vec::new(),
            env_threads: Vec::new(),
            store_predicate: None,
            relations: Vec::new(),
            iter_var_attrs: HashMap::new(),
            attach_type: AttachType::GroupRoot,
            attach_ivar: None,
            attach_stage: None,
            attach_level: 0,
            origin_attach_ivar: None,
            scope: String::new(),
            is_output: false,
            is_opengl: false,
            double_buffer: false,
            stencil: false,
            stream: false,
            group: None,
            num_child_stages: 0,
        }
    }

    fn leaf_pos(&self, iv: &IterVar) -> Option<usize> {
        self.leaf_iter_vars.iter().position(|x| x == iv)
    }

    fn require_leaf(&self, iv: &IterVar) -> ScheduleResult<usize> {
        self.leaf_pos(iv).ok_or_else(|| ScheduleError::UnknownIterVar {
            stage: self.op.name.clone(),
            iter_var: iv.var.name.clone(),
        })
    }

    fn require_present(&self, iv: &IterVar) -> ScheduleResult<()> {
        if self.leaf_iter_vars.contains(iv) || self.all_iter_vars.contains(iv) {
            Ok(())
        } else {
            Err(ScheduleError::UnknownIterVar {
                stage: self.op.name.clone(),
                iter_var: iv.var.name.clone(),
            })
        }
    }

    /// `split(parent, factor)`: replaces `parent` in the leaves by a fresh
    /// `(outer, inner)` pair, `outer` first.
    pub fn split(&mut self, parent: &IterVar, factor: Expr) -> ScheduleResult<(IterVar, IterVar)> {
        self.split_inner(parent, Some(factor), None)
    }

    /// `split_by_nparts(parent, nparts)`: same shape, `nparts` fixes the
    /// outer extent instead of the inner one.
    pub fn split_by_nparts(&mut self, parent: &IterVar, nparts: Expr) -> ScheduleResult<(IterVar, IterVar)> {
        self.split_inner(parent, None, Some(nparts))
    }

    fn split_inner(
        &mut self,
        parent: &IterVar,
        factor: Option<Expr>,
        nparts: Option<Expr>,
    ) -> ScheduleResult<(IterVar, IterVar)> {
        let pos = self.require_leaf(parent)?;
        let outer = new_iter_var(format!("{}.outer", parent.var.name), None, parent.iter_type);
        let inner = new_iter_var(format!("{}.inner", parent.var.name), None, parent.iter_type);
        self.all_iter_vars.push(outer.clone());
        self.all_iter_vars.push(inner.clone());
        self.leaf_iter_vars.splice(pos..=pos, [outer.clone(), inner.clone()]);
        self.relations.push(IterVarRelation::Split {
            parent: parent.clone(),
            outer: outer.clone(),
            inner: inner.clone(),
            factor,
            nparts,
        });
        Ok((outer, inner))
    }

    /// `fuse(outer, inner)`: requires `outer` immediately precedes `inner`
    /// in the current leaves.
    pub fn fuse(&mut self, outer: &IterVar, inner: &IterVar) -> ScheduleResult<IterVar> {
        let outer_pos = self.require_leaf(outer)?;
        let inner_pos = self.require_leaf(inner)?;
        if inner_pos != outer_pos + 1 {
            return Err(ScheduleError::NonAdjacentFuse {
                stage: self.op.name.clone(),
                outer: outer.var.name.clone(),
                inner: inner.var.name.clone(),
            });
        }
        let fused = new_iter_var(format!("{}.{}.fused", outer.var.name, inner.var.name), None, outer.iter_type);
        self.all_iter_vars.push(fused.clone());
        self.leaf_iter_vars.splice(outer_pos..=inner_pos, [fused.clone()]);
        self.relations.push(IterVarRelation::Fuse {
            outer: outer.clone(),
            inner: inner.clone(),
            fused: fused.clone(),
        });
        Ok(fused)
    }

    /// `reorder(order)`: `order` must be a permutation of an existing
    /// subset of leaves; the new leaf sequence is produced by walking the
    /// current leaves left to right and substituting in `order`'s elements
    /// at each position a member of `order` previously occupied.
    pub fn reorder(&mut self, order: &[IterVar]) -> ScheduleResult<()> {
        let mut seen = std::collections::HashSet::new();
        for iv in order {
            self.require_leaf(iv)?;
            if !seen.insert(iv.clone()) {
                return Err(ScheduleError::BadReorder {
                    stage: self.op.name.clone(),
                });
            }
        }
        let mut order_iter = order.iter().cloned();
        let new_leaves: Vec<IterVar> = self
            .leaf_iter_vars
            .iter()
            .map(|leaf| {
                if seen.contains(leaf) {
                    order_iter.next().expect("same cardinality as seen set")
                } else {
                    leaf.clone()
                }
            })
            .collect();
        self.leaf_iter_vars = new_leaves;
        self.relations.push(IterVarRelation::Reorder { order: order.to_vec() });
        Ok(())
    }

    /// `tile`: `split(x, x_factor) -> split(y, y_factor) -> reorder(...)`.
    pub fn tile(
        &mut self,
        x: &IterVar,
        y: &IterVar,
        x_factor: Expr,
        y_factor: Expr,
    ) -> ScheduleResult<(IterVar, IterVar, IterVar, IterVar)> {
        let (x_outer, x_inner) = self.split(x, x_factor)?;
        let (y_outer, y_inner) = self.split(y, y_factor)?;
        self.reorder(&[x_outer.clone(), y_outer.clone(), x_inner.clone(), y_inner.clone()])?;
        Ok((x_outer, y_outer, x_inner, y_inner))
    }

    /// `compute_at(parent, scope)`: `scope` must be a leaf of `parent`.
    pub fn compute_at(&mut self, parent: &Stage, scope: &IterVar) -> ScheduleResult<()> {
        if !parent.leaf_iter_vars.contains(scope) {
            return Err(ScheduleError::UnknownIterVar {
                stage: parent.op.name.clone(),
                iter_var: scope.var.name.clone(),
            });
        }
        self.attach_type = AttachType::Scope;
        self.attach_ivar = Some(scope.clone());
        self.attach_stage = Some(parent.id);
        self.origin_attach_ivar = Some(scope.clone());
        Ok(())
    }

    pub fn compute_inline(&mut self) {
        self.attach_type = AttachType::Inline;
    }

    pub fn compute_root(&mut self) {
        self.attach_type = AttachType::GroupRoot;
    }

    /// `bind(ivar, thread_ivar)`: records the thread axis `ivar` is bound
    /// to, and overrides `ivar`'s effective iter type to the thread axis's
    /// own type so downstream passes see it as thread-bound rather than its
    /// original `DataPar`/`CommReduce` kind.
    pub fn bind(&mut self, ivar: &IterVar, thread_ivar: IterVar) -> ScheduleResult<()> {
        self.require_leaf(ivar)?;
        let attr = self.iter_var_attrs.entry(ivar.clone()).or_default();
        attr.iter_type_override = Some(thread_ivar.iter_type);
        attr.bind_thread = Some(thread_ivar);
        Ok(())
    }

    fn set_override(&mut self, ivar: &IterVar, ty: IterVarType, allowed: &[IterVarType]) -> ScheduleResult<()> {
        self.require_leaf(ivar)?;
        if !allowed.is_empty() && !allowed.contains(&ivar.iter_type) {
            return Err(ScheduleError::IncompatibleIterType {
                iter_var: ivar.var.name.clone(),
                actual: ivar.iter_type,
                expected: allowed.to_vec(),
            });
        }
        self.iter_var_attrs.entry(ivar.clone()).or_default().iter_type_override = Some(ty);
        Ok(())
    }

    pub fn vectorize(&mut self, ivar: &IterVar) -> ScheduleResult<()> {
        self.set_override(ivar, IterVarType::Vectorized, &[IterVarType::DataPar, IterVarType::Unrolled])
    }

    pub fn unroll(&mut self, ivar: &IterVar) -> ScheduleResult<()> {
        self.set_override(ivar, IterVarType::Unrolled, &[])
    }

    pub fn parallel(&mut self, ivar: &IterVar) -> ScheduleResult<()> {
        self.set_override(ivar, IterVarType::Parallelized, &[IterVarType::DataPar, IterVarType::CommReduce])
    }

    pub fn pipeline(&mut self, ivar: &IterVar) -> ScheduleResult<()> {
        self.set_override(ivar, IterVarType::Pipelined, &[])
    }

    pub fn tensorize(&mut self, ivar: &IterVar, intrin: impl Into<String>) -> ScheduleResult<()> {
        self.require_leaf(ivar)?;
        self.iter_var_attrs.entry(ivar.clone()).or_default().tensorize_intrin = Some(intrin.into());
        self.set_override(ivar, IterVarType::Tensorized, &[])
    }

    pub fn pragma(&mut self, ivar: &IterVar, key: impl Into<String>, value: Expr) -> ScheduleResult<()> {
        self.require_present(ivar)?;
        self.iter_var_attrs.entry(ivar.clone()).or_default().pragmas.push((key.into(), value));
        Ok(())
    }

    pub fn prefetch(&mut self, ivar: &IterVar, offset: Expr) -> ScheduleResult<()> {
        self.require_present(ivar)?;
        self.iter_var_attrs.entry(ivar.clone()).or_default().prefetch_offsets.push(offset);
        Ok(())
    }

    pub fn storage_align(&mut self, ivar: &IterVar, factor: i64, offset: i64) -> ScheduleResult<()> {
        self.require_present(ivar)?;
        self.iter_var_attrs.entry(ivar.clone()).or_default().dim_align = Some((factor, offset));
        Ok(())
    }

    pub fn set_scope(&mut self, scope: impl Into<String>) {
        self.scope = scope.into();
    }

    pub fn set_store_predicate(&mut self, pred: Expr) {
        self.store_predicate = Some(pred);
    }

    pub fn set_env_threads(&mut self, threads: Vec<IterVar>) {
        self.env_threads = threads;
    }

    pub fn set_double_buffer(&mut self) {
        self.double_buffer = true;
    }

    pub fn set_stencil(&mut self) {
        self.stencil = true;
    }

    /// Stage-local `stream` annotation. There is no schedule-wide `stream`
    /// entry point — streaming is only ever surfaced per-stage.
    pub fn set_stream(&mut self) {
        self.stream = true;
    }

    /// The leaf frontier of `all_iter_vars` under `relations`: every
    /// `IterVar` reachable from roots that has no outgoing relation whose
    /// parent is it. Used by property tests to check `leaf_iter_vars`
    /// against an independently-computed frontier.
    pub fn computed_leaf_frontier(&self) -> Vec<IterVar> {
        let mut has_outgoing = std::collections::HashSet::new();
        for rel in &self.relations {
            match rel {
                IterVarRelation::Split { parent, .. } => {
                    has_outgoing.insert(parent.clone());
                }
                IterVarRelation::Fuse { outer, inner, .. } => {
                    has_outgoing.insert(outer.clone());
                    has_outgoing.insert(inner.clone());
                }
                IterVarRelation::Rebase { parent, .. } => {
                    has_outgoing.insert(parent.clone());
                }
                IterVarRelation::Reorder { .. } => {}
            }
        }
        self.all_iter_vars
            .iter()
            .filter(|iv| !has_outgoing.contains(*iv))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{compute_op, placeholder_op};
    use crate::itervar::range_iter_var;

    fn stage_with_axis(extent: i64) -> (Stage, IterVar) {
        let i = range_iter_var("i", Expr::int(extent), IterVarType::DataPar);
        let op = compute_op("S", "", vec![i.clone()], vec![], vec![Expr::int(0)]);
        (Stage::new(op), i)
    }

    #[test]
    fn test_split_replaces_parent_with_outer_inner() {
        let (mut stage, i) = stage_with_axis(32);
        let (outer, inner) = stage.split(&i, Expr::int(4)).unwrap();
        assert_eq!(stage.leaf_iter_vars, vec![outer, inner]);
    }

    #[test]
    fn test_split_unknown_iter_var_rejected() {
        let (mut stage, _i) = stage_with_axis(32);
        let stray = range_iter_var("stray", Expr::int(1), IterVarType::DataPar);
        let err = stage.split(&stray, Expr::int(2)).unwrap_err();
        assert!(matches!(err, ScheduleError::UnknownIterVar { .. }));
    }

    #[test]
    fn test_fuse_non_adjacent_rejected() {
        let i = range_iter_var("i", Expr::int(8), IterVarType::DataPar);
        let j = range_iter_var("j", Expr::int(8), IterVarType::DataPar);
        let k = range_iter_var("k", Expr::int(8), IterVarType::DataPar);
        let op = compute_op("S", "", vec![i.clone(), j.clone(), k.clone()], vec![], vec![Expr::int(0)]);
        let mut stage = Stage::new(op);
        let err = stage.fuse(&i, &k).unwrap_err();
        assert!(matches!(err, ScheduleError::NonAdjacentFuse { .. }));
    }

    #[test]
    fn test_split_then_fuse_round_trips_leaves() {
        let (mut stage, i) = stage_with_axis(32);
        let (outer, inner) = stage.split(&i, Expr::int(4)).unwrap();
        let fused = stage.fuse(&outer, &inner).unwrap();
        assert_eq!(stage.leaf_iter_vars, vec![fused]);
    }

    #[test]
    fn test_reorder_permutes_subset_of_leaves() {
        let i = range_iter_var("i", Expr::int(8), IterVarType::DataPar);
        let j = range_iter_var("j", Expr::int(8), IterVarType::DataPar);
        let k = range_iter_var("k", Expr::int(8), IterVarType::DataPar);
        let op = compute_op("S", "", vec![i.clone(), j.clone(), k.clone()], vec![], vec![Expr::int(0)]);
        let mut stage = Stage::new(op);
        stage.reorder(&[k.clone(), i.clone()]).unwrap();
        assert_eq!(stage.leaf_iter_vars, vec![k, j, i]);
    }

    #[test]
    fn test_reorder_with_duplicate_is_bad_reorder() {
        let (mut stage, i) = stage_with_axis(8);
        let err = stage.reorder(&[i.clone(), i]).unwrap_err();
        assert!(matches!(err, ScheduleError::BadReorder { .. }));
    }

    #[test]
    fn test_vectorize_rejects_comm_reduce_axis() {
        let k = range_iter_var("k", Expr::int(8), IterVarType::CommReduce);
        let op = compute_op("S", "", vec![], vec![k.clone()], vec![Expr::int(0)]);
        let mut stage = Stage::new(op);
        let err = stage.vectorize(&k).unwrap_err();
        assert!(matches!(err, ScheduleError::IncompatibleIterType { .. }));
    }

    #[test]
    fn test_bind_overrides_effective_iter_type_to_thread_axis() {
        let (mut stage, i) = stage_with_axis(8);
        let thread = range_iter_var("threadIdx.x", Expr::int(8), IterVarType::Parallelized);
        stage.bind(&i, thread.clone()).unwrap();

        let attr = &stage.iter_var_attrs[&i];
        assert_eq!(attr.bind_thread, Some(thread));
        assert_eq!(attr.iter_type_override, Some(IterVarType::Parallelized));
    }

    #[test]
    fn test_compute_at_requires_scope_is_parent_leaf() {
        let producer = placeholder_op("P", vec![Expr::int(8)]);
        let parent_stage = Stage::new(producer);
        let (mut child, _) = stage_with_axis(8);
        let foreign = range_iter_var("foreign", Expr::int(8), IterVarType::DataPar);
        let err = child.compute_at(&parent_stage, &foreign).unwrap_err();
        assert!(matches!(err, ScheduleError::UnknownIterVar { .. }));
    }

    #[test]
    fn test_tile_produces_four_leaves_in_order() {
        let x = range_iter_var("x", Expr::int(16), IterVarType::DataPar);
        let y = range_iter_var("y", Expr::int(16), IterVarType::DataPar);
        let op = compute_op("S", "", vec![x.clone(), y.clone()], vec![], vec![Expr::int(0)]);
        let mut stage = Stage::new(op);
        let (xo, yo, xi, yi) = stage.tile(&x, &y, Expr::int(4), Expr::int(4)).unwrap();
        assert_eq!(stage.leaf_iter_vars, vec![xo, yo, xi, yi]);
    }
}
