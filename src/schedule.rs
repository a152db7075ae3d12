//! Dataflow rewrites, normalization, and the `Schedule` collection itself.
//! This is the algorithmically richest module: every method that adds or
//! replaces a `Stage` preserves topological order by construction — it
//! inserts new stages at the position the algorithm specifies and runs
//! [`Schedule::replace_dataflow`] to cascade tensor identity changes to
//! every downstream consumer in one topological-order pass.

use std::collections::{HashMap, HashSet};

use crate::config::Config;
use crate::error::{ScheduleError, ScheduleResult};
use crate::ir::{
    call, compute_op, extern_op, is_one, is_zero, make_zero, new_buffer, output_tensor, placeholder_op,
    reduce_consistent, replace_inputs, substitute_vars, Buffer, Expr, Operation, OperationKind, Range, ReduceNode,
    Stmt, Tensor,
};
use crate::itervar::{new_iter_var, range_iter_var, AttachType, IterVar, IterVarRelation, IterVarType, PartitionType};
use crate::message_passing::{
    make_bound_check, pass_down_bitmask_or, pass_down_domain, pass_down_index, pass_up_bitmask_or, pass_up_index,
};
use crate::stage::Stage;

/// The schedule: a topologically-ordered collection of `Stage`s plus the
/// lookup tables the rewrites need.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub outputs: Vec<Operation>,
    pub stages: Vec<Stage>,
    pub groups: Vec<Stage>,
    pub stage_map: HashMap<Operation, usize>,
    pub stage_buff_map: HashMap<Buffer, usize>,
    pub extern_itervar_map: HashMap<IterVar, IterVar>,
    pub config: Config,
}

fn visit_op(op: &Operation, stages: &mut Vec<Stage>, stage_map: &mut HashMap<Operation, usize>, visited: &mut HashSet<Operation>) {
    if visited.contains(op) {
        return;
    }
    visited.insert(op.clone());
    for input in op.input_tensors() {
        visit_op(&input.op, stages, stage_map, visited);
    }
    stage_map.insert(op.clone(), stages.len());
    stages.push(Stage::new(op.clone()));
}

fn tensor_shape(t: &Tensor) -> Vec<Expr> {
    match &t.op.kind {
        OperationKind::Placeholder(p) => p.shape.clone(),
        OperationKind::Compute(c) => c
            .axis
            .iter()
            .map(|iv| iv.dom.as_ref().map(|d| (*d.extent).clone()).unwrap_or_else(|| Expr::int(0)))
            .collect(),
        OperationKind::Extern(e) => e
            .output_placeholders
            .get(t.value_index)
            .map(|b| b.shape.clone())
            .unwrap_or_default(),
    }
}

impl Schedule {
    /// `Schedule::make(outputs)`: walks the dataflow graph from `outputs`
    /// in reverse topological order, creating one `Stage` per `Operation`
    /// encountered. `stages` comes out leaf-first (producers before
    /// consumers).
    pub fn make(outputs: Vec<Operation>) -> Schedule {
        Self::make_with_config(outputs, Config::default())
    }

    pub fn make_with_config(outputs: Vec<Operation>, config: Config) -> Schedule {
        let mut stages = Vec::new();
        let mut stage_map = HashMap::new();
        let mut visited = HashSet::new();
        for op in &outputs {
            visit_op(op, &mut stages, &mut stage_map, &mut visited);
        }
        Schedule {
            outputs,
            stages,
            groups: Vec::new(),
            stage_map,
            stage_buff_map: HashMap::new(),
            extern_itervar_map: HashMap::new(),
            config,
        }
    }

    /// `copy()`: an independent `Schedule` whose `Stage`s can be mutated
    /// without affecting `self`. `Operation`s are shared (`Rc` clone) since
    /// they are immutable values.
    pub fn copy(&self) -> Schedule {
        Schedule {
            outputs: self.outputs.clone(),
            stages: self.stages.clone(),
            groups: self.groups.clone(),
            stage_map: self.stage_map.clone(),
            stage_buff_map: self.stage_buff_map.clone(),
            extern_itervar_map: self.extern_itervar_map.clone(),
            config: self.config.clone(),
        }
    }

    fn rebuild_stage_map(&mut self) {
        self.stage_map.clear();
        for (i, s) in self.stages.iter().enumerate() {
            self.stage_map.insert(s.op.clone(), i);
        }
    }

    pub fn stage_of(&self, op: &Operation) -> Option<&Stage> {
        self.stage_map.get(op).map(|&i| &self.stages[i])
    }

    /// Aggregates a forest of member stages under a fresh group stage,
    /// optionally attached into `attach_at`'s loop nest. Returns the new
    /// group's id (`Stage::group`'s weak back-reference target).
    pub fn create_group(&mut self, member_ops: &[Operation], attach_at: Option<(&Operation, &IterVar)>) -> u64 {
        let group_placeholder = placeholder_op(format!("group${}", self.groups.len()), vec![]);
        let mut group_stage = Stage::new(group_placeholder);
        if let Some((parent_op, scope)) = attach_at {
            if let Some(&parent_idx) = self.stage_map.get(parent_op) {
                let parent_clone = self.stages[parent_idx].clone();
                let _ = group_stage.compute_at(&parent_clone, scope);
            }
        }
        group_stage.num_child_stages = member_ops.len();
        let group_id = group_stage.id;
        self.groups.push(group_stage);
        for op in member_ops {
            if let Some(&idx) = self.stage_map.get(op) {
                self.stages[idx].group = Some(group_id);
            }
        }
        group_id
    }

    /// Shared subroutine: rewrites every stage's `op` via
    /// `replace_inputs(vmap)`; a changed identity extends `vmap` with its
    /// output renames. A single forward pass suffices because `stages` is
    /// already topologically ordered: a producer's rename is recorded
    /// before any of its consumers are visited.
    fn replace_dataflow(&mut self, vmap: &mut HashMap<Tensor, Tensor>) {
        for i in 0..self.stages.len() {
            let op = self.stages[i].op.clone();
            let new_op = replace_inputs(&op, vmap);
            if new_op.id != op.id {
                for k in 0..op.num_outputs() {
                    vmap.insert(output_tensor(&op, k), output_tensor(&new_op, k));
                }
                self.stages[i].op = new_op;
            }
        }
        self.rebuild_stage_map();
    }

    /// `cache_read(target, scope, readers)`: inserts a cache stage between `target` and its readers.
    pub fn cache_read(&mut self, target: &Tensor, scope: &str, readers: &[Operation]) -> ScheduleResult<Tensor> {
        let target_idx = *self
            .stage_map
            .get(&target.op)
            .expect("cache_read target must already be part of this schedule");

        let shape = tensor_shape(target);
        let new_axis: Vec<IterVar> = shape
            .iter()
            .enumerate()
            .map(|(i, ext)| range_iter_var(format!("ax{i}"), ext.clone(), IterVarType::DataPar))
            .collect();
        let args: Vec<Expr> = new_axis.iter().map(|iv| Expr::Var(iv.var.clone())).collect();
        let body = call(target.clone(), args);
        let cache_op = compute_op(format!("{}.{}", target.op.name, scope), target.op.tag.clone(), new_axis, vec![], vec![body]);
        let cache_tensor = output_tensor(&cache_op, 0);

        let mut local_vmap = HashMap::new();
        local_vmap.insert(target.clone(), cache_tensor.clone());

        let mut cascade_vmap: HashMap<Tensor, Tensor> = HashMap::new();
        for reader in readers {
            let idx = *self.stage_map.get(reader).ok_or_else(|| ScheduleError::UnknownConsumer {
                target: target.op.name.clone(),
                reader: reader.name.clone(),
            })?;
            let current = self.stages[idx].op.clone();
            if !current.input_tensors().contains(target) {
                return Err(ScheduleError::UnknownConsumer {
                    target: target.op.name.clone(),
                    reader: reader.name.clone(),
                });
            }
            let replaced = replace_inputs(&current, &local_vmap);
            if replaced.id != current.id {
                for k in 0..current.num_outputs() {
                    cascade_vmap.insert(output_tensor(&current, k), output_tensor(&replaced, k));
                }
                self.stages[idx].op = replaced;
            }
        }

        let mut cache_stage = Stage::new(cache_op);
        cache_stage.set_scope(scope);
        cache_stage.group = self.stages[target_idx].group;
        self.stages.insert(target_idx + 1, cache_stage);
        self.rebuild_stage_map();

        if !cascade_vmap.is_empty() {
            self.replace_dataflow(&mut cascade_vmap);
        }
        tracing::debug!(target = %target.op.name, scope, readers = readers.len(), "cache_read");
        Ok(cache_tensor)
    }

    /// `cache_write(target, scope)` with relayout.
    pub fn cache_write(&mut self, target: &Tensor, scope: &str) -> ScheduleResult<Tensor> {
        let idx = *self
            .stage_map
            .get(&target.op)
            .expect("cache_write target must already be part of this schedule");
        let compute = match &target.op.kind {
            OperationKind::Compute(c) if c.body.len() == 1 => c.clone(),
            _ => {
                return Err(ScheduleError::CacheWriteNotCompute {
                    op: target.op.name.clone(),
                })
            }
        };

        let stage_relations = self.stages[idx].relations.clone();
        let stage_leaves = self.stages[idx].leaf_iter_vars.clone();

        let mut root_dom: HashMap<IterVar, Range> = HashMap::new();
        for iv in compute.axis.iter().chain(compute.reduce_axis.iter()) {
            if let Some(d) = &iv.dom {
                root_dom.insert(iv.clone(), d.clone());
            }
        }
        let leaf_dom = pass_down_domain(&stage_relations, &root_dom);
        let mut merged_dom = root_dom.clone();
        merged_dom.extend(leaf_dom.clone());

        let mut reduce_marks = HashMap::new();
        for r in &compute.reduce_axis {
            reduce_marks.insert(r.clone(), true);
        }
        let touched = pass_down_bitmask_or(&stage_relations, &reduce_marks);
        let non_reduce_leaves: Vec<IterVar> = stage_leaves
            .iter()
            .filter(|iv| !*touched.get(*iv).unwrap_or(&false))
            .cloned()
            .collect();

        let mut new_axis = Vec::new();
        let mut vsub2newvar: HashMap<u64, Expr> = HashMap::new();
        for iv in &non_reduce_leaves {
            let dom = leaf_dom
                .get(iv)
                .cloned()
                .unwrap_or_else(|| Range::make_by_min_extent(Expr::int(0), Expr::int(1)));
            if is_one(&dom.min) {
                vsub2newvar.insert(iv.var.id, (*dom.min).clone());
            } else {
                let fresh = range_iter_var(format!("{}.c", iv.var.name), (*dom.extent).clone(), iv.iter_type);
                vsub2newvar.insert(iv.var.id, Expr::Var(fresh.var.clone()));
                new_axis.push(fresh);
            }
        }

        let mut leaf_value_map = HashMap::new();
        for iv in &stage_leaves {
            leaf_value_map.insert(iv.clone(), Expr::Var(iv.var.clone()));
        }
        let up_values = pass_up_index(&stage_relations, &leaf_dom, &leaf_value_map);
        let mut skip_bound_check = compute.reduce_axis.clone();
        if self.config.bounds.skip_bound_check_default {
            skip_bound_check.extend(compute.axis.iter().cloned());
        }
        let pred = make_bound_check(&stage_relations, &merged_dom, &up_values, &skip_bound_check);

        let mut vsub: HashMap<u64, Expr> = HashMap::new();
        for iv in &compute.axis {
            if let Some(v) = up_values.get(iv) {
                vsub.insert(iv.var.id, v.clone());
            }
        }
        let orig_body = &compute.body[0];
        let body_substituted = substitute_vars(orig_body, &vsub);
        let pred_is_trivial = matches!(&pred, Expr::IntImm(1));
        let body_with_pred = match body_substituted {
            Expr::Reduce(r) => Expr::Reduce(Box::new(ReduceNode {
                condition: Box::new(Expr::And(r.condition, Box::new(pred.clone()))),
                ..*r
            })),
            other if !pred_is_trivial => Expr::Select {
                cond: Box::new(pred.clone()),
                t: Box::new(other),
                f: Box::new(make_zero()),
            },
            other => other,
        };
        let final_body = substitute_vars(&body_with_pred, &vsub2newvar);

        let cache_op = compute_op(
            format!("{}.{}", target.op.name, scope),
            target.op.tag.clone(),
            new_axis,
            compute.reduce_axis.clone(),
            vec![final_body],
        );
        let cache_tensor = output_tensor(&cache_op, 0);

        let root_value_map: HashMap<IterVar, Expr> = compute.axis.iter().map(|iv| (iv.clone(), Expr::Var(iv.var.clone()))).collect();
        let down_values = pass_down_index(&stage_relations, &merged_dom, &root_value_map, false);
        let args: Vec<Expr> = non_reduce_leaves
            .iter()
            .map(|iv| down_values.get(iv).cloned().unwrap_or_else(|| Expr::Var(iv.var.clone())))
            .collect();
        let replacement_body = call(cache_tensor.clone(), args);
        let replacement_op = compute_op(target.op.name.clone(), target.op.tag.clone(), compute.axis.clone(), vec![], vec![replacement_body]);

        let mut cascade_vmap = HashMap::new();
        cascade_vmap.insert(target.clone(), output_tensor(&replacement_op, 0));

        self.stages[idx].op = replacement_op;
        self.stages[idx].all_iter_vars = self.stages[idx].op.root_iter_vars();
        self.stages[idx].leaf_iter_vars = self.stages[idx].op.root_iter_vars();
        self.stages[idx].relations.clear();

        let mut cache_stage = Stage::new(cache_op);
        cache_stage.set_scope(scope);
        cache_stage.group = self.stages[idx].group;
        self.stages.insert(idx, cache_stage);
        self.rebuild_stage_map();

        self.replace_dataflow(&mut cascade_vmap);
        tracing::debug!(target = %target.op.name, scope, "cache_write");
        Ok(cache_tensor)
    }

    /// `rfactor(tensor, axis, factor_axis)`.
    pub fn rfactor(&mut self, tensor: &Tensor, axis: &IterVar, factor_axis: i64) -> ScheduleResult<Vec<Tensor>> {
        if axis.iter_type != IterVarType::CommReduce {
            return Err(ScheduleError::FactorAxisNotReduction {
                axis: axis.var.name.clone(),
            });
        }
        let idx = *self
            .stage_map
            .get(&tensor.op)
            .expect("rfactor target must already be part of this schedule");
        let compute = match &tensor.op.kind {
            OperationKind::Compute(c) => c.clone(),
            _ => {
                return Err(ScheduleError::FactorAxisNotReduction {
                    axis: axis.var.name.clone(),
                })
            }
        };
        let stage_relations = self.stages[idx].relations.clone();
        let stage_leaves = self.stages[idx].leaf_iter_vars.clone();
        if !stage_leaves.contains(axis) {
            return Err(ScheduleError::UnknownIterVar {
                stage: tensor.op.name.clone(),
                iter_var: axis.var.name.clone(),
            });
        }

        let mut marks = HashMap::new();
        marks.insert(axis.clone(), true);
        let up = pass_up_bitmask_or(&stage_relations, &marks);
        let touch_map = pass_down_bitmask_or(&stage_relations, &up);

        for root in &compute.axis {
            if *touch_map.get(root).unwrap_or(&false) {
                return Err(ScheduleError::FactorTouchesDataPar {
                    axis: axis.var.name.clone(),
                    root: root.var.name.clone(),
                });
            }
        }

        let mut root_dom: HashMap<IterVar, Range> = HashMap::new();
        for iv in compute.axis.iter().chain(compute.reduce_axis.iter()) {
            if let Some(d) = &iv.dom {
                root_dom.insert(iv.clone(), d.clone());
            }
        }
        let leaf_dom = pass_down_domain(&stage_relations, &root_dom);
        let mut merged_dom = root_dom.clone();
        merged_dom.extend(leaf_dom.clone());

        let non_reduce_leaves: Vec<IterVar> = stage_leaves
            .iter()
            .filter(|iv| iv.iter_type != IterVarType::CommReduce)
            .cloned()
            .collect();
        let reduce_leaves: Vec<IterVar> = stage_leaves
            .iter()
            .filter(|iv| iv.iter_type == IterVarType::CommReduce)
            .cloned()
            .collect();

        let injected_dom = leaf_dom
            .get(axis)
            .cloned()
            .unwrap_or_else(|| Range::make_by_min_extent(Expr::int(0), Expr::int(1)));
        let injected_axis = new_iter_var(format!("{}.rf", axis.var.name), Some(injected_dom), IterVarType::DataPar);

        let mut new_reduce_axis = Vec::new();
        let mut value_map: HashMap<IterVar, Expr> = HashMap::new();
        for iv in &non_reduce_leaves {
            value_map.insert(iv.clone(), Expr::Var(iv.var.clone()));
        }
        for iv in &reduce_leaves {
            if iv == axis {
                value_map.insert(iv.clone(), Expr::Var(injected_axis.var.clone()));
                continue;
            }
            if *touch_map.get(iv).unwrap_or(&false) {
                let dom = leaf_dom
                    .get(iv)
                    .cloned()
                    .unwrap_or_else(|| Range::make_by_min_extent(Expr::int(0), Expr::int(1)));
                if is_one(&dom.extent) {
                    value_map.insert(iv.clone(), (*dom.min).clone());
                } else {
                    let renamed = new_iter_var(format!("{}.v", iv.var.name), Some(dom), IterVarType::CommReduce);
                    value_map.insert(iv.clone(), Expr::Var(renamed.var.clone()));
                    new_reduce_axis.push(renamed);
                }
            } else {
                value_map.insert(iv.clone(), Expr::Var(iv.var.clone()));
                new_reduce_axis.push(iv.clone());
            }
        }
        let up_values = pass_up_index(&stage_relations, &leaf_dom, &value_map);
        let mut vsub: HashMap<u64, Expr> = HashMap::new();
        for iv in compute.axis.iter().chain(compute.reduce_axis.iter()) {
            if let Some(v) = up_values.get(iv) {
                vsub.insert(iv.var.id, v.clone());
            }
        }

        let n_root = compute.axis.len();
        let pos = if factor_axis < 0 {
            ((n_root as i64) + 1 + factor_axis).max(0) as usize
        } else {
            (factor_axis as usize).min(n_root)
        };
        // Root axes, not the stage's current leaf frontier: a non-reduce axis
        // may have been split/fused/reordered on the Stage before rfactor is
        // called, but the factored op still declares the op's true root shape,
        // matching the replacement op's own axis (`compute.axis`, below).
        let mut factored_axis_list = compute.axis.clone();
        factored_axis_list.insert(pos, injected_axis.clone());

        let mut skip_bound_check = compute.axis.clone();
        for r in &compute.reduce_axis {
            if !*touch_map.get(r).unwrap_or(&false) {
                skip_bound_check.push(r.clone());
            }
        }
        if self.config.bounds.skip_bound_check_default {
            skip_bound_check.extend(compute.reduce_axis.iter().cloned());
        }
        let pred = make_bound_check(&stage_relations, &merged_dom, &up_values, &skip_bound_check);

        let mut factored_bodies = Vec::with_capacity(compute.body.len());
        for (value_index, b) in compute.body.iter().enumerate() {
            let Expr::Reduce(r) = b else {
                return Err(ScheduleError::FactorAxisNotReduction {
                    axis: axis.var.name.clone(),
                });
            };
            let new_source: Vec<Expr> = r.source.iter().map(|s| substitute_vars(s, &vsub)).collect();
            let new_condition = Expr::And(Box::new(substitute_vars(&r.condition, &vsub)), Box::new(pred.clone()));
            factored_bodies.push(Expr::Reduce(Box::new(ReduceNode {
                combiner: r.combiner.clone(),
                source: new_source,
                axis: new_reduce_axis.clone(),
                condition: Box::new(new_condition),
                value_index,
            })));
        }
        let factored_op = compute_op(format!("{}.rf", tensor.op.name), tensor.op.tag.clone(), factored_axis_list.clone(), new_reduce_axis, factored_bodies);

        let repl_red_axis = new_iter_var(format!("{}.v", axis.var.name), Some(injected_dom_for_repl(&factored_op, pos)), IterVarType::CommReduce);

        let mut repl_bodies = Vec::with_capacity(compute.body.len());
        for (value_index, b) in compute.body.iter().enumerate() {
            let Expr::Reduce(r) = b else { unreachable!("validated above") };
            let mut call_args = Vec::with_capacity(factored_axis_list.len());
            let mut root_idx = 0;
            for i in 0..factored_axis_list.len() {
                if i == pos {
                    call_args.push(Expr::Var(repl_red_axis.var.clone()));
                } else {
                    // Same root var as `repl_op`'s own axis at this position
                    // (both reuse `compute.axis` directly), so no translation
                    // through the stage's leaf frontier is needed.
                    call_args.push(Expr::Var(compute.axis[root_idx].var.clone()));
                    root_idx += 1;
                }
            }
            let factor_tensor = output_tensor(&factored_op, value_index);
            repl_bodies.push(Expr::Reduce(Box::new(ReduceNode {
                combiner: r.combiner.clone(),
                source: vec![call(factor_tensor, call_args)],
                axis: vec![repl_red_axis.clone()],
                condition: Box::new(crate::ir::const_true()),
                value_index,
            })));
        }
        let repl_op = compute_op(tensor.op.name.clone(), tensor.op.tag.clone(), compute.axis.clone(), vec![repl_red_axis], repl_bodies);

        let mut cascade_vmap = HashMap::new();
        for i in 0..compute.body.len() {
            cascade_vmap.insert(output_tensor(&tensor.op, i), output_tensor(&repl_op, i));
        }

        let mut factored_stage = Stage::new(factored_op.clone());
        factored_stage.group = self.stages[idx].group;
        self.stages.insert(idx, factored_stage);
        let orig_idx = idx + 1;
        self.stages[orig_idx].op = repl_op.clone();
        self.stages[orig_idx].all_iter_vars = repl_op.root_iter_vars();
        self.stages[orig_idx].leaf_iter_vars = repl_op.root_iter_vars();
        self.stages[orig_idx].relations.clear();
        self.rebuild_stage_map();
        self.replace_dataflow(&mut cascade_vmap);

        tracing::debug!(op = %tensor.op.name, axis = %axis.var.name, factor_axis, "rfactor");
        Ok((0..factored_op.num_outputs()).map(|i| output_tensor(&factored_op, i)).collect())
    }

    /// Inject-inline: flips every `Inline`-attached stage to
    /// `InlinedAlready` and substitutes its body into every later
    /// `Compute` stage that reads it.
    pub fn inject_inline(&mut self) -> ScheduleResult<()> {
        let n = self.stages.len();
        for i in (0..n).rev() {
            if self.stages[i].attach_type != AttachType::Inline {
                continue;
            }
            let op = self.stages[i].op.clone();
            let compute = match &op.kind {
                OperationKind::Compute(c) if c.body.len() == 1 => c.clone(),
                _ => return Err(ScheduleError::InlineNotCompute { op: op.name.clone() }),
            };
            let inlined_tensor = output_tensor(&op, 0);
            let params: Vec<_> = compute.axis.iter().map(|iv| iv.var.clone()).collect();
            let inline_body = compute.body[0].clone();

            self.stages[i].attach_type = AttachType::InlinedAlready;
            tracing::debug!(stage = %op.name, "inject_inline");

            for j in (i + 1)..n {
                let s_op = self.stages[j].op.clone();
                let sc = match &s_op.kind {
                    OperationKind::Compute(sc) => sc.clone(),
                    _ => continue,
                };

                let mut reduce_template: Option<ReduceNode> = None;
                for b in &sc.body {
                    if let Expr::Reduce(r) = b {
                        if let Some(t) = &reduce_template {
                            if !reduce_consistent(t, r) {
                                return Err(ScheduleError::InconsistentReduce { op: s_op.name.clone() });
                            }
                        } else {
                            reduce_template = Some((**r).clone());
                        }
                    }
                }

                let mut changed = false;
                let new_bodies: Vec<Expr> = sc
                    .body
                    .iter()
                    .map(|b| {
                        let (nb, ch) = inline_into(b, &inlined_tensor, &params, &inline_body);
                        changed |= ch;
                        nb
                    })
                    .collect();
                if changed {
                    let new_op = compute_op(s_op.name.clone(), s_op.tag.clone(), sc.axis.clone(), sc.reduce_axis.clone(), new_bodies);
                    self.stages[j].op = new_op;
                }
            }
        }
        let mut vmap = HashMap::new();
        self.replace_dataflow(&mut vmap);
        Ok(())
    }

    /// Optional rebase pass: for
    /// every non-zero-min, non-thread-bound root that is still a leaf,
    /// inserts a `Rebase` relation and renames any `attach_ivar` pointing
    /// at it.
    pub fn rebase_non_zero_min_loop(&mut self) {
        for i in 0..self.stages.len() {
            let roots = self.stages[i].op.root_iter_vars();
            for root in roots {
                if root.thread_tag.is_some() {
                    continue;
                }
                let Some(dom) = &root.dom else { continue };
                if is_zero(&dom.min) {
                    continue;
                }
                let Some(pos) = self.stages[i].leaf_iter_vars.iter().position(|x| x == &root) else {
                    continue;
                };
                let rebased = new_iter_var(
                    format!("{}.rb", root.var.name),
                    Some(Range::make_by_min_extent(Expr::int(0), (*dom.extent).clone())),
                    root.iter_type,
                );
                self.stages[i].leaf_iter_vars[pos] = rebased.clone();
                self.stages[i].all_iter_vars.push(rebased.clone());
                self.stages[i].relations.push(IterVarRelation::Rebase {
                    parent: root.clone(),
                    rebased: rebased.clone(),
                });
                self.extern_itervar_map.insert(root.clone(), rebased.clone());
                for j in 0..self.stages.len() {
                    if self.stages[j].attach_ivar.as_ref() == Some(&root) {
                        self.stages[j].attach_ivar = Some(rebased.clone());
                    }
                }
            }
        }
    }

    /// `normalize()`: copies the schedule, runs inject-inline, and
    /// (only if `config.normalize.rebase_enabled`) also runs
    /// `rebase_non_zero_min_loop`.
    pub fn normalize(&self) -> ScheduleResult<Schedule> {
        let mut copy = self.copy();
        copy.inject_inline()?;
        if copy.config.normalize.rebase_enabled {
            copy.rebase_non_zero_min_loop();
        }
        tracing::debug!(stages = copy.stages.len(), "normalize");
        Ok(copy)
    }

    /// `reuse_at(target, parent_op, axis, reuse_name)`. Generalizes
    /// over the parent `For`'s body shape rather than requiring an
    /// `AttrStmt` wrapper.
    pub fn reuse_at(&mut self, target: &Tensor, parent_op: &Operation, axis: &IterVar, reuse_name: &str) -> ScheduleResult<Tensor> {
        let parent_idx = *self
            .stage_map
            .get(parent_op)
            .expect("reuse_at parent must already be part of this schedule");
        let ext = match &parent_op.kind {
            OperationKind::Extern(e) => e.clone(),
            _ => {
                return Err(ScheduleError::ReuseNotInput {
                    parent: parent_op.name.clone(),
                    target: format!("{target}"),
                })
            }
        };
        if !ext.inputs.contains(target) {
            return Err(ScheduleError::ReuseNotInput {
                parent: parent_op.name.clone(),
                target: format!("{target}"),
            });
        }

        let reuse_buf = new_buffer(reuse_name, Vec::new());
        let reuse_op = extern_op(
            format!("{}.reuse", target.op.name),
            "",
            Vec::new(),
            vec![target.clone()],
            Vec::new(),
            vec![reuse_buf.clone()],
            Stmt::Evaluate(Expr::int(0)),
        );
        let reuse_tensor = output_tensor(&reuse_op, 0);

        let parent_name = parent_op.name.clone();
        let reuse_buf_for_closure = reuse_buf.clone();
        let wrapped = crate::ir::mutator::rewrite_for_body(&ext.body, &axis.var, &mut |body| {
            Stmt::attach_scope(
                parent_name.clone(),
                Stmt::Reuse {
                    target: reuse_buf_for_closure.clone(),
                    body: Box::new(body.clone()),
                },
            )
        });
        let Some(new_body) = wrapped else {
            return Err(ScheduleError::ReuseBadParentShape {
                parent: parent_op.name.clone(),
                axis: axis.var.name.clone(),
            });
        };

        let mut new_inputs = ext.inputs.clone();
        new_inputs.push(reuse_tensor.clone());
        let mut new_input_placeholders = ext.input_placeholders.clone();
        new_input_placeholders.push(reuse_buf.clone());
        let new_parent_op = extern_op(
            parent_op.name.clone(),
            parent_op.tag.clone(),
            ext.axis.clone(),
            new_inputs,
            new_input_placeholders,
            ext.output_placeholders.clone(),
            new_body,
        );

        let mut cascade = HashMap::new();
        cascade.insert(output_tensor(parent_op, 0), output_tensor(&new_parent_op, 0));
        self.stages[parent_idx].op = new_parent_op;

        let mut reuse_stage = Stage::new(reuse_op);
        reuse_stage.group = self.stages[parent_idx].group;
        self.stages.insert(parent_idx, reuse_stage);
        self.rebuild_stage_map();
        self.replace_dataflow(&mut cascade);
        tracing::debug!(parent = %parent_op.name, axis = %axis.var.name, reuse_name, "reuse_at");
        Ok(reuse_tensor)
    }

    /// `partition(target, dim, factor, partition_type)`.
    pub fn partition(&mut self, target: &Tensor, dim: usize, factor: usize, partition_type: PartitionType) -> ScheduleResult<()> {
        let is_placeholder = matches!(target.op.kind, OperationKind::Placeholder(_));
        let shape = tensor_shape(target);
        let buf = new_buffer(format!("{}.partitioned", target.op.name), shape);
        let body = Stmt::Partition {
            buffer: buf.clone(),
            dim,
            factor,
            partition_type,
        };
        let (inputs, input_placeholders) = if is_placeholder {
            (vec![target.clone()], Vec::new())
        } else {
            (Vec::new(), Vec::new())
        };
        let partition_op = extern_op(format!("{}.partition", target.op.name), "", Vec::new(), inputs, input_placeholders, vec![buf.clone()], body);
        let partition_tensor = output_tensor(&partition_op, 0);

        let min_pos = if is_placeholder {
            0
        } else {
            *self
                .stage_map
                .get(&target.op)
                .expect("partition target must already be part of this schedule")
        };

        let consumer_ops: Vec<Operation> = if is_placeholder {
            self.stages
                .iter()
                .filter(|s| matches!(&s.op.kind, OperationKind::Extern(e) if e.inputs.contains(target)))
                .map(|s| s.op.clone())
                .collect()
        } else {
            self.stages
                .iter()
                .filter(|s| s.op.input_tensors().contains(target))
                .map(|s| s.op.clone())
                .collect()
        };

        self.stages.insert(min_pos, Stage::new(partition_op));
        self.rebuild_stage_map();

        let mut cascade: HashMap<Tensor, Tensor> = HashMap::new();
        for cur in consumer_ops {
            let idx = *self.stage_map.get(&cur).expect("consumer must still be in schedule");
            if let OperationKind::Extern(e) = &cur.kind {
                let mut new_inputs = vec![partition_tensor.clone()];
                new_inputs.extend(e.inputs.clone());
                let mut new_input_placeholders = vec![buf.clone()];
                new_input_placeholders.extend(e.input_placeholders.clone());
                let new_body = if is_placeholder {
                    e.body.clone()
                } else {
                    Stmt::attach_scope(target.op.name.clone(), e.body.clone())
                };
                let new_op = extern_op(cur.name.clone(), cur.tag.clone(), e.axis.clone(), new_inputs, new_input_placeholders, e.output_placeholders.clone(), new_body);
                cascade.insert(output_tensor(&cur, 0), output_tensor(&new_op, 0));
                self.stages[idx].op = new_op;
            }
        }
        self.rebuild_stage_map();
        if !cascade.is_empty() {
            self.replace_dataflow(&mut cascade);
        }
        tracing::debug!(target = %target.op.name, dim, factor, "partition");
        Ok(())
    }

    /// `reshape(target, new_shape)`. Placeholders are not
    /// supported (left as a documented no-op — the product-of-dims
    /// precondition is the caller's responsibility).
    pub fn reshape(&mut self, target: &Tensor, new_shape: Vec<Expr>) {
        let Some(&idx) = self.stage_map.get(&target.op) else { return };
        if let OperationKind::Extern(e) = &self.stages[idx].op.kind {
            let mut output_placeholders = e.output_placeholders.clone();
            if let Some(buf) = output_placeholders.get_mut(target.value_index) {
                *buf = new_buffer(buf.name.clone(), new_shape);
            }
            let new_op = extern_op(
                self.stages[idx].op.name.clone(),
                self.stages[idx].op.tag.clone(),
                e.axis.clone(),
                e.inputs.clone(),
                e.input_placeholders.clone(),
                output_placeholders,
                e.body.clone(),
            );
            self.stages[idx].op = new_op;
            self.rebuild_stage_map();
            tracing::debug!(target = %target.op.name, "reshape");
        }
    }
}

fn injected_dom_for_repl(factored_op: &Operation, pos: usize) -> Range {
    if let OperationKind::Compute(c) = &factored_op.kind {
        if let Some(iv) = c.axis.get(pos) {
            if let Some(d) = &iv.dom {
                return d.clone();
            }
        }
    }
    Range::make_by_min_extent(Expr::int(0), Expr::int(1))
}

/// Substitutes `inline_body` (parameterized over `params`) for every call
/// to `target` found in `e`, reporting whether any substitution happened.
fn inline_into(e: &Expr, target: &Tensor, params: &[crate::ir::Var], inline_body: &Expr) -> (Expr, bool) {
    match e {
        Expr::TensorCall { tensor, args } if tensor == target => {
            let mut subst = HashMap::new();
            for (p, a) in params.iter().zip(args.iter()) {
                subst.insert(p.id, a.clone());
            }
            (substitute_vars(inline_body, &subst), true)
        }
        Expr::TensorCall { tensor, args } => {
            let mut changed = false;
            let new_args = args
                .iter()
                .map(|a| {
                    let (a2, ch) = inline_into(a, target, params, inline_body);
                    changed |= ch;
                    a2
                })
                .collect();
            (
                Expr::TensorCall {
                    tensor: tensor.clone(),
                    args: new_args,
                },
                changed,
            )
        }
        Expr::Add(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Add),
        Expr::Sub(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Sub),
        Expr::Mul(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Mul),
        Expr::Div(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Div),
        Expr::Mod(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Mod),
        Expr::Min(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Min),
        Expr::Max(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Max),
        Expr::Eq(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Eq),
        Expr::Ne(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Ne),
        Expr::Lt(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Lt),
        Expr::Le(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Le),
        Expr::Gt(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Gt),
        Expr::Ge(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Ge),
        Expr::And(a, b) => bin_inline(a, b, target, params, inline_body, Expr::And),
        Expr::Or(a, b) => bin_inline(a, b, target, params, inline_body, Expr::Or),
        Expr::Not(a) => {
            let (a2, ch) = inline_into(a, target, params, inline_body);
            (Expr::Not(Box::new(a2)), ch)
        }
        Expr::Select { cond, t, f } => {
            let (c2, ch1) = inline_into(cond, target, params, inline_body);
            let (t2, ch2) = inline_into(t, target, params, inline_body);
            let (f2, ch3) = inline_into(f, target, params, inline_body);
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
                    let (s2, ch) = inline_into(s, target, params, inline_body);
                    changed |= ch;
                    s2
                })
                .collect();
            let (cond2, ch) = inline_into(&r.condition, target, params, inline_body);
            changed |= ch;
            (
                Expr::Reduce(Box::new(ReduceNode {
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

fn bin_inline(
    a: &Expr,
    b: &Expr,
    target: &Tensor,
    params: &[crate::ir::Var],
    inline_body: &Expr,
    ctor: fn(Box<Expr>, Box<Expr>) -> Expr,
) -> (Expr, bool) {
    let (a2, ch1) = inline_into(a, target, params, inline_body);
    let (b2, ch2) = inline_into(b, target, params, inline_body);
    (ctor(Box::new(a2), Box::new(b2)), ch1 || ch2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::new_var as ir_new_var;

    fn simple_producer_consumer() -> (Schedule, Tensor, Operation) {
        let p = placeholder_op("P", vec![Expr::int(32)]);
        let p_t = output_tensor(&p, 0);
        let i = range_iter_var("i", Expr::int(32), IterVarType::DataPar);
        let c = compute_op("C", "", vec![i.clone()], vec![], vec![call(p_t.clone(), vec![Expr::Var(i.var.clone())])]);
        let sched = Schedule::make(vec![c.clone()]);
        (sched, p_t, c)
    }

    #[test]
    fn test_schedule_make_orders_producer_before_consumer() {
        let (sched, p_t, c) = simple_producer_consumer();
        let p_idx = *sched.stage_map.get(&p_t.op).unwrap();
        let c_idx = *sched.stage_map.get(&c).unwrap();
        assert!(p_idx < c_idx);
    }

    #[test]
    fn test_cache_read_inserts_stage_and_rewires_reader() {
        let (mut sched, p_t, c) = simple_producer_consumer();
        let cache_t = sched.cache_read(&p_t, "shared", &[c.clone()]).unwrap();
        let p_idx = *sched.stage_map.get(&p_t.op).unwrap();
        let cache_idx = *sched.stage_map.get(&cache_t.op).unwrap();
        assert_eq!(cache_idx, p_idx + 1);
        let new_c_idx = cache_idx + 1;
        assert!(sched.stages[new_c_idx].op.input_tensors().contains(&cache_t));
        assert!(!sched.stages[new_c_idx].op.input_tensors().contains(&p_t));
    }

    #[test]
    fn test_cache_read_empty_readers_still_inserts_stage() {
        let (mut sched, p_t, _c) = simple_producer_consumer();
        let before = sched.stages.len();
        sched.cache_read(&p_t, "shared", &[]).unwrap();
        assert_eq!(sched.stages.len(), before + 1);
    }

    #[test]
    fn test_skip_bound_check_default_suppresses_uneven_split_predicate() {
        let body_pred = |sched: &mut Schedule, i: &IterVar, y: &Operation| -> Expr {
            let idx = *sched.stage_map.get(y).unwrap();
            sched.stages[idx].split(i, Expr::int(3)).unwrap();
            let y_t = output_tensor(y, 0);
            let cached = sched.cache_write(&y_t, "local").unwrap();
            match &cached.op.kind {
                OperationKind::Compute(c) => match &c.body[0] {
                    Expr::Select { cond, .. } => (**cond).clone(),
                    _ => Expr::int(1),
                },
                _ => unreachable!(),
            }
        };

        let make_y = || {
            let i = range_iter_var("i", Expr::int(10), IterVarType::DataPar);
            (compute_op("Y", "", vec![i.clone()], vec![], vec![Expr::Var(i.var.clone())]), i)
        };

        let (y, i) = make_y();
        let mut default_sched = Schedule::make(vec![y.clone()]);
        let default_pred = body_pred(&mut default_sched, &i, &y);
        assert!(!matches!(default_pred, Expr::IntImm(1)));

        let (y2, i2) = make_y();
        let mut skipping_sched = Schedule::make_with_config(vec![y2.clone()], {
            let mut cfg = Config::default();
            cfg.bounds.skip_bound_check_default = true;
            cfg
        });
        let skipping_pred = body_pred(&mut skipping_sched, &i2, &y2);
        assert!(matches!(skipping_pred, Expr::IntImm(1)));
    }

    #[test]
    fn test_cache_write_relayout_produces_local_copy() {
        let x = placeholder_op("X", vec![Expr::int(8), Expr::int(8)]);
        let x_t = output_tensor(&x, 0);
        let i = range_iter_var("i", Expr::int(8), IterVarType::DataPar);
        let j = range_iter_var("j", Expr::int(8), IterVarType::DataPar);
        let body = Expr::add(
            call(x_t, vec![Expr::Var(i.var.clone()), Expr::Var(j.var.clone())]),
            Expr::int(1),
        );
        let y = compute_op("Y", "", vec![i, j], vec![], vec![body]);
        let y_t = output_tensor(&y, 0);
        let mut sched = Schedule::make(vec![y.clone()]);
        let local = sched.cache_write(&y_t, "local").unwrap();
        assert_ne!(local.op.id, y.id);
        assert!(sched.stages.iter().any(|s| s.op.name == "Y.local"));
    }

    #[test]
    fn test_rfactor_rejects_non_comm_reduce_axis() {
        let i = range_iter_var("i", Expr::int(8), IterVarType::DataPar);
        let b = compute_op("B", "", vec![i.clone()], vec![], vec![Expr::int(0)]);
        let b_t = output_tensor(&b, 0);
        let mut sched = Schedule::make(vec![b.clone()]);
        let err = sched.rfactor(&b_t, &i, 0).unwrap_err();
        assert!(matches!(err, ScheduleError::FactorAxisNotReduction { .. }));
    }

    #[test]
    fn test_inject_inline_removes_reference_to_inlined_stage() {
        let x = placeholder_op("X", vec![Expr::int(8)]);
        let x_t = output_tensor(&x, 0);
        let i = range_iter_var("i", Expr::int(8), IterVarType::DataPar);
        let t_body = Expr::mul(Expr::int(2), call(x_t, vec![Expr::Var(i.var.clone())]));
        let t = compute_op("T", "", vec![i.clone()], vec![], vec![t_body]);
        let t_t = output_tensor(&t, 0);
        let k = crate::itervar::range_iter_var("k", Expr::int(8), IterVarType::CommReduce);
        let combiner = crate::ir::CommReducer::sum(Expr::int(0));
        let s_body = Expr::Reduce(Box::new(ReduceNode {
            combiner,
            source: vec![call(t_t, vec![Expr::Var(k.var.clone())])],
            axis: vec![k.clone()],
            condition: Box::new(crate::ir::const_true()),
            value_index: 0,
        }));
        let s = compute_op("S", "", vec![], vec![k], vec![s_body]);
        let mut sched = Schedule::make(vec![s.clone()]);
        let t_idx = *sched.stage_map.get(&t).unwrap();
        sched.stages[t_idx].compute_inline();
        sched.inject_inline().unwrap();

        let s_idx = sched.stages.len() - 1;
        assert_eq!(sched.stages[t_idx].attach_type, AttachType::InlinedAlready);
        let mut found_t_ref = false;
        crate::ir::post_order_visit_expr(&match &sched.stages[s_idx].op.kind {
            OperationKind::Compute(c) => c.body[0].clone(),
            _ => unreachable!(),
        }, &mut |e| {
            if let Expr::TensorCall { tensor, .. } = e {
                if tensor.op.name == "T" {
                    found_t_ref = true;
                }
            }
        });
        assert!(!found_t_ref);
    }

    #[test]
    fn test_partition_placeholder_two_consumers_gains_new_first_input() {
        let a = placeholder_op("A", vec![Expr::int(16)]);
        let a_t = output_tensor(&a, 0);
        let i = range_iter_var("i", Expr::int(16), IterVarType::DataPar);
        let a_buf = crate::ir::new_buffer("A.buf", vec![Expr::int(16)]);
        let c1 = extern_op("C1", "", vec![i.clone()], vec![a_t.clone()], vec![a_buf.clone()], vec![a_buf.clone()], Stmt::Evaluate(Expr::int(0)));
        let c2 = extern_op("C2", "", vec![i], vec![a_t.clone()], vec![a_buf.clone()], vec![a_buf], Stmt::Evaluate(Expr::int(0)));
        let mut sched = Schedule::make(vec![c1.clone(), c2.clone()]);
        sched.partition(&a_t, 0, 4, PartitionType::Complete).unwrap();
        assert!(sched.stages[0].op.name.ends_with(".partition"));
        for op_name in ["C1", "C2"] {
            let stage = sched.stages.iter().find(|s| s.op.name == op_name).unwrap();
            if let OperationKind::Extern(e) = &stage.op.kind {
                assert!(e.inputs[0].op.name.ends_with(".partition"));
            } else {
                panic!("expected extern op");
            }
        }
    }

    #[test]
    fn test_copy_does_not_mutate_source_schedule() {
        let (sched, p_t, _c) = simple_producer_consumer();
        let stages_before = sched.stages.len();
        let mut copy = sched.copy();
        copy.cache_read(&p_t, "shared", &[]).unwrap();
        assert_eq!(sched.stages.len(), stages_before);
        assert_eq!(copy.stages.len(), stages_before + 1);
    }

    #[test]
    fn test_normalize_default_config_skips_rebase() {
        let (sched, _p_t, _c) = simple_producer_consumer();
        let normalized = sched.normalize().unwrap();
        assert!(normalized.extern_itervar_map.is_empty());
    }

    #[test]
    fn test_unused_var_helper_compiles() {
        let _ = ir_new_var("unused");
    }
}
