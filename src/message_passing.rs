//! Message-passing layer: pure propagations of domains, symbolic index
//! expressions, and boolean marks along a stage's `relations`. None
//! of these functions mutate a `Stage`; they all take a `relations` slice
//! and a seed map and return an extended map.

use std::collections::HashMap;

use crate::ir::{compute_reduce_and, Expr};
use crate::itervar::{IterVar, IterVarRelation};

type DomMap = HashMap<IterVar, crate::ir::Range>;
type ValueMap = HashMap<IterVar, Expr>;
type MarkMap = HashMap<IterVar, bool>;

/// Computes domains for every `IterVar` introduced by `relations`, given
/// `root_dom` for the roots. Relations are processed in the order they
/// were recorded, which is always parent-before-child, so each
/// relation's parent domain is already resolved when it is processed.
pub fn pass_down_domain(relations: &[IterVarRelation], root_dom: &DomMap) -> DomMap {
    let mut state = root_dom.clone();
    for rel in relations {
        match rel {
            IterVarRelation::Split {
                parent,
                outer,
                inner,
                factor,
                nparts,
            } => {
                let parent_extent = state
                    .get(parent)
                    .map(|r| (*r.extent).clone())
                    .unwrap_or_else(|| Expr::int(0));
                let (outer_extent, inner_extent) = match (factor, nparts) {
                    (Some(f), None) => (ceil_div(parent_extent.clone(), f.clone()), f.clone()),
                    (None, Some(n)) => (n.clone(), ceil_div(parent_extent.clone(), n.clone())),
                    _ => (parent_extent.clone(), Expr::int(1)),
                };
                state.insert(
                    outer.clone(),
                    crate::ir::Range::make_by_min_extent(Expr::int(0), outer_extent),
                );
                state.insert(
                    inner.clone(),
                    crate::ir::Range::make_by_min_extent(Expr::int(0), inner_extent),
                );
            }
            IterVarRelation::Fuse { outer, inner, fused } => {
                let outer_extent = state.get(outer).map(|r| (*r.extent).clone()).unwrap_or_else(|| Expr::int(1));
                let inner_extent = state.get(inner).map(|r| (*r.extent).clone()).unwrap_or_else(|| Expr::int(1));
                state.insert(
                    fused.clone(),
                    crate::ir::Range::make_by_min_extent(Expr::int(0), Expr::mul(outer_extent, inner_extent)),
                );
            }
            IterVarRelation::Rebase { parent, rebased } => {
                let extent = state.get(parent).map(|r| (*r.extent).clone()).unwrap_or_else(|| Expr::int(0));
                state.insert(rebased.clone(), crate::ir::Range::make_by_min_extent(Expr::int(0), extent));
            }
            IterVarRelation::Reorder { .. } => {}
        }
    }
    state
}

fn ceil_div(a: Expr, b: Expr) -> Expr {
    // (a + b - 1) / b
    Expr::Div(
        Box::new(Expr::Add(Box::new(a), Box::new(Expr::Sub(Box::new(b.clone()), Box::new(Expr::int(1)))))),
        Box::new(b),
    )
}

/// Given symbolic values for leaves (or any already-known vars), computes
/// symbolic values for their ancestors — the inverse of [`pass_down_index`].
/// Processed in reverse relation order: a relation's children are always
/// recorded before any further relation splits them further, so reverse
/// order guarantees children are resolved before their parent is derived.
pub fn pass_up_index(relations: &[IterVarRelation], dom: &DomMap, value_map: &ValueMap) -> ValueMap {
    let mut state = value_map.clone();
    for rel in relations.iter().rev() {
        match rel {
            IterVarRelation::Split {
                parent,
                outer,
                inner,
                ..
            } => {
                if let (Some(ov), Some(iv)) = (state.get(outer).cloned(), state.get(inner).cloned()) {
                    let inner_extent = dom
                        .get(inner)
                        .map(|r| (*r.extent).clone())
                        .unwrap_or_else(|| Expr::int(1));
                    state
                        .entry(parent.clone())
                        .or_insert_with(|| Expr::add(Expr::mul(ov, inner_extent), iv));
                }
            }
            IterVarRelation::Fuse { outer, inner, fused } => {
                if let Some(fv) = state.get(fused).cloned() {
                    let inner_extent = dom
                        .get(inner)
                        .map(|r| (*r.extent).clone())
                        .unwrap_or_else(|| Expr::int(1));
                    state
                        .entry(outer.clone())
                        .or_insert_with(|| Expr::Div(Box::new(fv.clone()), Box::new(inner_extent.clone())));
                    state
                        .entry(inner.clone())
                        .or_insert_with(|| Expr::Mod(Box::new(fv), Box::new(inner_extent)));
                }
            }
            IterVarRelation::Rebase { parent, rebased } => {
                if let Some(rv) = state.get(rebased).cloned() {
                    let min = dom.get(parent).map(|r| (*r.min).clone()).unwrap_or_else(|| Expr::int(0));
                    state.entry(parent.clone()).or_insert_with(|| Expr::add(rv, min));
                }
            }
            IterVarRelation::Reorder { .. } => {}
        }
    }
    state
}

/// Given symbolic values for roots, computes symbolic values for every
/// descendant, processed forward (parent resolved before child). The
/// `trust_bound` flag only affects whether [`make_bound_check`] emits a
/// predicate for a given axis, not the index arithmetic itself.
pub fn pass_down_index(relations: &[IterVarRelation], dom: &DomMap, value_map: &ValueMap, _trust_bound: bool) -> ValueMap {
    let mut state = value_map.clone();
    for rel in relations {
        match rel {
            IterVarRelation::Split {
                parent,
                outer,
                inner,
                ..
            } => {
                if let Some(pv) = state.get(parent).cloned() {
                    let inner_extent = dom
                        .get(inner)
                        .map(|r| (*r.extent).clone())
                        .unwrap_or_else(|| Expr::int(1));
                    state
                        .entry(outer.clone())
                        .or_insert_with(|| Expr::Div(Box::new(pv.clone()), Box::new(inner_extent.clone())));
                    state
                        .entry(inner.clone())
                        .or_insert_with(|| Expr::Mod(Box::new(pv), Box::new(inner_extent)));
                }
            }
            IterVarRelation::Fuse { outer, inner, fused } => {
                if let (Some(ov), Some(iv)) = (state.get(outer).cloned(), state.get(inner).cloned()) {
                    let inner_extent = dom
                        .get(inner)
                        .map(|r| (*r.extent).clone())
                        .unwrap_or_else(|| Expr::int(1));
                    state
                        .entry(fused.clone())
                        .or_insert_with(|| Expr::add(Expr::mul(ov, inner_extent), iv));
                }
            }
            IterVarRelation::Rebase { parent, rebased } => {
                if let Some(pv) = state.get(parent).cloned() {
                    let min = dom.get(parent).map(|r| (*r.min).clone()).unwrap_or_else(|| Expr::int(0));
                    state.entry(rebased.clone()).or_insert_with(|| Expr::Sub(Box::new(pv), Box::new(min)));
                }
            }
            IterVarRelation::Reorder { .. } => {}
        }
    }
    state
}

/// Propagates a boolean mark from children up to ancestors (an ancestor is
/// marked if any of its children are).
pub fn pass_up_bitmask_or(relations: &[IterVarRelation], marks: &MarkMap) -> MarkMap {
    let mut state = marks.clone();
    for rel in relations.iter().rev() {
        match rel {
            IterVarRelation::Split {
                parent, outer, inner, ..
            } => {
                let m = *state.get(outer).unwrap_or(&false) || *state.get(inner).unwrap_or(&false);
                if m {
                    state.insert(parent.clone(), true);
                }
            }
            IterVarRelation::Fuse { outer, inner, fused } => {
                let m = *state.get(fused).unwrap_or(&false);
                if m {
                    state.insert(outer.clone(), true);
                    state.insert(inner.clone(), true);
                }
            }
            IterVarRelation::Rebase { parent, rebased } => {
                let m = *state.get(rebased).unwrap_or(&false);
                if m {
                    state.insert(parent.clone(), true);
                }
            }
            IterVarRelation::Reorder { .. } => {}
        }
    }
    state
}

/// Propagates a boolean mark from ancestors down to descendants (a
/// descendant is marked if its parent is).
pub fn pass_down_bitmask_or(relations: &[IterVarRelation], marks: &MarkMap) -> MarkMap {
    let mut state = marks.clone();
    for rel in relations {
        match rel {
            IterVarRelation::Split {
                parent, outer, inner, ..
            } => {
                let m = *state.get(parent).unwrap_or(&false);
                if m {
                    state.insert(outer.clone(), true);
                    state.insert(inner.clone(), true);
                }
            }
            IterVarRelation::Fuse { outer, inner, fused } => {
                let m = *state.get(outer).unwrap_or(&false) || *state.get(inner).unwrap_or(&false);
                if m {
                    state.insert(fused.clone(), true);
                }
            }
            IterVarRelation::Rebase { parent, rebased } => {
                let m = *state.get(parent).unwrap_or(&false);
                if m {
                    state.insert(rebased.clone(), true);
                }
            }
            IterVarRelation::Reorder { .. } => {}
        }
    }
    state
}

/// Computes the minimal set of predicates needed to guarantee every root
/// index is within its declared domain, given the current `relations` and
/// root domains. A `Split` only needs a bound check when its factor/nparts
/// does not evenly divide the parent's (statically known) extent — the
/// `factor = 1` boundary case never needs one, since division by the
/// parent's own extent is always exact.
pub fn make_bound_check(
    relations: &[IterVarRelation],
    dom: &DomMap,
    value_map: &ValueMap,
    skip_bound_check: &[IterVar],
) -> Expr {
    let mut preds = Vec::new();
    for rel in relations {
        if let IterVarRelation::Split {
            parent,
            outer,
            factor,
            nparts,
            ..
        } = rel
        {
            if skip_bound_check.contains(parent) || skip_bound_check.contains(outer) {
                continue;
            }
            let divides_evenly = match (factor, nparts) {
                (Some(Expr::IntImm(f)), _) => match dom.get(parent).map(|r| r.extent.as_ref()) {
                    Some(Expr::IntImm(e)) => e % f == 0,
                    _ => false,
                },
                (_, Some(Expr::IntImm(n))) => match dom.get(parent).map(|r| r.extent.as_ref()) {
                    Some(Expr::IntImm(e)) => e % n == 0,
                    _ => false,
                },
                _ => false,
            };
            if divides_evenly {
                continue;
            }
            if let (Some(parent_val), Some(parent_dom)) = (value_map.get(parent), dom.get(parent)) {
                let bound = Expr::Lt(
                    Box::new(parent_val.clone()),
                    Box::new(Expr::add((*parent_dom.min).clone(), (*parent_dom.extent).clone())),
                );
                preds.push(bound);
            }
        }
    }
    compute_reduce_and(preds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::itervar::{new_iter_var, IterVarType};

    #[test]
    fn test_pass_down_domain_split_by_factor() {
        let parent = new_iter_var("i", Some(crate::ir::Range::make_by_min_extent(Expr::int(0), Expr::int(32))), IterVarType::DataPar);
        let outer = new_iter_var("i.outer", None, IterVarType::DataPar);
        let inner = new_iter_var("i.inner", None, IterVarType::DataPar);
        let rel = IterVarRelation::Split {
            parent: parent.clone(),
            outer: outer.clone(),
            inner: inner.clone(),
            factor: Some(Expr::int(4)),
            nparts: None,
        };
        let mut root_dom = HashMap::new();
        root_dom.insert(parent.clone(), parent.dom.clone().unwrap());
        let dom = pass_down_domain(std::slice::from_ref(&rel), &root_dom);
        assert_eq!(*dom[&inner].extent, Expr::int(4));
    }

    #[test]
    fn test_make_bound_check_factor_one_emits_no_predicate() {
        let parent = new_iter_var("i", Some(crate::ir::Range::make_by_min_extent(Expr::int(0), Expr::int(32))), IterVarType::DataPar);
        let outer = new_iter_var("i.outer", None, IterVarType::DataPar);
        let inner = new_iter_var("i.inner", None, IterVarType::DataPar);
        let rel = IterVarRelation::Split {
            parent: parent.clone(),
            outer: outer.clone(),
            inner: inner.clone(),
            factor: Some(Expr::int(1)),
            nparts: None,
        };
        let mut root_dom = HashMap::new();
        root_dom.insert(parent.clone(), parent.dom.clone().unwrap());
        let pred = make_bound_check(std::slice::from_ref(&rel), &root_dom, &HashMap::new(), &[]);
        assert_eq!(pred, const_true_for_test());
    }

    fn const_true_for_test() -> Expr {
        crate::ir::const_true()
    }

    #[test]
    fn test_bitmask_propagation_marks_both_directions() {
        let parent = new_iter_var("i", Some(crate::ir::Range::make_by_min_extent(Expr::int(0), Expr::int(32))), IterVarType::CommReduce);
        let outer = new_iter_var("i.outer", None, IterVarType::CommReduce);
        let inner = new_iter_var("i.inner", None, IterVarType::CommReduce);
        let rel = IterVarRelation::Split {
            parent: parent.clone(),
            outer: outer.clone(),
            inner: inner.clone(),
            factor: Some(Expr::int(4)),
            nparts: None,
        };
        let mut marks = HashMap::new();
        marks.insert(inner.clone(), true);
        let up = pass_up_bitmask_or(std::slice::from_ref(&rel), &marks);
        assert_eq!(up[&parent], true);
        let down = pass_down_bitmask_or(std::slice::from_ref(&rel), &up);
        assert_eq!(down[&outer], true);
    }
}
