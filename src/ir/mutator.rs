//! The generic recursive mutator and post-order traversal utility: a
//! structural fold over expressions/statements that returns a new node
//! without mutating the input, and a `VarReplacer` equivalent for
//! substituting a free variable by an expression.
//!
//! Every node is visited exactly once; this is what `cache_write`'s body
//! rewrite and `reuse_at`'s parent-body walk are built on.

use std::collections::HashMap;

use super::expr::{Expr, ReduceNode, Var};
use super::stmt::Stmt;

/// Visits every sub-expression of `e` in post order (children before
/// parents), calling `f` once per node.
pub fn post_order_visit_expr(e: &Expr, f: &mut impl FnMut(&Expr)) {
    match e {
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
            post_order_visit_expr(a, f);
            post_order_visit_expr(b, f);
        }
        Expr::Not(a) => post_order_visit_expr(a, f),
        Expr::Select { cond, t, f: fe } => {
            post_order_visit_expr(cond, f);
            post_order_visit_expr(t, f);
            post_order_visit_expr(fe, f);
        }
        Expr::TensorCall { args, .. } => {
            for a in args {
                post_order_visit_expr(a, f);
            }
        }
        Expr::Reduce(r) => {
            for s in &r.source {
                post_order_visit_expr(s, f);
            }
            post_order_visit_expr(&r.condition, f);
        }
        Expr::Var(_) | Expr::IntImm(_) => {}
    }
    f(e);
}

/// Visits every sub-statement (and the expressions it carries) of `s` in
/// post order.
pub fn post_order_visit_stmt(s: &Stmt, fs: &mut impl FnMut(&Stmt), fe: &mut impl FnMut(&Expr)) {
    match s {
        Stmt::Evaluate(e) => post_order_visit_expr(e, fe),
        Stmt::For { min, extent, body, .. } => {
            post_order_visit_expr(min, fe);
            post_order_visit_expr(extent, fe);
            post_order_visit_stmt(body, fs, fe);
        }
        Stmt::AttrStmt { value, body, .. } => {
            post_order_visit_expr(value, fe);
            post_order_visit_stmt(body, fs, fe);
        }
        Stmt::IfThenElse {
            cond,
            then_case,
            else_case,
        } => {
            post_order_visit_expr(cond, fe);
            post_order_visit_stmt(then_case, fs, fe);
            if let Some(e) = else_case {
                post_order_visit_stmt(e, fs, fe);
            }
        }
        Stmt::Block(stmts) => {
            for st in stmts {
                post_order_visit_stmt(st, fs, fe);
            }
        }
        Stmt::Reuse { body, .. } => post_order_visit_stmt(body, fs, fe),
        Stmt::Partition { .. } => {}
    }
    fs(s);
}

/// Substitutes every occurrence of a `Var` keyed in `subst` by its mapped
/// expression: a structural copy, children rewritten bottom-up, no
/// mutation of `e`.
pub fn substitute_vars(e: &Expr, subst: &HashMap<u64, Expr>) -> Expr {
    match e {
        Expr::Var(v) => subst.get(&v.id).cloned().unwrap_or_else(|| e.clone()),
        Expr::IntImm(_) => e.clone(),
        Expr::Add(a, b) => Expr::Add(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Sub(a, b) => Expr::Sub(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Mul(a, b) => Expr::Mul(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Div(a, b) => Expr::Div(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Mod(a, b) => Expr::Mod(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Min(a, b) => Expr::Min(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Max(a, b) => Expr::Max(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Eq(a, b) => Expr::Eq(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Ne(a, b) => Expr::Ne(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Lt(a, b) => Expr::Lt(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Le(a, b) => Expr::Le(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Gt(a, b) => Expr::Gt(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Ge(a, b) => Expr::Ge(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::And(a, b) => Expr::And(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Or(a, b) => Expr::Or(Box::new(substitute_vars(a, subst)), Box::new(substitute_vars(b, subst))),
        Expr::Not(a) => Expr::Not(Box::new(substitute_vars(a, subst))),
        Expr::Select { cond, t, f } => Expr::Select {
            cond: Box::new(substitute_vars(cond, subst)),
            t: Box::new(substitute_vars(t, subst)),
            f: Box::new(substitute_vars(f, subst)),
        },
        Expr::TensorCall { tensor, args } => Expr::TensorCall {
            tensor: tensor.clone(),
            args: args.iter().map(|a| substitute_vars(a, subst)).collect(),
        },
        Expr::Reduce(r) => Expr::Reduce(Box::new(ReduceNode {
            combiner: r.combiner.clone(),
            source: r.source.iter().map(|s| substitute_vars(s, subst)).collect(),
            axis: r.axis.clone(),
            condition: Box::new(substitute_vars(&r.condition, subst)),
            value_index: r.value_index,
        })),
    }
}

/// Convenience for a single-variable substitution.
pub fn substitute_var(e: &Expr, v: &Var, replacement: &Expr) -> Expr {
    let mut m = HashMap::new();
    m.insert(v.id, replacement.clone());
    substitute_vars(e, &m)
}

/// Rewrites `s`, replacing every `For` loop whose `loop_var` matches
/// `target` with the result of `f` applied to that loop's body. Used by
/// `reuse_at` to splice a `Reuse` marker into the matching loop without
/// disturbing the rest of the statement tree. Returns `None` if no
/// matching `For` was found.
pub fn rewrite_for_body(s: &Stmt, target: &Var, f: &mut impl FnMut(&Stmt) -> Stmt) -> Option<Stmt> {
    match s {
        Stmt::For {
            loop_var,
            min,
            extent,
            body,
        } if loop_var.id == target.id => Some(Stmt::For {
            loop_var: loop_var.clone(),
            min: min.clone(),
            extent: extent.clone(),
            body: Box::new(f(body)),
        }),
        Stmt::For {
            loop_var,
            min,
            extent,
            body,
        } => rewrite_for_body(body, target, f).map(|b| Stmt::For {
            loop_var: loop_var.clone(),
            min: min.clone(),
            extent: extent.clone(),
            body: Box::new(b),
        }),
        Stmt::AttrStmt {
            node,
            attr_key,
            value,
            body,
        } => rewrite_for_body(body, target, f).map(|b| Stmt::AttrStmt {
            node: node.clone(),
            attr_key: attr_key.clone(),
            value: value.clone(),
            body: Box::new(b),
        }),
        Stmt::IfThenElse {
            cond,
            then_case,
            else_case,
        } => rewrite_for_body(then_case, target, f).map(|b| Stmt::IfThenElse {
            cond: cond.clone(),
            then_case: Box::new(b),
            else_case: else_case.clone(),
        }),
        Stmt::Block(stmts) => {
            for (i, st) in stmts.iter().enumerate() {
                if let Some(b) = rewrite_for_body(st, target, f) {
                    let mut new_stmts = stmts.clone();
                    new_stmts[i] = b;
                    return Some(Stmt::Block(new_stmts));
                }
            }
            None
        }
        Stmt::Reuse { target: t, body } => {
            rewrite_for_body(body, target, f).map(|b| Stmt::Reuse {
                target: t.clone(),
                body: Box::new(b),
            })
        }
        Stmt::Evaluate(_) | Stmt::Partition { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::expr::new_var;

    #[test]
    fn test_substitute_var_replaces_only_matching_id() {
        let x = new_var("x");
        let y = new_var("y");
        let e = Expr::add(Expr::Var(x.clone()), Expr::Var(y.clone()));
        let replaced = substitute_var(&e, &x, &Expr::int(7));
        assert_eq!(replaced, Expr::add(Expr::int(7), Expr::Var(y)));
    }

    #[test]
    fn test_post_order_visit_expr_visits_children_first() {
        let e = Expr::add(Expr::int(1), Expr::int(2));
        let mut order = Vec::new();
        post_order_visit_expr(&e, &mut |n| order.push(format!("{n:?}")));
        assert_eq!(order.len(), 3);
        assert_eq!(order[2], format!("{e:?}"));
    }

    #[test]
    fn test_rewrite_for_body_targets_matching_loop_var() {
        let i = new_var("i");
        let inner = Stmt::Evaluate(Expr::int(0));
        let s = Stmt::For {
            loop_var: i.clone(),
            min: Expr::int(0),
            extent: Expr::int(10),
            body: Box::new(inner),
        };
        let rewritten = rewrite_for_body(&s, &i, &mut |_| Stmt::Evaluate(Expr::int(9))).unwrap();
        match rewritten {
            Stmt::For { body, .. } => assert_eq!(*body, Stmt::Evaluate(Expr::int(9))),
            _ => panic!("expected For"),
        }
    }
}
