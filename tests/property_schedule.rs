//! Property-based tests (proptest) for the schedule engine's algebraic laws.

use proptest::prelude::*;

use tensor_schedule::ir::{call, compute_op, output_tensor, placeholder_op, CommReducer, Expr, ReduceNode};
use tensor_schedule::itervar::{range_iter_var, IterVarType};
use tensor_schedule::schedule::Schedule;

proptest! {
    /// reorder composed with its inverse permutation is identity on leaves:
    /// scrambling four leaves into any order and then reordering straight
    /// back to the original list recovers the original leaf sequence.
    #[test]
    fn test_reorder_inverse_is_identity(j3 in 0..4usize, j2 in 0..3usize, j1 in 0..2usize) {
        let ivs: Vec<_> = (0..4).map(|n| range_iter_var(format!("i{n}"), Expr::int(8), IterVarType::DataPar)).collect();
        let op = compute_op("S", "", ivs.clone(), vec![], vec![Expr::int(0)]);
        let mut sched = Schedule::make(vec![op]);
        let stage = &mut sched.stages[0];

        let mut perm: Vec<usize> = (0..4).collect();
        perm.swap(3, j3);
        perm.swap(2, j2);
        perm.swap(1, j1);
        let scrambled: Vec<_> = perm.iter().map(|&p| ivs[p].clone()).collect();

        stage.reorder(&scrambled).unwrap();
        prop_assert_eq!(&stage.leaf_iter_vars, &scrambled);

        stage.reorder(&ivs).unwrap();
        prop_assert_eq!(&stage.leaf_iter_vars, &ivs);
    }

    /// `copy()` followed by any primitive does not mutate the source Schedule.
    #[test]
    fn test_copy_isolates_source_from_split(factor in 2i64..17) {
        let i = range_iter_var("i", Expr::int(64), IterVarType::DataPar);
        let op = compute_op("S", "", vec![i.clone()], vec![], vec![Expr::int(0)]);
        let sched = Schedule::make(vec![op]);

        let mut copy = sched.copy();
        copy.stages[0].split(&i, Expr::int(factor)).unwrap();

        prop_assert_eq!(sched.stages[0].leaf_iter_vars.len(), 1);
        prop_assert_eq!(copy.stages[0].leaf_iter_vars.len(), 2);
    }

    /// inject-inline is idempotent: a second call after the first makes no
    /// further changes to any stage's op identity.
    #[test]
    fn test_inject_inline_is_idempotent(multiplier in 1i64..10) {
        let x = placeholder_op("X", vec![Expr::int(8)]);
        let x_t = output_tensor(&x, 0);
        let i = range_iter_var("i", Expr::int(8), IterVarType::DataPar);
        let t_body = Expr::mul(Expr::int(multiplier), call(x_t, vec![Expr::Var(i.var.clone())]));
        let t = compute_op("T", "", vec![i.clone()], vec![], vec![t_body]);
        let t_t = output_tensor(&t, 0);

        let k = range_iter_var("k", Expr::int(8), IterVarType::CommReduce);
        let s_body = Expr::Reduce(Box::new(ReduceNode {
            combiner: CommReducer::sum(Expr::int(0)),
            source: vec![call(t_t, vec![Expr::Var(k.var.clone())])],
            axis: vec![k.clone()],
            condition: Box::new(tensor_schedule::ir::const_true()),
            value_index: 0,
        }));
        let s = compute_op("S", "", vec![], vec![k], vec![s_body]);

        let mut sched = Schedule::make(vec![t.clone(), s]);
        let t_idx = sched.stage_map[&t];
        sched.stages[t_idx].compute_inline();

        sched.inject_inline().unwrap();
        let s_op_after_first = sched.stages.iter().find(|st| st.op.name == "S").unwrap().op.clone();

        sched.inject_inline().unwrap();
        let s_op_after_second = sched.stages.iter().find(|st| st.op.name == "S").unwrap().op.clone();

        prop_assert_eq!(s_op_after_first, s_op_after_second);
    }

    /// Every `Stage`'s `leaf_iter_vars` after any sequence of split/fuse
    /// matches the leaf frontier computed independently from `relations`,
    /// for a range of split factors.
    #[test]
    fn test_leaf_iter_vars_matches_computed_frontier(factor in 2i64..9) {
        let i = range_iter_var("i", Expr::int(64), IterVarType::DataPar);
        let op = compute_op("S", "", vec![i.clone()], vec![], vec![Expr::int(0)]);
        let mut sched = Schedule::make(vec![op]);
        let stage = &mut sched.stages[0];

        let (outer, inner) = stage.split(&i, Expr::int(factor)).unwrap();
        let _ = stage.fuse(&outer, &inner).unwrap();

        let mut frontier = stage.computed_leaf_frontier();
        let mut leaves = stage.leaf_iter_vars.clone();
        frontier.sort_by_key(|iv| iv.id);
        leaves.sort_by_key(|iv| iv.id);
        prop_assert_eq!(frontier, leaves);
    }
}
