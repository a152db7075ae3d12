//! IR substrate: expressions, statements, operations, and tensors.
//!
//! This module is the minimal concrete substrate the rest of the crate
//! needs in order to have something to schedule: tensor identity, the
//! three operator variants (`Placeholder`/`Compute`/`Extern`), a generic
//! mutator, and substitution.

pub mod expr;
pub mod mutator;
pub mod operation;
pub mod stmt;

pub use expr::{
    compute_reduce_and, const_true, fresh_id, is_one, is_zero, make_zero, new_var, reduce_consistent,
    CommReducer, Expr, Range, ReduceNode, Var, VarNode,
};
pub use mutator::{post_order_visit_expr, post_order_visit_stmt, rewrite_for_body, substitute_var, substitute_vars};
pub use operation::{
    call, compute_op, extern_op, output_tensor, placeholder_op, replace_inputs, substitute_tensors, ComputeOp,
    ExternOp, Operation, OperationKind, OperationNode, PlaceholderOp, Tensor,
};
pub use stmt::{new_buffer, AttrNode, Buffer, BufferNode, Stmt};
