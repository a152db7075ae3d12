//! Minimal statement substrate used by `ExternOp` bodies (`reuse_at`,
//! `partition`, and the bodies lowering eventually fills in for them).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use super::expr::{fresh_id, Expr, Var};
use crate::itervar::PartitionType;

/// An output buffer: a named, shaped allocation. Identity by `id`, like
/// `Var` and `Operation` — two buffers with the same name are not the same
/// buffer unless they are the same allocation.
#[derive(Debug)]
pub struct BufferNode {
    pub id: u64,
    pub name: String,
    pub shape: Vec<Expr>,
}

impl PartialEq for BufferNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for BufferNode {}
impl Hash for BufferNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
impl fmt::Display for BufferNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

pub type Buffer = Rc<BufferNode>;

pub fn new_buffer(name: impl Into<String>, shape: Vec<Expr>) -> Buffer {
    Rc::new(BufferNode {
        id: fresh_id(),
        name: name.into(),
        shape,
    })
}

/// What an `AttrStmt` is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrNode {
    /// `attach_scope` annotations name the parent/target buffer by a plain
    /// string key.
    Name(String),
    Buffer(Buffer),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Evaluate(Expr),
    For {
        loop_var: Var,
        min: Expr,
        extent: Expr,
        body: Box<Stmt>,
    },
    AttrStmt {
        node: AttrNode,
        attr_key: String,
        value: Expr,
        body: Box<Stmt>,
    },
    IfThenElse {
        cond: Expr,
        then_case: Box<Stmt>,
        else_case: Option<Box<Stmt>>,
    },
    Block(Vec<Stmt>),
    /// A line-buffer/reuse marker inserted by `reuse_at` around the loop
    /// body whose loop variable matches the target axis.
    Reuse {
        target: Buffer,
        body: Box<Stmt>,
    },
    /// An array-partition directive, the sole body of a partition stage.
    Partition {
        buffer: Buffer,
        dim: usize,
        factor: usize,
        partition_type: PartitionType,
    },
}

impl Stmt {
    pub fn attach_scope(name: impl Into<String>, body: Stmt) -> Stmt {
        Stmt::AttrStmt {
            node: AttrNode::Name(name.into()),
            attr_key: "attach_scope".to_string(),
            value: Expr::IntImm(0),
            body: Box::new(body),
        }
    }
}
