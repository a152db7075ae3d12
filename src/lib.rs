//! # Tensor Schedule Engine
//!
//! A standalone implementation of the stage/iter-var scheduling layer found
//! in tensor-compiler IRs: given a dataflow graph of `Placeholder`/`Compute`/
//! `Extern` operations, a [`Schedule`](schedule::Schedule) lets a caller
//! split, fuse, reorder, and re-attach the loop nest each operation lowers
//! to, and lists the dataflow rewrites (`cache_read`, `cache_write`,
//! `rfactor`, `reuse_at`, `partition`, `reshape`, `normalize`) that insert or
//! replace stages in the schedule while preserving topological order.
//!
//! ## Pipeline
//!
//! ```text
//! Operation graph (Placeholder/Compute/Extern, built via ir::*)
//!     ↓
//! Schedule::make            → one Stage per Operation, producers before consumers
//!     ↓
//! Stage primitives          → split / fuse / reorder / compute_at / bind / ...
//!     ↓
//! Dataflow rewrites         → cache_read / cache_write / rfactor / reuse_at / partition / reshape
//!     ↓
//! Schedule::normalize        → inject-inline (+ optional rebase), ready for lowering
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tensor_schedule::ir::{placeholder_op, compute_op, output_tensor, call};
//! use tensor_schedule::itervar::{range_iter_var, IterVarType};
//! use tensor_schedule::schedule::Schedule;
//!
//! let a = placeholder_op("A", vec![Expr::int(1024)]);
//! let a_t = output_tensor(&a, 0);
//! let i = range_iter_var("i", Expr::int(1024), IterVarType::DataPar);
//! let b = compute_op("B", "", vec![i.clone()], vec![], vec![call(a_t, vec![Expr::Var(i.var.clone())])]);
//!
//! let mut sched = Schedule::make(vec![b.clone()]);
//! let stage = &mut sched.stages[1];
//! let (outer, inner) = stage.split(&i, Expr::int(32))?;
//! ```
//!
//! ## Module Organization
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `error` | `ScheduleError`/`ScheduleResult` — one variant per named failure mode |
//! | `config` | Hierarchical configuration (`schedule.toml` + env) for the optional rebase pass and bound-check defaults |
//! | `ir` | Minimal IR substrate: `Var`, `Range`, `Expr`, `Buffer`, `Stmt`, `Operation`, `Tensor` |
//! | `itervar` | `IterVar`, `IterVarRelation`, `IterVarAttr`, `AttachType`, `PartitionType` |
//! | `message_passing` | Pure domain/index/bitmask propagation along a stage's `relations` |
//! | `stage` | The `Stage` primitive layer: split, fuse, reorder, compute_at, bind, ... |
//! | `schedule` | The `Schedule` collection and its dataflow rewrites |

pub mod config;
pub mod error;
pub mod ir;
pub mod itervar;
pub mod message_passing;
pub mod schedule;
pub mod stage;

pub use config::Config;
pub use error::{ScheduleError, ScheduleResult};
pub use schedule::Schedule;
pub use stage::Stage;
