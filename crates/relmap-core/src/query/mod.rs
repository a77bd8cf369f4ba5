//! Query construction and execution: the per-query builder, the
//! predicate/join compiler, and the populate engine.

mod builder;
mod join;
mod populate;
mod predicate;
pub(crate) mod sql;

pub use builder::{QueryBuilder, StatementKind};
pub use populate::{PopulateParams, PopulateSpec};
