//! relmap core — schema compiler, query builder, and relation writer.
//!
//! The engine turns declarative content-model definitions into physical
//! relational schemas and answers filter/sort/paginate/populate queries
//! against a pluggable SQL driver, keeping multi-table relation state
//! consistent on writes.
//!
//! The flow: [`schema::Registry::build`] compiles model declarations once
//! at boot; per request a [`query::QueryBuilder`] compiles exactly one
//! statement, with populate fan-out issued afterwards; the
//! [`entity::EntityManager`] orchestrates writes, reading its connection
//! scope from an explicit [`tx::Conn`].

pub mod codec;
pub mod driver;
pub mod entity;
pub mod error;
pub mod lifecycle;
pub mod query;
pub mod schema;
pub mod tx;
pub mod value;

#[doc(hidden)]
pub mod test_support;

pub use codec::{codec_for, ScalarCodec};
pub use driver::{ExecResult, SqlDriver, SqlExecutor, Statement, TransactionHandle};
pub use entity::EntityManager;
pub use error::{ConfigError, Error, QueryError};
pub use lifecycle::{Action, Lifecycle, LifecycleEvent};
pub use query::{PopulateParams, PopulateSpec, QueryBuilder};
pub use schema::{
    Attribute, AttributeDef, JoinColumn, JoinTable, ModelDef, ModelMeta, MorphColumn,
    MorphJoinTable, OrderDirection, Registry, RelationDef, RelationKind, RelationMeta,
    RelationStorage, ScalarAttribute, ScalarType,
};
pub use tx::{with_transaction, Conn};
pub use value::{Record, Row, SqlValue};
