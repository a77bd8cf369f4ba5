//! relmap - a metadata-driven relational mapping engine.
//!
//! This crate re-exports the public API of `relmap-core`: declare content
//! models, compile them into a frozen [`Registry`], and run structured
//! queries and relation-consistent writes through the [`EntityManager`]
//! against any [`SqlDriver`] implementation.
//!
//! ```
//! use relmap::{ModelDef, Registry, RelationDef, ScalarType};
//!
//! let registry = Registry::build(vec![
//!     ModelDef::new("api::article.article", "article")
//!         .with_scalar("title", ScalarType::String)
//!         .with_relation("tags", RelationDef::many_to_many("api::tag.tag")),
//!     ModelDef::new("api::tag.tag", "tag").with_scalar("label", ScalarType::String),
//! ])?;
//! assert!(registry.get("api::article.article").is_some());
//! # Ok::<(), relmap::ConfigError>(())
//! ```

pub use relmap_core::{
    codec_for, with_transaction, Action, Attribute, AttributeDef, ConfigError, Conn, EntityManager,
    Error, ExecResult, JoinColumn, JoinTable, Lifecycle, LifecycleEvent, ModelDef, ModelMeta,
    MorphColumn, MorphJoinTable, OrderDirection, PopulateParams, PopulateSpec, QueryBuilder,
    QueryError, Record, Registry, RelationDef, RelationKind, RelationMeta, RelationStorage, Row,
    ScalarAttribute, ScalarCodec, ScalarType, SqlDriver, SqlExecutor, SqlValue, Statement,
    TransactionHandle,
};

/// JSON value alias used across criteria trees, populate specs, and
/// records.
pub use serde_json::Value as JsonValue;
