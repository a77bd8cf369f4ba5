//! Core error types.

use thiserror::Error;

/// Schema-compilation errors.
///
/// All of these are raised synchronously while the registry is being built
/// and are fatal: a model set that fails to compile must abort startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A model uid was declared more than once.
    #[error("model `{uid}` is declared more than once")]
    DuplicateModel {
        /// Duplicated model uid.
        uid: String,
    },

    /// A relation references a model that is not in the registry.
    #[error("relation `{model}.{attribute}` targets unknown model `{target}`")]
    UnknownTarget {
        /// Declaring model uid.
        model: String,
        /// Relation attribute name.
        attribute: String,
        /// The missing target uid.
        target: String,
    },

    /// A bidirectional relation names an inverse attribute that does not exist.
    #[error("relation `{model}.{attribute}` expects inverse attribute `{target}.{inverse}`, which does not exist")]
    MissingInverse {
        /// Declaring model uid.
        model: String,
        /// Relation attribute name.
        attribute: String,
        /// Target model uid.
        target: String,
        /// The missing inverse attribute name.
        inverse: String,
    },

    /// The inverse attribute exists but its kind does not mirror the owner's.
    #[error("relation `{model}.{attribute}`: inverse `{target}.{inverse}` must be a `{expected}` relation")]
    IncompatibleInverse {
        /// Declaring model uid.
        model: String,
        /// Relation attribute name.
        attribute: String,
        /// Target model uid.
        target: String,
        /// Inverse attribute name.
        inverse: String,
        /// The relation kind the inverse side must declare.
        expected: String,
    },

    /// A bidirectional one-to-many was declared as the owning side.
    #[error("relation `{model}.{attribute}`: a bidirectional one-to-many cannot own storage; declare `mapped_by` here and `inversed_by` on the many-to-one side")]
    OneToManyOwner {
        /// Declaring model uid.
        model: String,
        /// Relation attribute name.
        attribute: String,
    },

    /// A morph-one/morph-many is missing its `morph_by` reference.
    #[error("relation `{model}.{attribute}` must name the polymorphic owner attribute via `morph_by`")]
    MissingMorphBy {
        /// Declaring model uid.
        model: String,
        /// Relation attribute name.
        attribute: String,
    },

    /// The `morph_by` reference is not a polymorphic owner attribute.
    #[error("relation `{model}.{attribute}`: `{target}.{morph_by}` is not a morph-to-one or morph-to-many attribute")]
    InvalidMorphOwner {
        /// Declaring model uid.
        model: String,
        /// Relation attribute name.
        attribute: String,
        /// Target model uid.
        target: String,
        /// The referenced owner attribute name.
        morph_by: String,
    },

    /// A component attribute references an unknown component model.
    #[error("component attribute `{model}.{attribute}` references unknown component `{component}`")]
    UnknownComponent {
        /// Declaring model uid.
        model: String,
        /// Component attribute name.
        attribute: String,
        /// The missing component uid.
        component: String,
    },
}

/// Query-construction errors.
///
/// Raised while a query is being built. They are descriptive and recoverable:
/// the caller sent an invalid criteria tree, not the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// Query addressed to a model uid the registry does not know.
    #[error("unknown model `{uid}`")]
    UnknownModel {
        /// The unknown model uid.
        uid: String,
    },

    /// A comparison operator appeared at the root of a filter tree.
    #[error("operator `{0}` is not allowed at the root of a filter; nest it under an attribute or a group operator")]
    InvalidRootOperator(String),

    /// An operator key the filter vocabulary does not define.
    #[error("unknown filter operator `{0}`")]
    UnknownOperator(String),

    /// A filter/sort/populate key does not name an attribute.
    #[error("unknown attribute `{model}.{attribute}`")]
    UnknownAttribute {
        /// Model uid.
        model: String,
        /// The unknown attribute name.
        attribute: String,
    },

    /// Populate was requested for a non-relation attribute.
    #[error("attribute `{model}.{attribute}` is not a relation and cannot be populated")]
    NotPopulatable {
        /// Model uid.
        model: String,
        /// Attribute name.
        attribute: String,
    },

    /// Order-by landed on a non-scalar attribute.
    #[error("cannot order by `{model}.{attribute}`: only scalar attributes are sortable")]
    NotSortable {
        /// Model uid.
        model: String,
        /// Attribute name.
        attribute: String,
    },

    /// Filtering or sorting tried to traverse a polymorphic relation.
    #[error("cannot join through polymorphic relation `{model}.{attribute}`")]
    MorphJoin {
        /// Model uid.
        model: String,
        /// Attribute name.
        attribute: String,
    },

    /// An operator received an operand of the wrong shape.
    #[error("operator `{op}` expects {expected}")]
    InvalidOperand {
        /// The operator key.
        op: String,
        /// Human description of the expected operand shape.
        expected: &'static str,
    },

    /// An insert or update was built without any column values.
    #[error("write statement has no column values")]
    EmptyWrite,
}

/// Engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Fatal schema-compilation error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Recoverable query-construction error.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Error surfaced by the SQL driver, after the dialect transform hook.
    #[error("driver error: {0}")]
    Driver(String),

    /// A value could not be encoded to or decoded from its storage shape.
    #[error("codec error: {0}")]
    Codec(String),

    /// Input data rejected before reaching the driver.
    #[error("validation error: {0}")]
    Validation(String),

    /// Record not found.
    #[error("record not found")]
    NotFound,
}
