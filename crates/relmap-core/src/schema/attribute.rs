//! Attribute declarations and compiled attribute metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::storage::{JoinColumn, JoinTable, MorphColumn, MorphJoinTable, RelationStorage};
use super::types::ScalarType;

/// The closed set of relation kinds.
///
/// Every consumer of relation metadata (join compiler, populate engine,
/// entity manager) matches exhaustively on this enum, so adding a kind is a
/// compile-time change everywhere at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationKind {
    /// One-to-one relation.
    OneToOne,
    /// One-to-many relation.
    OneToMany,
    /// Many-to-one relation.
    ManyToOne,
    /// Many-to-many relation.
    ManyToMany,
    /// Single-valued polymorphic back reference.
    MorphOne,
    /// Many-valued polymorphic back reference.
    MorphMany,
    /// Single-valued polymorphic owner (discriminator columns).
    MorphToOne,
    /// Many-valued polymorphic owner (shared pivot table).
    MorphToMany,
}

impl RelationKind {
    /// Whether the target side holds many records.
    pub fn is_many(&self) -> bool {
        matches!(
            self,
            RelationKind::OneToMany
                | RelationKind::ManyToMany
                | RelationKind::MorphMany
                | RelationKind::MorphToMany
        )
    }

    /// Whether this kind is polymorphic.
    pub fn is_morph(&self) -> bool {
        matches!(
            self,
            RelationKind::MorphOne
                | RelationKind::MorphMany
                | RelationKind::MorphToOne
                | RelationKind::MorphToMany
        )
    }

    /// The kind the inverse attribute of a bidirectional relation must declare.
    pub fn expected_inverse(&self) -> Option<RelationKind> {
        match self {
            RelationKind::OneToOne => Some(RelationKind::OneToOne),
            RelationKind::OneToMany => Some(RelationKind::ManyToOne),
            RelationKind::ManyToOne => Some(RelationKind::OneToMany),
            RelationKind::ManyToMany => Some(RelationKind::ManyToMany),
            _ => None,
        }
    }

    /// Stable name, as used in declarations.
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::OneToOne => "oneToOne",
            RelationKind::OneToMany => "oneToMany",
            RelationKind::ManyToOne => "manyToOne",
            RelationKind::ManyToMany => "manyToMany",
            RelationKind::MorphOne => "morphOne",
            RelationKind::MorphMany => "morphMany",
            RelationKind::MorphToOne => "morphToOne",
            RelationKind::MorphToMany => "morphToMany",
        }
    }
}

impl std::fmt::Display for RelationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar attribute declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarAttribute {
    /// Scalar type.
    pub scalar: ScalarType,
    /// Whether a value is required on create.
    pub required: bool,
    /// Whether values must be unique.
    pub unique: bool,
    /// Default value applied when the attribute is absent on create.
    pub default: Option<JsonValue>,
    /// Allowed values, for [`ScalarType::Enumeration`] attributes.
    pub enum_values: Vec<String>,
    /// Explicit column name; derived from the attribute name when absent.
    pub column: Option<String>,
}

impl ScalarAttribute {
    /// Create a scalar attribute declaration.
    pub fn new(scalar: ScalarType) -> Self {
        Self {
            scalar,
            required: false,
            unique: false,
            default: None,
            enum_values: Vec::new(),
            column: None,
        }
    }

    /// Mark the attribute required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Mark the attribute unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set the default value.
    pub fn with_default(mut self, default: JsonValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Set the allowed enumeration values.
    pub fn with_values(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    /// Override the physical column name.
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

/// A relation attribute declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationDef {
    /// Relation kind.
    pub kind: RelationKind,
    /// Target model uid. Absent for polymorphic owners, whose target is
    /// resolved per row through the discriminator.
    pub target: Option<String>,
    /// Inverse attribute on the target; declares this side as owner.
    pub inversed_by: Option<String>,
    /// Owning attribute on the target; declares this side as inverse.
    pub mapped_by: Option<String>,
    /// For morph-one/morph-many: the polymorphic owner attribute on the target.
    pub morph_by: Option<String>,
    /// Store a one-side relation through a pivot table instead of a
    /// foreign-key column.
    pub use_join_table: bool,
}

impl RelationDef {
    fn new(kind: RelationKind, target: Option<String>) -> Self {
        Self {
            kind,
            target,
            inversed_by: None,
            mapped_by: None,
            morph_by: None,
            use_join_table: false,
        }
    }

    /// Declare a one-to-one relation.
    pub fn one_to_one(target: impl Into<String>) -> Self {
        Self::new(RelationKind::OneToOne, Some(target.into()))
    }

    /// Declare a one-to-many relation.
    pub fn one_to_many(target: impl Into<String>) -> Self {
        Self::new(RelationKind::OneToMany, Some(target.into()))
    }

    /// Declare a many-to-one relation.
    pub fn many_to_one(target: impl Into<String>) -> Self {
        Self::new(RelationKind::ManyToOne, Some(target.into()))
    }

    /// Declare a many-to-many relation.
    pub fn many_to_many(target: impl Into<String>) -> Self {
        Self::new(RelationKind::ManyToMany, Some(target.into()))
    }

    /// Declare a single-valued polymorphic back reference.
    pub fn morph_one(target: impl Into<String>, morph_by: impl Into<String>) -> Self {
        let mut def = Self::new(RelationKind::MorphOne, Some(target.into()));
        def.morph_by = Some(morph_by.into());
        def
    }

    /// Declare a many-valued polymorphic back reference.
    pub fn morph_many(target: impl Into<String>, morph_by: impl Into<String>) -> Self {
        let mut def = Self::new(RelationKind::MorphMany, Some(target.into()));
        def.morph_by = Some(morph_by.into());
        def
    }

    /// Declare a single-valued polymorphic owner.
    pub fn morph_to_one() -> Self {
        Self::new(RelationKind::MorphToOne, None)
    }

    /// Declare a many-valued polymorphic owner.
    pub fn morph_to_many() -> Self {
        Self::new(RelationKind::MorphToMany, None)
    }

    /// Name the inverse attribute on the target, making this side the owner.
    pub fn inversed_by(mut self, attribute: impl Into<String>) -> Self {
        self.inversed_by = Some(attribute.into());
        self
    }

    /// Name the owning attribute on the target, making this side the inverse.
    pub fn mapped_by(mut self, attribute: impl Into<String>) -> Self {
        self.mapped_by = Some(attribute.into());
        self
    }

    /// Store through a pivot table instead of a foreign-key column.
    pub fn via_join_table(mut self) -> Self {
        self.use_join_table = true;
        self
    }
}

/// A declared attribute, before compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeDef {
    /// Scalar column.
    Scalar(ScalarAttribute),
    /// Relation to another model.
    Relation(RelationDef),
    /// Embedded structured value; rewritten to a relation during
    /// compilation.
    Component {
        /// Component model uid.
        component: String,
        /// Whether the embed holds a list of values.
        repeatable: bool,
    },
    /// Polymorphic union of component values; rewritten to a morph-to-many
    /// relation during compilation.
    DynamicZone {
        /// Allowed component model uids.
        components: Vec<String>,
    },
}

/// Compiled relation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMeta {
    /// Relation kind.
    pub kind: RelationKind,
    /// Target model uid, when the target is fixed.
    pub target: Option<String>,
    /// Inverse attribute name on the target, for bidirectional owners.
    pub inversed_by: Option<String>,
    /// Owning attribute name on the target, for bidirectional inverses.
    pub mapped_by: Option<String>,
    /// Polymorphic owner attribute on the target, for morph back references.
    pub morph_by: Option<String>,
    /// Whether this side allocated the physical storage.
    pub owner: bool,
    /// The physical storage shape.
    pub storage: RelationStorage,
}

impl RelationMeta {
    /// Get the join column, if that is the storage shape.
    pub fn join_column(&self) -> Option<&JoinColumn> {
        self.storage.join_column()
    }

    /// Get the join table, if that is the storage shape.
    pub fn join_table(&self) -> Option<&JoinTable> {
        self.storage.join_table()
    }

    /// Get the morph column pair, if that is the storage shape.
    pub fn morph_column(&self) -> Option<&MorphColumn> {
        self.storage.morph_column()
    }

    /// Get the morph join table, if that is the storage shape.
    pub fn morph_join_table(&self) -> Option<&MorphJoinTable> {
        self.storage.morph_join_table()
    }

    /// Whether populate should attach a single record rather than a list.
    pub fn is_single(&self) -> bool {
        !self.kind.is_many()
    }
}

/// A compiled attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    /// Scalar column.
    Scalar(ScalarAttribute),
    /// Compiled relation.
    Relation(RelationMeta),
}

impl Attribute {
    /// Get the scalar declaration, if this is a scalar.
    pub fn as_scalar(&self) -> Option<&ScalarAttribute> {
        match self {
            Attribute::Scalar(s) => Some(s),
            Attribute::Relation(_) => None,
        }
    }

    /// Get the relation metadata, if this is a relation.
    pub fn as_relation(&self) -> Option<&RelationMeta> {
        match self {
            Attribute::Relation(r) => Some(r),
            Attribute::Scalar(_) => None,
        }
    }

    /// Check if this attribute is a relation.
    pub fn is_relation(&self) -> bool {
        matches!(self, Attribute::Relation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_def_builder() {
        let def = RelationDef::many_to_one("api::author.author").inversed_by("articles");

        assert_eq!(def.kind, RelationKind::ManyToOne);
        assert_eq!(def.target.as_deref(), Some("api::author.author"));
        assert_eq!(def.inversed_by.as_deref(), Some("articles"));
        assert!(def.mapped_by.is_none());
        assert!(!def.use_join_table);
    }

    #[test]
    fn test_expected_inverse_pairs() {
        assert_eq!(
            RelationKind::ManyToOne.expected_inverse(),
            Some(RelationKind::OneToMany)
        );
        assert_eq!(
            RelationKind::ManyToMany.expected_inverse(),
            Some(RelationKind::ManyToMany)
        );
        assert_eq!(RelationKind::MorphToMany.expected_inverse(), None);
    }

    #[test]
    fn test_kind_predicates() {
        assert!(RelationKind::OneToMany.is_many());
        assert!(!RelationKind::ManyToOne.is_many());
        assert!(RelationKind::MorphToOne.is_morph());
        assert!(!RelationKind::ManyToMany.is_morph());
    }

    #[test]
    fn test_scalar_attribute_builder() {
        let attr = ScalarAttribute::new(ScalarType::Enumeration)
            .required()
            .with_values(["draft", "published"]);

        assert!(attr.required);
        assert_eq!(attr.enum_values, vec!["draft", "published"]);
    }
}
