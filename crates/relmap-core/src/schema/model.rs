//! Model declarations and compiled model metadata.

use serde::{Deserialize, Serialize};

use super::attribute::{Attribute, AttributeDef, RelationDef, RelationMeta, ScalarAttribute};
use super::naming;
use super::types::ScalarType;

/// Column name of the implicit identifier attribute.
pub const ID_COLUMN: &str = "id";

/// A declared content model: input to [`crate::schema::Registry::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    /// Globally unique model identifier.
    pub uid: String,
    /// Singular name, used to derive pivot column names.
    pub singular_name: String,
    /// Explicit table name; derived from the singular name when absent.
    pub table_name: Option<String>,
    /// Declared attributes, in declaration order.
    pub attributes: Vec<(String, AttributeDef)>,
}

impl ModelDef {
    /// Create a model declaration.
    pub fn new(uid: impl Into<String>, singular_name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            singular_name: singular_name.into(),
            table_name: None,
            attributes: Vec::new(),
        }
    }

    /// Override the table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, name: impl Into<String>, def: AttributeDef) -> Self {
        self.attributes.push((name.into(), def));
        self
    }

    /// Add a scalar attribute.
    pub fn with_scalar(self, name: impl Into<String>, scalar: ScalarType) -> Self {
        self.with_attribute(name, AttributeDef::Scalar(ScalarAttribute::new(scalar)))
    }

    /// Add a scalar attribute with full options.
    pub fn with_scalar_options(self, name: impl Into<String>, scalar: ScalarAttribute) -> Self {
        self.with_attribute(name, AttributeDef::Scalar(scalar))
    }

    /// Add a relation attribute.
    pub fn with_relation(self, name: impl Into<String>, def: RelationDef) -> Self {
        self.with_attribute(name, AttributeDef::Relation(def))
    }

    /// Add an embedded component attribute.
    pub fn with_component(
        self,
        name: impl Into<String>,
        component: impl Into<String>,
        repeatable: bool,
    ) -> Self {
        self.with_attribute(
            name,
            AttributeDef::Component {
                component: component.into(),
                repeatable,
            },
        )
    }

    /// Add a dynamic-zone attribute.
    pub fn with_dynamic_zone(
        self,
        name: impl Into<String>,
        components: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.with_attribute(
            name,
            AttributeDef::DynamicZone {
                components: components.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// The table name this model will compile to.
    pub fn resolved_table_name(&self) -> String {
        self.table_name
            .clone()
            .unwrap_or_else(|| naming::table_name(&self.singular_name))
    }
}

/// Compiled model metadata. Immutable once the registry is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    /// Globally unique model identifier.
    pub uid: String,
    /// Singular name.
    pub singular_name: String,
    /// Physical table name.
    pub table_name: String,
    /// Compiled attributes, in declaration order (implicit `id` first).
    pub attributes: Vec<(String, Attribute)>,
}

impl ModelMeta {
    /// Get an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a)
    }

    /// Get a relation attribute by name.
    pub fn relation(&self, name: &str) -> Option<&RelationMeta> {
        self.attribute(name).and_then(Attribute::as_relation)
    }

    /// Get a scalar attribute by name.
    pub fn scalar(&self, name: &str) -> Option<&ScalarAttribute> {
        self.attribute(name).and_then(Attribute::as_scalar)
    }

    /// Iterate relation attributes in declaration order.
    pub fn relations(&self) -> impl Iterator<Item = (&str, &RelationMeta)> {
        self.attributes
            .iter()
            .filter_map(|(n, a)| a.as_relation().map(|r| (n.as_str(), r)))
    }

    /// Iterate scalar attributes in declaration order.
    pub fn scalars(&self) -> impl Iterator<Item = (&str, &ScalarAttribute)> {
        self.attributes
            .iter()
            .filter_map(|(n, a)| a.as_scalar().map(|s| (n.as_str(), s)))
    }

    /// Physical column name of a scalar attribute.
    pub fn scalar_column(&self, name: &str) -> Option<String> {
        self.scalar(name)
            .map(|s| s.column.clone().unwrap_or_else(|| naming::column_name(name)))
    }

    /// Find the scalar attribute stored in the given column, together with
    /// its declared name.
    pub fn scalar_for_column(&self, column: &str) -> Option<(&str, &ScalarAttribute)> {
        self.scalars().find(|(name, s)| match &s.column {
            Some(c) => c == column,
            None => naming::column_name(name) == column,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_def_builder() {
        let def = ModelDef::new("api::article.article", "article")
            .with_scalar("title", ScalarType::String)
            .with_relation("author", RelationDef::many_to_one("api::author.author"));

        assert_eq!(def.uid, "api::article.article");
        assert_eq!(def.resolved_table_name(), "articles");
        assert_eq!(def.attributes.len(), 2);
    }

    #[test]
    fn test_explicit_table_name_wins() {
        let def = ModelDef::new("api::person.person", "person").with_table("people");
        assert_eq!(def.resolved_table_name(), "people");
    }
}
