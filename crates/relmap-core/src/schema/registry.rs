//! Frozen metadata registry.

use std::collections::BTreeMap;

use tracing::debug;

use super::compile;
use super::model::{ModelDef, ModelMeta};
use crate::error::{ConfigError, QueryError};

/// The compiled registry: one descriptor per model, immutable after build.
///
/// Built in two explicit phases (shell allocation, relation resolution) and
/// returned frozen, so there is no window in which half-compiled metadata
/// can be observed.
#[derive(Debug, Clone)]
pub struct Registry {
    models: BTreeMap<String, ModelMeta>,
}

impl Registry {
    /// Compile a set of model declarations into a frozen registry.
    ///
    /// Fatal on any configuration error; a registry that builds is fully
    /// resolved.
    pub fn build(defs: Vec<ModelDef>) -> Result<Self, ConfigError> {
        let shells = compile::allocate_shells(defs)?;
        let models = compile::resolve_relations(shells)?;
        debug!(models = models.len(), "metadata registry compiled");
        Ok(Self { models })
    }

    /// Get a model by uid.
    pub fn get(&self, uid: &str) -> Option<&ModelMeta> {
        self.models.get(uid)
    }

    /// Get a model by uid, as a query-time error when absent.
    pub(crate) fn model(&self, uid: &str) -> Result<&ModelMeta, QueryError> {
        self.models.get(uid).ok_or_else(|| QueryError::UnknownModel {
            uid: uid.to_string(),
        })
    }

    /// Iterate all models in uid order.
    pub fn models(&self) -> impl Iterator<Item = &ModelMeta> {
        self.models.values()
    }

    /// Number of models, including synthesized pivot models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the registry holds no models.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::attribute::{AttributeDef, RelationDef, RelationKind};
    use crate::schema::storage::RelationStorage;
    use crate::schema::types::ScalarType;

    fn blog_defs() -> Vec<ModelDef> {
        vec![
            ModelDef::new("api::article.article", "article")
                .with_scalar("title", ScalarType::String)
                .with_relation(
                    "author",
                    RelationDef::many_to_one("api::author.author").inversed_by("articles"),
                )
                .with_relation(
                    "tags",
                    RelationDef::many_to_many("api::tag.tag").inversed_by("articles"),
                ),
            ModelDef::new("api::author.author", "author")
                .with_scalar("name", ScalarType::String)
                .with_relation(
                    "articles",
                    RelationDef::one_to_many("api::article.article").mapped_by("author"),
                ),
            ModelDef::new("api::tag.tag", "tag")
                .with_scalar("label", ScalarType::String)
                .with_relation(
                    "articles",
                    RelationDef::many_to_many("api::article.article").mapped_by("tags"),
                ),
        ]
    }

    #[test]
    fn test_build_blog_registry() {
        let registry = Registry::build(blog_defs()).unwrap();

        let article = registry.get("api::article.article").unwrap();
        assert_eq!(article.table_name, "articles");
        // Implicit identifier comes first.
        assert_eq!(article.attributes[0].0, "id");

        let author_rel = article.relation("author").unwrap();
        assert!(author_rel.owner);
        let jc = author_rel.join_column().unwrap();
        assert_eq!(jc.name, "author_id");
        assert_eq!(jc.referenced_table, "authors");
    }

    #[test]
    fn test_many_to_many_inverse_is_structural_mirror() {
        let registry = Registry::build(blog_defs()).unwrap();

        let owner = registry
            .get("api::article.article")
            .unwrap()
            .relation("tags")
            .unwrap();
        let inverse = registry
            .get("api::tag.tag")
            .unwrap()
            .relation("articles")
            .unwrap();

        let owner_jt = owner.join_table().unwrap();
        let inverse_jt = inverse.join_table().unwrap();

        assert_eq!(owner_jt.name, "articles_tags_links");
        assert_eq!(inverse_jt, &owner_jt.mirrored());
        assert_eq!(inverse_jt.join_column, owner_jt.inverse_join_column);
        assert_eq!(inverse_jt.inverse_join_column, owner_jt.join_column);
        assert!(owner.owner);
        assert!(!inverse.owner);
    }

    #[test]
    fn test_one_to_many_inverse_mirrors_join_column() {
        let registry = Registry::build(blog_defs()).unwrap();

        let inverse = registry
            .get("api::author.author")
            .unwrap()
            .relation("articles")
            .unwrap();
        let jc = inverse.join_column().unwrap();

        // Mirrored: key on the author's own id, match article rows on the
        // foreign-key column.
        assert_eq!(jc.name, "id");
        assert_eq!(jc.referenced_column, "author_id");
        assert_eq!(jc.referenced_table, "articles");
        assert_eq!(inverse.mapped_by.as_deref(), Some("author"));
    }

    #[test]
    fn test_self_referencing_many_to_many_gets_distinct_columns() {
        let defs = vec![ModelDef::new("api::article.article", "article")
            .with_scalar("title", ScalarType::String)
            .with_relation("related", RelationDef::many_to_many("api::article.article"))];

        let registry = Registry::build(defs).unwrap();
        let rel = registry
            .get("api::article.article")
            .unwrap()
            .relation("related")
            .unwrap();
        let jt = rel.join_table().unwrap();

        assert_eq!(jt.join_column.name, "article_id");
        assert_eq!(jt.inverse_join_column.name, "inv_article_id");
        assert_ne!(jt.join_column.name, jt.inverse_join_column.name);
        assert_eq!(jt.join_column.referenced_table, "articles");
        assert_eq!(jt.inverse_join_column.referenced_table, "articles");
        assert_ne!(jt.order_column, jt.inverse_order_column);
    }

    #[test]
    fn test_unidirectional_one_to_many_uses_join_table() {
        let defs = vec![
            ModelDef::new("api::list.list", "list")
                .with_relation("entries", RelationDef::one_to_many("api::entry.entry")),
            ModelDef::new("api::entry.entry", "entry").with_scalar("label", ScalarType::String),
        ];

        let registry = Registry::build(defs).unwrap();
        let rel = registry
            .get("api::list.list")
            .unwrap()
            .relation("entries")
            .unwrap();
        let jt = rel.join_table().unwrap();

        assert_eq!(jt.name, "lists_entries_links");
        assert_eq!(jt.order_column.as_deref(), Some("entry_order"));
        assert!(jt.inverse_order_column.is_none());
    }

    #[test]
    fn test_owning_one_to_many_is_rejected() {
        let defs = vec![
            ModelDef::new("api::author.author", "author").with_relation(
                "articles",
                RelationDef::one_to_many("api::article.article").inversed_by("author"),
            ),
            ModelDef::new("api::article.article", "article").with_relation(
                "author",
                RelationDef::many_to_one("api::author.author").mapped_by("articles"),
            ),
        ];

        let err = Registry::build(defs).unwrap_err();
        assert!(matches!(err, ConfigError::OneToManyOwner { .. }));
    }

    #[test]
    fn test_unknown_target_is_fatal() {
        let defs = vec![ModelDef::new("api::article.article", "article")
            .with_relation("author", RelationDef::many_to_one("api::author.author"))];

        let err = Registry::build(defs).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownTarget { .. }));
    }

    #[test]
    fn test_missing_inverse_is_fatal() {
        let defs = vec![
            ModelDef::new("api::article.article", "article").with_relation(
                "author",
                RelationDef::many_to_one("api::author.author").inversed_by("articles"),
            ),
            ModelDef::new("api::author.author", "author").with_scalar("name", ScalarType::String),
        ];

        let err = Registry::build(defs).unwrap_err();
        assert!(matches!(err, ConfigError::MissingInverse { .. }));
    }

    #[test]
    fn test_incompatible_inverse_kind_is_fatal() {
        let defs = vec![
            ModelDef::new("api::article.article", "article").with_relation(
                "author",
                RelationDef::many_to_one("api::author.author").inversed_by("articles"),
            ),
            ModelDef::new("api::author.author", "author").with_relation(
                "articles",
                RelationDef::many_to_many("api::article.article").mapped_by("author"),
            ),
        ];

        let err = Registry::build(defs).unwrap_err();
        assert!(matches!(err, ConfigError::IncompatibleInverse { .. }));
    }

    #[test]
    fn test_duplicate_model_is_fatal() {
        let defs = vec![
            ModelDef::new("api::tag.tag", "tag"),
            ModelDef::new("api::tag.tag", "tag"),
        ];

        let err = Registry::build(defs).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateModel { .. }));
    }

    #[test]
    fn test_component_rewrites_to_pivot_relation() {
        let defs = vec![
            ModelDef::new("api::article.article", "article")
                .with_component("seo", "component::shared.seo", false)
                .with_component("blocks", "component::shared.block", true),
            ModelDef::new("component::shared.seo", "seo")
                .with_scalar("description", ScalarType::Text),
            ModelDef::new("component::shared.block", "block")
                .with_scalar("body", ScalarType::Text),
        ];

        let registry = Registry::build(defs).unwrap();
        let article = registry.get("api::article.article").unwrap();

        let seo = article.relation("seo").unwrap();
        assert_eq!(seo.kind, RelationKind::OneToOne);
        let seo_jt = seo.join_table().unwrap();
        assert_eq!(seo_jt.name, "articles_cmps");
        assert!(seo_jt.order_column.is_none());
        assert!(seo_jt
            .on
            .contains(&("field".to_string(), "seo".to_string())));

        let blocks = article.relation("blocks").unwrap();
        assert_eq!(blocks.kind, RelationKind::OneToMany);
        let blocks_jt = blocks.join_table().unwrap();
        assert_eq!(blocks_jt.name, "articles_cmps");
        assert_eq!(blocks_jt.order_column.as_deref(), Some("order"));

        // Auxiliary pivot model was synthesized.
        assert!(registry.get("api::article.article.components").is_some());
    }

    #[test]
    fn test_dynamic_zone_rewrites_to_morph_to_many() {
        let defs = vec![
            ModelDef::new("api::page.page", "page")
                .with_dynamic_zone("content", ["component::shared.block"]),
            ModelDef::new("component::shared.block", "block")
                .with_scalar("body", ScalarType::Text),
        ];

        let registry = Registry::build(defs).unwrap();
        let rel = registry
            .get("api::page.page")
            .unwrap()
            .relation("content")
            .unwrap();

        assert_eq!(rel.kind, RelationKind::MorphToMany);
        let mt = rel.morph_join_table().unwrap();
        assert_eq!(mt.name, "pages_morphs");
        assert_eq!(mt.morph_column.type_column, "morph_type");
        assert!(registry.get("api::page.page.morphs").is_some());
    }

    #[test]
    fn test_morph_pair_compiles() {
        let defs = vec![
            ModelDef::new("api::image.image", "image")
                .with_relation("related", RelationDef::morph_to_many()),
            ModelDef::new("api::article.article", "article").with_relation(
                "cover",
                RelationDef::morph_one("api::image.image", "related"),
            ),
        ];

        let registry = Registry::build(defs).unwrap();

        let owner = registry
            .get("api::image.image")
            .unwrap()
            .relation("related")
            .unwrap();
        assert!(matches!(owner.storage, RelationStorage::MorphJoinTable(_)));

        let backref = registry
            .get("api::article.article")
            .unwrap()
            .relation("cover")
            .unwrap();
        assert!(matches!(backref.storage, RelationStorage::None));
        assert_eq!(backref.morph_by.as_deref(), Some("related"));
    }

    #[test]
    fn test_morph_backref_requires_polymorphic_owner() {
        let defs = vec![
            ModelDef::new("api::image.image", "image").with_scalar("url", ScalarType::String),
            ModelDef::new("api::article.article", "article").with_relation(
                "cover",
                RelationDef::morph_one("api::image.image", "related"),
            ),
        ];

        let err = Registry::build(defs).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMorphOwner { .. }));
    }

    #[test]
    fn test_every_resolved_relation_has_one_storage_shape() {
        let registry = Registry::build(blog_defs()).unwrap();
        for model in registry.models() {
            for (_, rel) in model.relations() {
                match rel.kind {
                    RelationKind::MorphOne | RelationKind::MorphMany => {
                        assert!(!rel.storage.is_allocated());
                    }
                    _ => assert!(rel.storage.is_allocated()),
                }
            }
        }
    }

    #[test]
    fn test_attribute_def_shapes_survive_serde() {
        let def = AttributeDef::Relation(RelationDef::many_to_many("api::tag.tag"));
        let json = serde_json::to_string(&def).unwrap();
        let back: AttributeDef = serde_json::from_str(&json).unwrap();
        assert_eq!(def, back);
    }
}
