//! Implicit join allocation for relation traversal.
//!
//! Every criteria path that touches a relation allocates its own alias from
//! the query's monotonic counter. Aliases are not deduplicated across
//! paths: two paths through the same relation join twice, trading statement
//! size for unambiguous predicates.

use crate::error::QueryError;
use crate::schema::{ModelMeta, Registry, RelationMeta, RelationStorage};
use crate::value::SqlValue;

/// A single LEFT JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Join {
    /// Joined table name.
    pub table: String,
    /// Alias assigned to the joined table.
    pub alias: String,
    /// Equality conditions between qualified column references.
    pub on: Vec<(String, String)>,
    /// Extra parametrized equality conditions (pivot discriminators).
    pub extra: Vec<(String, SqlValue)>,
}

impl Join {
    /// Render this clause, appending parameters for extra conditions.
    pub(crate) fn render(&self, sql: &mut String, params: &mut Vec<SqlValue>) {
        sql.push_str(" LEFT JOIN ");
        sql.push_str(&self.table);
        sql.push_str(" AS ");
        sql.push_str(&self.alias);
        sql.push_str(" ON ");
        let mut first = true;
        for (lhs, rhs) in &self.on {
            if !first {
                sql.push_str(" AND ");
            }
            first = false;
            sql.push_str(lhs);
            sql.push_str(" = ");
            sql.push_str(rhs);
        }
        for (column, value) in &self.extra {
            if !first {
                sql.push_str(" AND ");
            }
            first = false;
            sql.push_str(column);
            sql.push_str(" = ?");
            params.push(value.clone());
        }
    }
}

/// Join from `source_alias` through `relation`, allocating fresh aliases
/// from `counter`. Returns the alias the target table is reachable under.
///
/// Join-column relations are a single hop; join-table relations hop through
/// the pivot. Polymorphic relations have no single target table and cannot
/// be joined.
pub(crate) fn create_join(
    registry: &Registry,
    joins: &mut Vec<Join>,
    counter: &mut u32,
    model: &ModelMeta,
    attribute: &str,
    relation: &RelationMeta,
    source_alias: &str,
) -> Result<(String, String), QueryError> {
    let target_uid = relation.target.clone().ok_or_else(|| QueryError::MorphJoin {
        model: model.uid.clone(),
        attribute: attribute.to_string(),
    })?;
    let target = registry.model(&target_uid)?;

    match &relation.storage {
        RelationStorage::JoinColumn(jc) => {
            let alias = next_alias(counter);
            joins.push(Join {
                table: target.table_name.clone(),
                alias: alias.clone(),
                on: vec![(
                    format!("{source_alias}.{}", jc.name),
                    format!("{alias}.{}", jc.referenced_column),
                )],
                extra: Vec::new(),
            });
            Ok((alias, target_uid))
        }
        RelationStorage::JoinTable(jt) => {
            let pivot_alias = next_alias(counter);
            let target_alias = next_alias(counter);
            joins.push(Join {
                table: jt.name.clone(),
                alias: pivot_alias.clone(),
                on: vec![(
                    format!("{source_alias}.{}", jt.join_column.referenced_column),
                    format!("{pivot_alias}.{}", jt.join_column.name),
                )],
                extra: jt
                    .on
                    .iter()
                    .map(|(column, value)| {
                        (
                            format!("{pivot_alias}.{column}"),
                            SqlValue::Text(value.clone()),
                        )
                    })
                    .collect(),
            });
            joins.push(Join {
                table: target.table_name.clone(),
                alias: target_alias.clone(),
                on: vec![(
                    format!("{pivot_alias}.{}", jt.inverse_join_column.name),
                    format!(
                        "{target_alias}.{}",
                        jt.inverse_join_column.referenced_column
                    ),
                )],
                extra: Vec::new(),
            });
            Ok((target_alias, target_uid))
        }
        RelationStorage::MorphColumn(_)
        | RelationStorage::MorphJoinTable(_)
        | RelationStorage::None => Err(QueryError::MorphJoin {
            model: model.uid.clone(),
            attribute: attribute.to_string(),
        }),
    }
}

/// Allocate the next table alias.
pub(crate) fn next_alias(counter: &mut u32) -> String {
    let alias = format!("t{counter}");
    *counter += 1;
    alias
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ModelDef, RelationDef, Registry, ScalarType};

    fn registry() -> Registry {
        Registry::build(vec![
            ModelDef::new("api::article.article", "article")
                .with_scalar("title", ScalarType::String)
                .with_relation("author", RelationDef::many_to_one("api::author.author"))
                .with_relation("tags", RelationDef::many_to_many("api::tag.tag")),
            ModelDef::new("api::author.author", "author").with_scalar("name", ScalarType::String),
            ModelDef::new("api::tag.tag", "tag").with_scalar("label", ScalarType::String),
        ])
        .unwrap()
    }

    #[test]
    fn test_join_column_single_hop() {
        let registry = registry();
        let model = registry.get("api::article.article").unwrap();
        let relation = model.relation("author").unwrap();

        let mut joins = Vec::new();
        let mut counter = 1;
        let (alias, target) = create_join(
            &registry,
            &mut joins,
            &mut counter,
            model,
            "author",
            relation,
            "t0",
        )
        .unwrap();

        assert_eq!(alias, "t1");
        assert_eq!(target, "api::author.author");
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].table, "authors");
        assert_eq!(
            joins[0].on,
            vec![("t0.author_id".to_string(), "t1.id".to_string())]
        );
    }

    #[test]
    fn test_join_table_two_hops() {
        let registry = registry();
        let model = registry.get("api::article.article").unwrap();
        let relation = model.relation("tags").unwrap();

        let mut joins = Vec::new();
        let mut counter = 1;
        let (alias, _) = create_join(
            &registry,
            &mut joins,
            &mut counter,
            model,
            "tags",
            relation,
            "t0",
        )
        .unwrap();

        assert_eq!(alias, "t2");
        assert_eq!(joins.len(), 2);
        assert_eq!(joins[0].table, "articles_tags_links");
        assert_eq!(
            joins[0].on,
            vec![("t0.id".to_string(), "t1.article_id".to_string())]
        );
        assert_eq!(joins[1].table, "tags");
        assert_eq!(
            joins[1].on,
            vec![("t1.tag_id".to_string(), "t2.id".to_string())]
        );
    }

    #[test]
    fn test_aliases_are_not_deduplicated() {
        let registry = registry();
        let model = registry.get("api::article.article").unwrap();
        let relation = model.relation("author").unwrap();

        let mut joins = Vec::new();
        let mut counter = 1;
        let (a1, _) = create_join(
            &registry,
            &mut joins,
            &mut counter,
            model,
            "author",
            relation,
            "t0",
        )
        .unwrap();
        let (a2, _) = create_join(
            &registry,
            &mut joins,
            &mut counter,
            model,
            "author",
            relation,
            "t0",
        )
        .unwrap();

        assert_ne!(a1, a2);
        assert_eq!(joins.len(), 2);
    }

    #[test]
    fn test_join_render() {
        let join = Join {
            table: "articles_cmps".into(),
            alias: "t1".into(),
            on: vec![("t0.id".into(), "t1.entity_id".into())],
            extra: vec![("t1.field".into(), SqlValue::Text("seo".into()))],
        };
        let mut sql = String::new();
        let mut params = Vec::new();
        join.render(&mut sql, &mut params);

        assert_eq!(
            sql,
            " LEFT JOIN articles_cmps AS t1 ON t0.id = t1.entity_id AND t1.field = ?"
        );
        assert_eq!(params, vec![SqlValue::Text("seo".into())]);
    }
}
