//! Physical storage descriptors for compiled relations.
//!
//! The relation compiler assigns exactly one descriptor to every relation
//! attribute that owns storage. Bidirectional relations share a single
//! physical shape: the inverse attribute carries the structural mirror of
//! the owning attribute's descriptor (join/inverse columns swapped).

use serde::{Deserialize, Serialize};

/// A foreign key living on the owning entity's own table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinColumn {
    /// Column name on the owning table.
    pub name: String,
    /// Referenced column on the target table.
    pub referenced_column: String,
    /// Referenced table name.
    pub referenced_table: String,
}

impl JoinColumn {
    /// Structural mirror for the inverse attribute: the column roles swap
    /// and the referenced table becomes the owner's.
    pub fn mirrored(&self, owner_table: &str) -> JoinColumn {
        JoinColumn {
            name: self.referenced_column.clone(),
            referenced_column: self.name.clone(),
            referenced_table: owner_table.to_string(),
        }
    }
}

/// A pivot table associating two entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTable {
    /// Pivot table name.
    pub name: String,
    /// Column pointing back at the attribute's own side.
    pub join_column: JoinColumn,
    /// Column pointing at the target side.
    pub inverse_join_column: JoinColumn,
    /// Order of targets within one owner's list, when the target side is many.
    pub order_column: Option<String>,
    /// Order of owners within one target's list, when the owner side is many.
    pub inverse_order_column: Option<String>,
    /// Extra pivot equality constraints (column, literal value).
    pub on: Vec<(String, String)>,
    /// Foreign-key columns participating in the pivot.
    pub pivot_columns: Vec<String>,
}

impl JoinTable {
    /// Structural mirror for the inverse attribute: join/inverse columns and
    /// order/inverse-order columns swap, everything else is shared.
    pub fn mirrored(&self) -> JoinTable {
        JoinTable {
            name: self.name.clone(),
            join_column: self.inverse_join_column.clone(),
            inverse_join_column: self.join_column.clone(),
            order_column: self.inverse_order_column.clone(),
            inverse_order_column: self.order_column.clone(),
            on: self.on.clone(),
            pivot_columns: self.pivot_columns.clone(),
        }
    }
}

/// Discriminator column pair identifying a polymorphic target, stored on
/// the owning entity's own table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MorphColumn {
    /// Column holding the target's id.
    pub id_column: String,
    /// Column holding the target's model uid.
    pub type_column: String,
}

/// Shared pivot table for polymorphic many-relations, keyed by
/// `(owner id, target id, target type, attribute name, order)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MorphJoinTable {
    /// Pivot table name.
    pub name: String,
    /// Column pointing back at the owning entity.
    pub join_column: JoinColumn,
    /// Discriminator pair identifying the target row.
    pub morph_column: MorphColumn,
    /// Column holding the owning attribute's name, so one table serves
    /// several polymorphic attributes.
    pub field_column: String,
    /// Order of targets within one owner/attribute list.
    pub order_column: String,
}

/// The one physical shape a compiled relation attribute stores data through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationStorage {
    /// Foreign key on the entity's own table.
    JoinColumn(JoinColumn),
    /// Pivot table.
    JoinTable(JoinTable),
    /// Polymorphic discriminator columns on the entity's own table.
    MorphColumn(MorphColumn),
    /// Shared polymorphic pivot table.
    MorphJoinTable(MorphJoinTable),
    /// No storage: the physical shape lives on the owning side
    /// (morph-one / morph-many back references).
    None,
}

impl RelationStorage {
    /// Whether this side allocated physical storage.
    pub fn is_allocated(&self) -> bool {
        !matches!(self, RelationStorage::None)
    }

    /// Get the join column, if that is the storage shape.
    pub fn join_column(&self) -> Option<&JoinColumn> {
        match self {
            RelationStorage::JoinColumn(jc) => Some(jc),
            _ => None,
        }
    }

    /// Get the join table, if that is the storage shape.
    pub fn join_table(&self) -> Option<&JoinTable> {
        match self {
            RelationStorage::JoinTable(jt) => Some(jt),
            _ => None,
        }
    }

    /// Get the morph column pair, if that is the storage shape.
    pub fn morph_column(&self) -> Option<&MorphColumn> {
        match self {
            RelationStorage::MorphColumn(mc) => Some(mc),
            _ => None,
        }
    }

    /// Get the morph join table, if that is the storage shape.
    pub fn morph_join_table(&self) -> Option<&MorphJoinTable> {
        match self {
            RelationStorage::MorphJoinTable(mt) => Some(mt),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_join_table() -> JoinTable {
        JoinTable {
            name: "articles_tags_links".into(),
            join_column: JoinColumn {
                name: "article_id".into(),
                referenced_column: "id".into(),
                referenced_table: "articles".into(),
            },
            inverse_join_column: JoinColumn {
                name: "tag_id".into(),
                referenced_column: "id".into(),
                referenced_table: "tags".into(),
            },
            order_column: Some("tag_order".into()),
            inverse_order_column: Some("article_order".into()),
            on: vec![],
            pivot_columns: vec!["article_id".into(), "tag_id".into()],
        }
    }

    #[test]
    fn test_join_table_mirror_swaps_columns() {
        let jt = sample_join_table();
        let mirror = jt.mirrored();

        assert_eq!(mirror.join_column, jt.inverse_join_column);
        assert_eq!(mirror.inverse_join_column, jt.join_column);
        assert_eq!(mirror.order_column, jt.inverse_order_column);
        assert_eq!(mirror.inverse_order_column, jt.order_column);
        assert_eq!(mirror.name, jt.name);
    }

    #[test]
    fn test_join_table_mirror_is_involutive() {
        let jt = sample_join_table();
        assert_eq!(jt.mirrored().mirrored(), jt);
    }

    #[test]
    fn test_join_column_mirror() {
        let jc = JoinColumn {
            name: "author_id".into(),
            referenced_column: "id".into(),
            referenced_table: "authors".into(),
        };
        let mirror = jc.mirrored("articles");

        assert_eq!(mirror.name, "id");
        assert_eq!(mirror.referenced_column, "author_id");
        assert_eq!(mirror.referenced_table, "articles");
    }
}
