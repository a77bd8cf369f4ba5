//! Two-phase relation compiler.
//!
//! Phase 1 allocates one shell per declared model: the implicit identifier
//! is added, embedded components and dynamic zones are rewritten to
//! relations, and auxiliary pivot models are synthesized. No relation is
//! resolved yet, so phase 2 can rely on every target being present.
//!
//! Phase 2 resolves each relation to its physical storage descriptor.
//! Compiling an owning relation also writes the mirrored descriptor into
//! the target's inverse attribute, which is why the phases cannot be fused.

use std::collections::BTreeMap;

use tracing::debug;

use super::attribute::{
    Attribute, AttributeDef, RelationDef, RelationKind, RelationMeta, ScalarAttribute,
};
use super::model::{ModelDef, ModelMeta, ID_COLUMN};
use super::naming;
use super::storage::{JoinColumn, JoinTable, MorphColumn, MorphJoinTable, RelationStorage};
use super::types::ScalarType;
use crate::error::ConfigError;

/// How a relation shell maps onto a pivot, for attributes rewritten during
/// phase 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkVia {
    /// Declared relation; storage follows the relation kind.
    Declared,
    /// Rewritten component embed; storage is the owner's component pivot.
    Component,
}

#[derive(Debug, Clone)]
enum ShellAttr {
    Scalar(ScalarAttribute),
    Relation {
        def: RelationDef,
        via: LinkVia,
        meta: Option<RelationMeta>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct Shell {
    uid: String,
    singular_name: String,
    table_name: String,
    attributes: Vec<(String, ShellAttr)>,
}

impl Shell {
    fn attr(&self, name: &str) -> Option<&ShellAttr> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a)
    }
}

fn scalar_column(name: &str, scalar: ScalarType) -> (String, ShellAttr) {
    (
        name.to_string(),
        ShellAttr::Scalar(ScalarAttribute::new(scalar)),
    )
}

/// Phase 1: allocate model shells.
pub(crate) fn allocate_shells(
    defs: Vec<ModelDef>,
) -> Result<BTreeMap<String, Shell>, ConfigError> {
    let declared: Vec<String> = defs.iter().map(|d| d.uid.clone()).collect();

    let mut shells: BTreeMap<String, Shell> = BTreeMap::new();
    let mut aux: Vec<Shell> = Vec::new();

    for def in defs {
        if shells.contains_key(&def.uid) {
            return Err(ConfigError::DuplicateModel { uid: def.uid });
        }

        let table_name = def.resolved_table_name();
        let mut attributes: Vec<(String, ShellAttr)> = Vec::new();

        // Implicit auto-increment identifier, unless declared explicitly.
        if !def.attributes.iter().any(|(n, _)| n == ID_COLUMN) {
            attributes.push((
                ID_COLUMN.to_string(),
                ShellAttr::Scalar(ScalarAttribute::new(ScalarType::Integer).required()),
            ));
        }

        let mut has_components = false;
        let mut has_morphs = false;

        for (name, attr) in def.attributes {
            let shell_attr = match attr {
                AttributeDef::Scalar(s) => ShellAttr::Scalar(s),
                AttributeDef::Relation(r) => {
                    if matches!(r.kind, RelationKind::MorphToMany) {
                        has_morphs = true;
                    }
                    ShellAttr::Relation {
                        def: r,
                        via: LinkVia::Declared,
                        meta: None,
                    }
                }
                AttributeDef::Component {
                    component,
                    repeatable,
                } => {
                    if !declared.contains(&component) {
                        return Err(ConfigError::UnknownComponent {
                            model: def.uid,
                            attribute: name,
                            component,
                        });
                    }
                    has_components = true;
                    let kind = if repeatable {
                        RelationKind::OneToMany
                    } else {
                        RelationKind::OneToOne
                    };
                    let mut rewritten = RelationDef::one_to_one(component.clone());
                    rewritten.kind = kind;
                    ShellAttr::Relation {
                        def: rewritten,
                        via: LinkVia::Component,
                        meta: None,
                    }
                }
                AttributeDef::DynamicZone { components } => {
                    for component in &components {
                        if !declared.contains(component) {
                            return Err(ConfigError::UnknownComponent {
                                model: def.uid,
                                attribute: name,
                                component: component.clone(),
                            });
                        }
                    }
                    has_morphs = true;
                    ShellAttr::Relation {
                        def: RelationDef::morph_to_many(),
                        via: LinkVia::Declared,
                        meta: None,
                    }
                }
            };
            attributes.push((name, shell_attr));
        }

        if has_components {
            aux.push(pivot_shell(
                format!("{}.components", def.uid),
                format!("{}-component", def.singular_name),
                naming::component_table_name(&table_name),
                "cmp_id",
                "component_type",
            ));
        }
        if has_morphs {
            aux.push(pivot_shell(
                format!("{}.morphs", def.uid),
                format!("{}-morph", def.singular_name),
                naming::morph_table_name(&table_name),
                "morph_id",
                "morph_type",
            ));
        }

        shells.insert(
            def.uid.clone(),
            Shell {
                uid: def.uid,
                singular_name: def.singular_name,
                table_name,
                attributes,
            },
        );
    }

    for shell in aux {
        shells.entry(shell.uid.clone()).or_insert(shell);
    }

    Ok(shells)
}

/// Synthesized pivot model backing component embeds or polymorphic unions.
fn pivot_shell(
    uid: String,
    singular_name: String,
    table_name: String,
    id_column: &str,
    type_column: &str,
) -> Shell {
    Shell {
        uid,
        singular_name,
        table_name,
        attributes: vec![
            scalar_column(ID_COLUMN, ScalarType::Integer),
            scalar_column("entity_id", ScalarType::Integer),
            scalar_column(id_column, ScalarType::Integer),
            scalar_column(type_column, ScalarType::String),
            scalar_column("field", ScalarType::String),
            scalar_column("order", ScalarType::Integer),
        ],
    }
}

struct SideInfo {
    uid: String,
    singular_name: String,
    table_name: String,
}

fn side_info(shells: &BTreeMap<String, Shell>, uid: &str) -> Option<SideInfo> {
    shells.get(uid).map(|s| SideInfo {
        uid: s.uid.clone(),
        singular_name: s.singular_name.clone(),
        table_name: s.table_name.clone(),
    })
}

fn set_meta(shells: &mut BTreeMap<String, Shell>, uid: &str, attr: &str, new_meta: RelationMeta) {
    if let Some(shell) = shells.get_mut(uid) {
        for (name, a) in &mut shell.attributes {
            if name == attr {
                if let ShellAttr::Relation { meta, .. } = a {
                    *meta = Some(new_meta);
                }
                return;
            }
        }
    }
}

/// Phase 2: resolve every relation to physical storage.
pub(crate) fn resolve_relations(
    mut shells: BTreeMap<String, Shell>,
) -> Result<BTreeMap<String, ModelMeta>, ConfigError> {
    let keys: Vec<(String, String)> = shells
        .iter()
        .flat_map(|(uid, shell)| {
            shell
                .attributes
                .iter()
                .filter(|(_, a)| matches!(a, ShellAttr::Relation { .. }))
                .map(move |(name, _)| (uid.clone(), name.clone()))
        })
        .collect();

    for (uid, attr) in &keys {
        compile_relation(&mut shells, uid, attr)?;
    }

    // Every mapped side must have received a mirrored descriptor by now.
    for (uid, attr) in &keys {
        let shell = &shells[uid];
        if let Some(ShellAttr::Relation { def, meta: None, .. }) = shell.attr(attr) {
            return Err(ConfigError::MissingInverse {
                model: uid.clone(),
                attribute: attr.clone(),
                target: def.target.clone().unwrap_or_default(),
                inverse: def.mapped_by.clone().unwrap_or_default(),
            });
        }
    }

    let mut models = BTreeMap::new();
    for (uid, shell) in shells {
        let attributes = shell
            .attributes
            .into_iter()
            .map(|(name, attr)| {
                let compiled = match attr {
                    ShellAttr::Scalar(s) => Attribute::Scalar(s),
                    ShellAttr::Relation { meta, .. } => {
                        // The sweep above guarantees resolution.
                        Attribute::Relation(meta.expect("relation resolved"))
                    }
                };
                (name, compiled)
            })
            .collect();
        models.insert(
            uid,
            ModelMeta {
                uid: shell.uid,
                singular_name: shell.singular_name,
                table_name: shell.table_name,
                attributes,
            },
        );
    }

    Ok(models)
}

fn compile_relation(
    shells: &mut BTreeMap<String, Shell>,
    uid: &str,
    attr: &str,
) -> Result<(), ConfigError> {
    let (def, via, resolved) = match shells[uid].attr(attr) {
        Some(ShellAttr::Relation { def, via, meta }) => (def.clone(), *via, meta.is_some()),
        _ => return Ok(()),
    };
    if resolved {
        // Mirrored earlier by the owning side.
        return Ok(());
    }

    let owner_info = side_info(shells, uid).expect("owner shell present");

    match def.kind {
        RelationKind::OneToOne | RelationKind::ManyToOne => {
            if def.mapped_by.is_some() {
                validate_mapped_side(shells, uid, attr, &def)?;
                // The owning side writes the mirrored descriptor.
                return Ok(());
            }
            let target_info = require_target(shells, uid, attr, &def)?;
            let storage = if via == LinkVia::Component {
                RelationStorage::JoinTable(component_join_table(
                    &owner_info,
                    attr,
                    &target_info,
                    false,
                ))
            } else if def.use_join_table {
                RelationStorage::JoinTable(build_join_table(
                    &owner_info,
                    attr,
                    &target_info,
                    def.kind,
                    def.inversed_by.as_deref(),
                ))
            } else {
                RelationStorage::JoinColumn(JoinColumn {
                    name: naming::join_column_name(attr),
                    referenced_column: ID_COLUMN.to_string(),
                    referenced_table: target_info.table_name.clone(),
                })
            };
            finish_owner(shells, uid, attr, &def, &owner_info, &target_info, storage)?;
        }
        RelationKind::OneToMany => {
            if def.inversed_by.is_some() {
                return Err(ConfigError::OneToManyOwner {
                    model: uid.to_string(),
                    attribute: attr.to_string(),
                });
            }
            if def.mapped_by.is_some() {
                validate_mapped_side(shells, uid, attr, &def)?;
                return Ok(());
            }
            // Unidirectional one-to-many always goes through a pivot.
            let target_info = require_target(shells, uid, attr, &def)?;
            let storage = if via == LinkVia::Component {
                RelationStorage::JoinTable(component_join_table(
                    &owner_info,
                    attr,
                    &target_info,
                    true,
                ))
            } else {
                RelationStorage::JoinTable(build_join_table(
                    &owner_info,
                    attr,
                    &target_info,
                    def.kind,
                    None,
                ))
            };
            finish_owner(shells, uid, attr, &def, &owner_info, &target_info, storage)?;
        }
        RelationKind::ManyToMany => {
            if def.mapped_by.is_some() {
                validate_mapped_side(shells, uid, attr, &def)?;
                return Ok(());
            }
            let target_info = require_target(shells, uid, attr, &def)?;
            let storage = RelationStorage::JoinTable(build_join_table(
                &owner_info,
                attr,
                &target_info,
                def.kind,
                def.inversed_by.as_deref(),
            ));
            finish_owner(shells, uid, attr, &def, &owner_info, &target_info, storage)?;
        }
        RelationKind::MorphOne | RelationKind::MorphMany => {
            let target_info = require_target(shells, uid, attr, &def)?;
            let morph_by = def.morph_by.clone().ok_or_else(|| ConfigError::MissingMorphBy {
                model: uid.to_string(),
                attribute: attr.to_string(),
            })?;
            match shells[&target_info.uid].attr(&morph_by) {
                Some(ShellAttr::Relation { def: owner_def, .. })
                    if matches!(
                        owner_def.kind,
                        RelationKind::MorphToOne | RelationKind::MorphToMany
                    ) => {}
                Some(_) | None => {
                    return Err(ConfigError::InvalidMorphOwner {
                        model: uid.to_string(),
                        attribute: attr.to_string(),
                        target: target_info.uid,
                        morph_by,
                    });
                }
            }
            // Storage lives on the polymorphic owner.
            set_meta(
                shells,
                uid,
                attr,
                RelationMeta {
                    kind: def.kind,
                    target: def.target.clone(),
                    inversed_by: None,
                    mapped_by: None,
                    morph_by: Some(morph_by),
                    owner: false,
                    storage: RelationStorage::None,
                },
            );
        }
        RelationKind::MorphToOne => {
            set_meta(
                shells,
                uid,
                attr,
                RelationMeta {
                    kind: def.kind,
                    target: None,
                    inversed_by: None,
                    mapped_by: None,
                    morph_by: None,
                    owner: true,
                    storage: RelationStorage::MorphColumn(MorphColumn {
                        id_column: "target_id".to_string(),
                        type_column: "target_type".to_string(),
                    }),
                },
            );
        }
        RelationKind::MorphToMany => {
            set_meta(
                shells,
                uid,
                attr,
                RelationMeta {
                    kind: def.kind,
                    target: None,
                    inversed_by: None,
                    mapped_by: None,
                    morph_by: None,
                    owner: true,
                    storage: RelationStorage::MorphJoinTable(MorphJoinTable {
                        name: naming::morph_table_name(&owner_info.table_name),
                        join_column: JoinColumn {
                            name: "entity_id".to_string(),
                            referenced_column: ID_COLUMN.to_string(),
                            referenced_table: owner_info.table_name.clone(),
                        },
                        morph_column: MorphColumn {
                            id_column: "morph_id".to_string(),
                            type_column: "morph_type".to_string(),
                        },
                        field_column: "field".to_string(),
                        order_column: "order".to_string(),
                    }),
                },
            );
        }
    }

    debug!(model = %uid, attribute = %attr, kind = %def.kind, "compiled relation");
    Ok(())
}

/// Resolve and validate the target model of a relation.
fn require_target(
    shells: &BTreeMap<String, Shell>,
    uid: &str,
    attr: &str,
    def: &RelationDef,
) -> Result<SideInfo, ConfigError> {
    let target = def.target.clone().unwrap_or_default();
    side_info(shells, &target).ok_or_else(|| ConfigError::UnknownTarget {
        model: uid.to_string(),
        attribute: attr.to_string(),
        target,
    })
}

/// Validate the mapped (non-owning) side of a bidirectional relation.
///
/// The storage descriptor itself is written when the owning side compiles.
fn validate_mapped_side(
    shells: &BTreeMap<String, Shell>,
    uid: &str,
    attr: &str,
    def: &RelationDef,
) -> Result<(), ConfigError> {
    let target_info = require_target(shells, uid, attr, def)?;
    let mapped = def.mapped_by.clone().unwrap_or_default();
    let expected = def
        .kind
        .expected_inverse()
        .map(|k| k.as_str().to_string())
        .unwrap_or_default();

    match shells[&target_info.uid].attr(&mapped) {
        None => Err(ConfigError::MissingInverse {
            model: uid.to_string(),
            attribute: attr.to_string(),
            target: target_info.uid,
            inverse: mapped,
        }),
        Some(ShellAttr::Relation { def: owner_def, .. }) => {
            if Some(owner_def.kind) != def.kind.expected_inverse() {
                return Err(ConfigError::IncompatibleInverse {
                    model: uid.to_string(),
                    attribute: attr.to_string(),
                    target: target_info.uid,
                    inverse: mapped,
                    expected,
                });
            }
            Ok(())
        }
        Some(ShellAttr::Scalar(_)) => Err(ConfigError::IncompatibleInverse {
            model: uid.to_string(),
            attribute: attr.to_string(),
            target: target_info.uid,
            inverse: mapped,
            expected,
        }),
    }
}

/// Write the owning descriptor and, for bidirectional relations, mirror it
/// onto the inverse attribute.
fn finish_owner(
    shells: &mut BTreeMap<String, Shell>,
    uid: &str,
    attr: &str,
    def: &RelationDef,
    owner_info: &SideInfo,
    target_info: &SideInfo,
    storage: RelationStorage,
) -> Result<(), ConfigError> {
    if let Some(inverse) = def.inversed_by.as_deref() {
        let expected_kind = def.kind.expected_inverse().expect("bidirectional kind");
        match shells[&target_info.uid].attr(inverse) {
            None => {
                return Err(ConfigError::MissingInverse {
                    model: uid.to_string(),
                    attribute: attr.to_string(),
                    target: target_info.uid.clone(),
                    inverse: inverse.to_string(),
                });
            }
            Some(ShellAttr::Relation { def: inv_def, .. }) => {
                if inv_def.kind != expected_kind || inv_def.mapped_by.as_deref() != Some(attr) {
                    return Err(ConfigError::IncompatibleInverse {
                        model: uid.to_string(),
                        attribute: attr.to_string(),
                        target: target_info.uid.clone(),
                        inverse: inverse.to_string(),
                        expected: expected_kind.as_str().to_string(),
                    });
                }
            }
            Some(ShellAttr::Scalar(_)) => {
                return Err(ConfigError::IncompatibleInverse {
                    model: uid.to_string(),
                    attribute: attr.to_string(),
                    target: target_info.uid.clone(),
                    inverse: inverse.to_string(),
                    expected: expected_kind.as_str().to_string(),
                });
            }
        }

        let mirrored = match &storage {
            RelationStorage::JoinColumn(jc) => {
                RelationStorage::JoinColumn(jc.mirrored(&owner_info.table_name))
            }
            RelationStorage::JoinTable(jt) => RelationStorage::JoinTable(jt.mirrored()),
            other => other.clone(),
        };
        set_meta(
            shells,
            &target_info.uid,
            inverse,
            RelationMeta {
                kind: expected_kind,
                target: Some(uid.to_string()),
                inversed_by: None,
                mapped_by: Some(attr.to_string()),
                morph_by: None,
                owner: false,
                storage: mirrored,
            },
        );
    }

    set_meta(
        shells,
        uid,
        attr,
        RelationMeta {
            kind: def.kind,
            target: Some(target_info.uid.clone()),
            inversed_by: def.inversed_by.clone(),
            mapped_by: None,
            morph_by: None,
            owner: true,
            storage,
        },
    );
    Ok(())
}

/// Pivot descriptor for a declared relation, named from the owning side.
fn build_join_table(
    owner: &SideInfo,
    attr: &str,
    target: &SideInfo,
    kind: RelationKind,
    inversed_by: Option<&str>,
) -> JoinTable {
    let self_referencing = owner.uid == target.uid;

    let join_column = JoinColumn {
        name: naming::pivot_column_name(&owner.singular_name),
        referenced_column: ID_COLUMN.to_string(),
        referenced_table: owner.table_name.clone(),
    };

    let mut inverse_name = naming::pivot_column_name(&target.singular_name);
    if self_referencing {
        inverse_name = format!("{}{}", naming::INVERSE_PREFIX, inverse_name);
    }
    let inverse_join_column = JoinColumn {
        name: inverse_name,
        referenced_column: ID_COLUMN.to_string(),
        referenced_table: target.table_name.clone(),
    };

    // Order of targets within one owner's list; only the many side is ordered.
    let order_column = kind
        .is_many()
        .then(|| naming::order_column_name(&target.singular_name));

    let inverse_order_column = match kind {
        RelationKind::ManyToMany => {
            let name = naming::order_column_name(&owner.singular_name);
            Some(if self_referencing {
                format!("{}{}", naming::INVERSE_PREFIX, name)
            } else {
                name
            })
        }
        RelationKind::ManyToOne if inversed_by.is_some() => {
            Some(naming::order_column_name(&owner.singular_name))
        }
        _ => None,
    };

    let pivot_columns = vec![join_column.name.clone(), inverse_join_column.name.clone()];

    JoinTable {
        name: naming::join_table_name(&owner.table_name, attr),
        join_column,
        inverse_join_column,
        order_column,
        inverse_order_column,
        on: Vec::new(),
        pivot_columns,
    }
}

/// Pivot descriptor for a rewritten component embed. All component
/// attributes of one model share the same pivot, discriminated by the
/// `component_type` and `field` constraint columns.
fn component_join_table(
    owner: &SideInfo,
    attr: &str,
    component: &SideInfo,
    repeatable: bool,
) -> JoinTable {
    let join_column = JoinColumn {
        name: "entity_id".to_string(),
        referenced_column: ID_COLUMN.to_string(),
        referenced_table: owner.table_name.clone(),
    };
    let inverse_join_column = JoinColumn {
        name: "cmp_id".to_string(),
        referenced_column: ID_COLUMN.to_string(),
        referenced_table: component.table_name.clone(),
    };
    let pivot_columns = vec![join_column.name.clone(), inverse_join_column.name.clone()];

    JoinTable {
        name: naming::component_table_name(&owner.table_name),
        join_column,
        inverse_join_column,
        order_column: repeatable.then(|| "order".to_string()),
        inverse_order_column: None,
        on: vec![
            ("component_type".to_string(), component.uid.clone()),
            ("field".to_string(), attr.to_string()),
        ],
        pivot_columns,
    }
}
