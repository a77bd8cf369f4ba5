//! Populate engine: hydrates relation attributes on already-fetched rows.
//!
//! Every populated attribute issues one batched secondary query keyed by
//! the distinct referenced values across all parent rows, never one query
//! per row. An empty referenced-value set issues zero queries and fills the
//! kind-appropriate empty value (`null`, `[]`, `{count: 0}`).
//!
//! Sub-queries propagate `fields`, `filters`, `sort`, `populate` and
//! `count` only. `limit`/`offset` are deliberately dropped: honoring them
//! per parent would force one query per row, which this engine refuses to
//! do. This is a documented limitation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use futures::future::BoxFuture;
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use crate::driver::{SqlExecutor, Statement};
use crate::error::{Error, QueryError};
use crate::schema::{
    Attribute, JoinColumn, JoinTable, ModelMeta, OrderDirection, Registry, RelationKind,
    RelationMeta, RelationStorage, ID_COLUMN,
};
use crate::value::{Record, Row, SqlValue};

use super::builder::QueryBuilder;
use super::join::Join;
use super::sql::SqlExpr;

/// Per-attribute populate parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulateParams {
    /// Scalar attributes to project on hydrated records.
    pub fields: Option<Vec<String>>,
    /// Criteria applied to hydrated records.
    pub filters: Option<JsonValue>,
    /// Order specs applied to hydrated records.
    pub sort: Vec<String>,
    /// Nested populate tree for hydrated records.
    pub populate: Option<PopulateSpec>,
    /// Attach `{count: N}` instead of hydrating rows.
    pub count: bool,
}

/// A validated populate tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PopulateSpec {
    /// Populated attributes, in request order.
    pub entries: Vec<(String, PopulateParams)>,
}

impl PopulateSpec {
    /// Populate every direct relation of `model` with default parameters.
    pub fn all(model: &ModelMeta) -> Self {
        Self {
            entries: model
                .relations()
                .map(|(name, _)| (name.to_string(), PopulateParams::default()))
                .collect(),
        }
    }

    /// Parse and validate a declarative populate spec: `true` (all direct
    /// relations), an array of dot-path strings, or a nested object.
    pub fn parse(
        registry: &Registry,
        model: &ModelMeta,
        value: &JsonValue,
    ) -> Result<Self, QueryError> {
        match value {
            JsonValue::Bool(true) => Ok(Self::all(model)),
            JsonValue::Bool(false) => Ok(Self::default()),
            JsonValue::Array(paths) => {
                let mut spec = Self::default();
                for path in paths {
                    let path = path.as_str().ok_or(QueryError::InvalidOperand {
                        op: "populate".into(),
                        expected: "an array of dot-path strings",
                    })?;
                    insert_path(registry, model, &mut spec, path)?;
                }
                Ok(spec)
            }
            JsonValue::Object(map) => {
                let mut spec = Self::default();
                for (key, entry) in map {
                    let relation = validate_relation(model, key)?;
                    let params = match entry {
                        JsonValue::Bool(true) => PopulateParams::default(),
                        JsonValue::Bool(false) => continue,
                        JsonValue::Object(obj) => parse_params(registry, relation, obj)?,
                        _ => {
                            return Err(QueryError::InvalidOperand {
                                op: "populate".into(),
                                expected: "`true`, `false`, or a parameter object per attribute",
                            })
                        }
                    };
                    spec.entries.push((key.clone(), params));
                }
                Ok(spec)
            }
            _ => Err(QueryError::InvalidOperand {
                op: "populate".into(),
                expected: "a boolean, an array of paths, or an object",
            }),
        }
    }

    fn entry_mut(&mut self, attribute: &str) -> &mut PopulateParams {
        if let Some(index) = self.entries.iter().position(|(name, _)| name == attribute) {
            &mut self.entries[index].1
        } else {
            self.entries
                .push((attribute.to_string(), PopulateParams::default()));
            &mut self
                .entries
                .last_mut()
                .expect("entry just pushed")
                .1
        }
    }
}

fn validate_relation<'m>(
    model: &'m ModelMeta,
    attribute: &str,
) -> Result<&'m RelationMeta, QueryError> {
    match model.attribute(attribute) {
        Some(Attribute::Relation(relation)) => Ok(relation),
        Some(Attribute::Scalar(_)) => Err(QueryError::NotPopulatable {
            model: model.uid.clone(),
            attribute: attribute.to_string(),
        }),
        None => Err(QueryError::UnknownAttribute {
            model: model.uid.clone(),
            attribute: attribute.to_string(),
        }),
    }
}

fn insert_path(
    registry: &Registry,
    model: &ModelMeta,
    spec: &mut PopulateSpec,
    path: &str,
) -> Result<(), QueryError> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let relation = validate_relation(model, head)?;

    if let Some(rest) = rest {
        let target = relation
            .target
            .as_deref()
            .ok_or(QueryError::InvalidOperand {
                op: "populate".into(),
                expected: "no nested populate beneath a polymorphic owner",
            })?;
        let target_model = registry.model(target)?;
        let nested = spec
            .entry_mut(head)
            .populate
            .get_or_insert_with(PopulateSpec::default);
        // Re-borrow: the nested spec belongs to the head entry.
        insert_path(registry, target_model, nested, rest)?;
    } else {
        spec.entry_mut(head);
    }
    Ok(())
}

fn parse_params(
    registry: &Registry,
    relation: &RelationMeta,
    obj: &Map<String, JsonValue>,
) -> Result<PopulateParams, QueryError> {
    let mut params = PopulateParams::default();

    if let Some(fields) = obj.get("fields") {
        let items = fields.as_array().ok_or(QueryError::InvalidOperand {
            op: "fields".into(),
            expected: "an array of attribute names",
        })?;
        params.fields = Some(
            items
                .iter()
                .filter_map(|f| f.as_str().map(str::to_string))
                .collect(),
        );
    }
    if let Some(filters) = obj.get("filters") {
        params.filters = Some(filters.clone());
    }
    if let Some(sort) = obj.get("sort") {
        params.sort = match sort {
            JsonValue::String(s) => vec![s.clone()],
            JsonValue::Array(items) => items
                .iter()
                .filter_map(|s| s.as_str().map(str::to_string))
                .collect(),
            _ => {
                return Err(QueryError::InvalidOperand {
                    op: "sort".into(),
                    expected: "a string or an array of strings",
                })
            }
        };
    }
    if let Some(nested) = obj.get("populate") {
        let target = relation
            .target
            .as_deref()
            .ok_or(QueryError::InvalidOperand {
                op: "populate".into(),
                expected: "no nested populate beneath a polymorphic owner",
            })?;
        let target_model = registry.model(target)?;
        params.populate = Some(PopulateSpec::parse(registry, target_model, nested)?);
    }
    if let Some(count) = obj.get("count") {
        params.count = count.as_bool().unwrap_or(false);
    }
    // `limit`/`offset` keys are dropped here on purpose; see module docs.
    Ok(params)
}

/// Hydrate `records` of model `uid` according to `spec`.
pub(crate) fn apply<'a, E: SqlExecutor>(
    registry: &'a Registry,
    uid: &'a str,
    records: &'a mut [Record],
    spec: &'a PopulateSpec,
    exec: &'a E,
) -> BoxFuture<'a, Result<(), Error>> {
    Box::pin(async move {
        if records.is_empty() {
            return Ok(());
        }
        let model = registry.model(uid)?;

        for (attribute, params) in &spec.entries {
            let relation = validate_relation(model, attribute)?;
            debug!(model = %uid, attribute = %attribute, kind = %relation.kind, "populating relation");
            match relation.kind {
                RelationKind::OneToOne
                | RelationKind::OneToMany
                | RelationKind::ManyToOne
                | RelationKind::ManyToMany => match &relation.storage {
                    RelationStorage::JoinColumn(jc) => {
                        populate_join_column(
                            registry, model, attribute, relation, jc, params, records, exec,
                        )
                        .await?;
                    }
                    RelationStorage::JoinTable(jt) => {
                        populate_join_table(
                            registry, model, attribute, relation, jt, params, records, exec,
                        )
                        .await?;
                    }
                    // The compiler assigns exactly one of the two shapes to
                    // these kinds.
                    _ => fill_empty(records, attribute, relation, params.count),
                },
                RelationKind::MorphOne | RelationKind::MorphMany => {
                    populate_morph_backref(
                        registry, model, attribute, relation, params, records, exec,
                    )
                    .await?;
                }
                RelationKind::MorphToOne => {
                    populate_morph_to_one(registry, attribute, relation, params, records, exec)
                        .await?;
                }
                RelationKind::MorphToMany => {
                    populate_morph_to_many(registry, attribute, relation, params, records, exec)
                        .await?;
                }
            }
        }
        Ok(())
    })
}

fn as_i64(value: &JsonValue) -> Option<i64> {
    value.as_i64()
}

/// Distinct non-null integer values of `column` across all records, sorted
/// for deterministic statements.
fn distinct_keys(records: &[Record], column: &str) -> Vec<i64> {
    let set: BTreeSet<i64> = records
        .iter()
        .filter_map(|r| r.get(column).and_then(as_i64))
        .collect();
    set.into_iter().collect()
}

fn int_params(keys: &[i64]) -> Vec<SqlValue> {
    keys.iter().copied().map(SqlValue::Int).collect()
}

/// Kind-appropriate empty value for an unmatched parent.
fn empty_value(relation: &RelationMeta, count: bool) -> JsonValue {
    if count && !relation.is_single() {
        json!({ "count": 0 })
    } else if relation.is_single() {
        JsonValue::Null
    } else {
        json!([])
    }
}

fn fill_empty(records: &mut [Record], attribute: &str, relation: &RelationMeta, count: bool) {
    for record in records.iter_mut() {
        record.insert(attribute.to_string(), empty_value(relation, count));
    }
}

fn apply_params<'r>(
    mut qb: QueryBuilder<'r>,
    params: &PopulateParams,
) -> Result<QueryBuilder<'r>, Error> {
    if let Some(fields) = &params.fields {
        let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
        qb = qb.fields(&refs)?;
    }
    if let Some(filters) = &params.filters {
        qb = qb.filter(filters)?;
    }
    for spec in &params.sort {
        qb = qb.order_by(spec)?;
    }
    qb.set_populate(params.populate.clone());
    Ok(qb)
}

/// Attach grouped children onto their parents, cloning where a child serves
/// several parents.
fn attach_groups(
    records: &mut [Record],
    attribute: &str,
    relation: &RelationMeta,
    key_column: &str,
    groups: HashMap<i64, Vec<Record>>,
) {
    for record in records.iter_mut() {
        let key = record.get(key_column).and_then(as_i64);
        let value = match key.and_then(|key| groups.get(&key)) {
            // Children are cloned per parent; several parents may share the
            // same referenced value.
            Some(children) if relation.is_single() => children
                .first()
                .cloned()
                .map(JsonValue::Object)
                .unwrap_or(JsonValue::Null),
            Some(children) => {
                JsonValue::Array(children.iter().cloned().map(JsonValue::Object).collect())
            }
            None => empty_value(relation, false),
        };
        record.insert(attribute.to_string(), value);
    }
}

/// Hydration through a foreign-key column. The same code serves the owning
/// side (key on the parent's own row) and the mirrored inverse side (key on
/// the target's row), because the mirrored descriptor swaps the column
/// roles.
#[allow(clippy::too_many_arguments)]
async fn populate_join_column<E: SqlExecutor>(
    registry: &Registry,
    _model: &ModelMeta,
    attribute: &str,
    relation: &RelationMeta,
    jc: &JoinColumn,
    params: &PopulateParams,
    records: &mut [Record],
    exec: &E,
) -> Result<(), Error> {
    let keys = distinct_keys(records, &jc.name);
    if keys.is_empty() {
        fill_empty(records, attribute, relation, params.count);
        return Ok(());
    }
    let target_uid = relation.target.as_deref().unwrap_or_default();

    if params.count && !relation.is_single() {
        let mut qb = QueryBuilder::select(registry, target_uid)?;
        let alias = qb.alias().to_string();
        qb.select_only_raw();
        qb.raw_select(format!("{alias}.{} AS __parent", jc.referenced_column));
        qb.raw_select("COUNT(*) AS __count");
        qb.where_in_column(&jc.referenced_column, int_params(&keys));
        qb.group_by(format!("{alias}.{}", jc.referenced_column));
        let rows = exec.query(qb.build()?).await?;
        attach_counts(records, attribute, &jc.name, &rows);
        return Ok(());
    }

    let mut qb = QueryBuilder::select(registry, target_uid)?;
    qb = apply_params(qb, params)?;
    qb.ensure_column(&jc.referenced_column);
    qb.where_in_column(&jc.referenced_column, int_params(&keys));
    let children = qb.fetch_all(exec).await?;

    let mut groups: HashMap<i64, Vec<Record>> = HashMap::new();
    for child in children {
        if let Some(key) = child.get(&jc.referenced_column).and_then(as_i64) {
            groups.entry(key).or_default().push(child);
        }
    }
    attach_groups(records, attribute, relation, &jc.name, groups);
    Ok(())
}

/// Hydration through a pivot table, owner or mirrored inverse side alike.
#[allow(clippy::too_many_arguments)]
async fn populate_join_table<E: SqlExecutor>(
    registry: &Registry,
    _model: &ModelMeta,
    attribute: &str,
    relation: &RelationMeta,
    jt: &JoinTable,
    params: &PopulateParams,
    records: &mut [Record],
    exec: &E,
) -> Result<(), Error> {
    let keys = distinct_keys(records, ID_COLUMN);
    if keys.is_empty() {
        fill_empty(records, attribute, relation, params.count);
        return Ok(());
    }

    if params.count && !relation.is_single() {
        let mut sql = format!(
            "SELECT {jc} AS __parent, COUNT(*) AS __count FROM {table} WHERE ",
            jc = jt.join_column.name,
            table = jt.name
        );
        let mut params_out = Vec::new();
        let mut conditions = vec![SqlExpr::is_in(jt.join_column.name.clone(), int_params(&keys))];
        for (column, value) in &jt.on {
            conditions.push(SqlExpr::eq(column.clone(), value.as_str()));
        }
        SqlExpr::And(conditions).render(&mut sql, &mut params_out);
        sql.push_str(&format!(" GROUP BY {}", jt.join_column.name));
        let rows = exec.query(Statement::new(sql, params_out)).await?;
        attach_counts(records, attribute, ID_COLUMN, &rows);
        return Ok(());
    }

    let target_uid = relation.target.as_deref().unwrap_or_default();
    let mut qb = QueryBuilder::select(registry, target_uid)?;
    qb = apply_params(qb, params)?;

    let root = qb.alias().to_string();
    let pivot = qb.next_alias();
    qb.add_join(Join {
        table: jt.name.clone(),
        alias: pivot.clone(),
        on: vec![(
            format!("{pivot}.{}", jt.inverse_join_column.name),
            format!("{root}.{}", jt.inverse_join_column.referenced_column),
        )],
        extra: jt
            .on
            .iter()
            .map(|(column, value)| (format!("{pivot}.{column}"), SqlValue::Text(value.clone())))
            .collect(),
    });
    qb.raw_select(format!("{pivot}.{} AS __parent", jt.join_column.name));
    qb.push_where(SqlExpr::is_in(
        format!("{pivot}.{}", jt.join_column.name),
        int_params(&keys),
    ));
    if let Some(order) = &jt.order_column {
        qb.order_raw(format!("{pivot}.{order}"), OrderDirection::Asc);
    }

    let children = qb.fetch_all(exec).await?;
    let mut groups: HashMap<i64, Vec<Record>> = HashMap::new();
    for mut child in children {
        let parent = child.remove("__parent").as_ref().and_then(as_i64);
        if let Some(parent) = parent {
            groups.entry(parent).or_default().push(child);
        }
    }
    attach_groups(records, attribute, relation, ID_COLUMN, groups);
    Ok(())
}

fn attach_counts(records: &mut [Record], attribute: &str, key_column: &str, rows: &[Row]) {
    let mut counts: HashMap<i64, i64> = HashMap::new();
    for row in rows {
        let parent = crate::value::row_get(row, "__parent").and_then(SqlValue::as_int);
        let count = crate::value::row_get(row, "__count").and_then(SqlValue::as_int);
        if let (Some(parent), Some(count)) = (parent, count) {
            counts.insert(parent, count);
        }
    }
    for record in records.iter_mut() {
        let count = record
            .get(key_column)
            .and_then(as_i64)
            .and_then(|key| counts.get(&key).copied())
            .unwrap_or(0);
        record.insert(attribute.to_string(), json!({ "count": count }));
    }
}

/// Hydration of a morph-one/morph-many back reference: dispatch on how the
/// target's owning attribute stores the association.
async fn populate_morph_backref<E: SqlExecutor>(
    registry: &Registry,
    model: &ModelMeta,
    attribute: &str,
    relation: &RelationMeta,
    params: &PopulateParams,
    records: &mut [Record],
    exec: &E,
) -> Result<(), Error> {
    let target_uid = relation.target.as_deref().unwrap_or_default();
    let target_model = registry.model(target_uid)?;
    let morph_by = relation.morph_by.as_deref().unwrap_or_default();
    let owner_rel =
        target_model
            .relation(morph_by)
            .ok_or_else(|| QueryError::UnknownAttribute {
                model: target_model.uid.clone(),
                attribute: morph_by.to_string(),
            })?;

    let keys = distinct_keys(records, ID_COLUMN);
    if keys.is_empty() {
        fill_empty(records, attribute, relation, false);
        return Ok(());
    }

    match &owner_rel.storage {
        RelationStorage::MorphColumn(mc) => {
            let mut qb = QueryBuilder::select(registry, target_uid)?;
            qb = apply_params(qb, params)?;
            qb.ensure_column(&mc.id_column);
            qb.where_eq_column(&mc.type_column, SqlValue::Text(model.uid.clone()));
            qb.where_in_column(&mc.id_column, int_params(&keys));
            let children = qb.fetch_all(exec).await?;

            let mut groups: HashMap<i64, Vec<Record>> = HashMap::new();
            for child in children {
                if let Some(key) = child.get(&mc.id_column).and_then(as_i64) {
                    groups.entry(key).or_default().push(child);
                }
            }
            attach_groups(records, attribute, relation, ID_COLUMN, groups);
        }
        RelationStorage::MorphJoinTable(mt) => {
            let mut qb = QueryBuilder::select(registry, target_uid)?;
            qb = apply_params(qb, params)?;
            let root = qb.alias().to_string();
            let pivot = qb.next_alias();
            qb.add_join(Join {
                table: mt.name.clone(),
                alias: pivot.clone(),
                on: vec![(
                    format!("{pivot}.{}", mt.join_column.name),
                    format!("{root}.{}", mt.join_column.referenced_column),
                )],
                extra: vec![
                    (
                        format!("{pivot}.{}", mt.morph_column.type_column),
                        SqlValue::Text(model.uid.clone()),
                    ),
                    (
                        format!("{pivot}.{}", mt.field_column),
                        SqlValue::Text(morph_by.to_string()),
                    ),
                ],
            });
            qb.raw_select(format!(
                "{pivot}.{} AS __parent",
                mt.morph_column.id_column
            ));
            qb.push_where(SqlExpr::is_in(
                format!("{pivot}.{}", mt.morph_column.id_column),
                int_params(&keys),
            ));
            qb.order_raw(format!("{pivot}.{}", mt.order_column), OrderDirection::Asc);

            let children = qb.fetch_all(exec).await?;
            let mut groups: HashMap<i64, Vec<Record>> = HashMap::new();
            for mut child in children {
                let parent = child.remove("__parent").as_ref().and_then(as_i64);
                if let Some(parent) = parent {
                    groups.entry(parent).or_default().push(child);
                }
            }
            attach_groups(records, attribute, relation, ID_COLUMN, groups);
        }
        _ => fill_empty(records, attribute, relation, false),
    }
    Ok(())
}

/// Hydrate the targets of a set of `(type, id)` pairs, one query per
/// distinct type, stitching the synthetic `__type` discriminator onto each
/// record. Unknown type uids are skipped.
async fn hydrate_by_type<E: SqlExecutor>(
    registry: &Registry,
    by_type: BTreeMap<String, BTreeSet<i64>>,
    params: &PopulateParams,
    exec: &E,
) -> Result<HashMap<(String, i64), Record>, Error> {
    let mut cache = HashMap::new();
    for (type_uid, ids) in by_type {
        if registry.get(&type_uid).is_none() {
            continue;
        }
        let keys: Vec<i64> = ids.into_iter().collect();
        let mut qb = QueryBuilder::select(registry, &type_uid)?;
        qb = apply_params(qb, params)?;
        qb.where_in_column(ID_COLUMN, int_params(&keys));
        for mut child in qb.fetch_all(exec).await? {
            let id = child.get(ID_COLUMN).and_then(as_i64);
            child.insert("__type".to_string(), JsonValue::String(type_uid.clone()));
            if let Some(id) = id {
                cache.insert((type_uid.clone(), id), child);
            }
        }
    }
    Ok(cache)
}

/// Hydration of a morph-to-one owner from its discriminator columns.
async fn populate_morph_to_one<E: SqlExecutor>(
    registry: &Registry,
    attribute: &str,
    relation: &RelationMeta,
    params: &PopulateParams,
    records: &mut [Record],
    exec: &E,
) -> Result<(), Error> {
    let mc = match relation.morph_column() {
        Some(mc) => mc,
        None => {
            fill_empty(records, attribute, relation, false);
            return Ok(());
        }
    };

    let mut by_type: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
    for record in records.iter() {
        let type_uid = record.get(&mc.type_column).and_then(JsonValue::as_str);
        let id = record.get(&mc.id_column).and_then(as_i64);
        if let (Some(type_uid), Some(id)) = (type_uid, id) {
            by_type.entry(type_uid.to_string()).or_default().insert(id);
        }
    }
    if by_type.is_empty() {
        fill_empty(records, attribute, relation, false);
        return Ok(());
    }

    let cache = hydrate_by_type(registry, by_type, params, exec).await?;
    for record in records.iter_mut() {
        let key = match (
            record.get(&mc.type_column).and_then(JsonValue::as_str),
            record.get(&mc.id_column).and_then(as_i64),
        ) {
            (Some(type_uid), Some(id)) => Some((type_uid.to_string(), id)),
            _ => None,
        };
        let value = key
            .and_then(|key| cache.get(&key).cloned())
            .map(JsonValue::Object)
            .unwrap_or(JsonValue::Null);
        record.insert(attribute.to_string(), value);
    }
    Ok(())
}

/// Hydration of a morph-to-many owner from its shared pivot table.
async fn populate_morph_to_many<E: SqlExecutor>(
    registry: &Registry,
    attribute: &str,
    relation: &RelationMeta,
    params: &PopulateParams,
    records: &mut [Record],
    exec: &E,
) -> Result<(), Error> {
    let mt = match relation.morph_join_table() {
        Some(mt) => mt,
        None => {
            fill_empty(records, attribute, relation, params.count);
            return Ok(());
        }
    };

    let keys = distinct_keys(records, ID_COLUMN);
    if keys.is_empty() {
        fill_empty(records, attribute, relation, params.count);
        return Ok(());
    }

    if params.count {
        let mut sql = format!(
            "SELECT {jc} AS __parent, COUNT(*) AS __count FROM {table} WHERE ",
            jc = mt.join_column.name,
            table = mt.name
        );
        let mut params_out = Vec::new();
        SqlExpr::And(vec![
            SqlExpr::eq(mt.field_column.clone(), attribute),
            SqlExpr::is_in(mt.join_column.name.clone(), int_params(&keys)),
        ])
        .render(&mut sql, &mut params_out);
        sql.push_str(&format!(" GROUP BY {}", mt.join_column.name));
        let rows = exec.query(Statement::new(sql, params_out)).await?;
        attach_counts(records, attribute, ID_COLUMN, &rows);
        return Ok(());
    }

    // One pivot scan for all parents, ordered per owner.
    let mut sql = format!(
        "SELECT {jc}, {mid}, {mtype} FROM {table} WHERE ",
        jc = mt.join_column.name,
        mid = mt.morph_column.id_column,
        mtype = mt.morph_column.type_column,
        table = mt.name
    );
    let mut params_out = Vec::new();
    SqlExpr::And(vec![
        SqlExpr::eq(mt.field_column.clone(), attribute),
        SqlExpr::is_in(mt.join_column.name.clone(), int_params(&keys)),
    ])
    .render(&mut sql, &mut params_out);
    sql.push_str(&format!(
        " ORDER BY {jc} ASC, {order} ASC",
        jc = mt.join_column.name,
        order = mt.order_column
    ));
    let pivot_rows = exec.query(Statement::new(sql, params_out)).await?;

    let mut links: Vec<(i64, String, i64)> = Vec::with_capacity(pivot_rows.len());
    let mut by_type: BTreeMap<String, BTreeSet<i64>> = BTreeMap::new();
    for row in &pivot_rows {
        let parent = crate::value::row_get(row, &mt.join_column.name).and_then(SqlValue::as_int);
        let id = crate::value::row_get(row, &mt.morph_column.id_column).and_then(SqlValue::as_int);
        let type_uid = crate::value::row_get(row, &mt.morph_column.type_column)
            .and_then(SqlValue::as_text)
            .map(str::to_string);
        if let (Some(parent), Some(id), Some(type_uid)) = (parent, id, type_uid) {
            by_type.entry(type_uid.clone()).or_default().insert(id);
            links.push((parent, type_uid, id));
        }
    }

    let cache = hydrate_by_type(registry, by_type, params, exec).await?;
    for record in records.iter_mut() {
        let parent = record.get(ID_COLUMN).and_then(as_i64);
        let mut values = Vec::new();
        if let Some(parent) = parent {
            for (link_parent, type_uid, id) in &links {
                if *link_parent == parent {
                    if let Some(child) = cache.get(&(type_uid.clone(), *id)) {
                        values.push(JsonValue::Object(child.clone()));
                    }
                }
            }
        }
        record.insert(attribute.to_string(), JsonValue::Array(values));
    }
    Ok(())
}
