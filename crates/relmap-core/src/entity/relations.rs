//! Relation write orchestration.
//!
//! For every relation attribute in a write payload the manager computes the
//! minimal write/delete set to reach the desired state, expressed as `set`
//! (replace all), `connect`/`disconnect` (partial), or a single-value
//! shorthand. None of the multi-statement sequences here open a
//! transaction; the caller decides the scope, and a partial failure without
//! one leaves relational state inconsistent.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::driver::{SqlDriver, SqlExecutor, Statement};
use crate::error::{Error, QueryError};
use crate::query::sql::SqlExpr;
use crate::schema::{
    JoinColumn, JoinTable, ModelMeta, MorphJoinTable, Registry, RelationKind, RelationMeta,
    RelationStorage, ID_COLUMN,
};
use crate::tx::Conn;
use crate::value::{row_get, SqlValue};

use super::ordering::{batched_delete, resequence};

/// A reference to a related record in a write payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EntityRef {
    /// Target record id.
    pub id: i64,
    /// Target model uid; required for polymorphic owners, ignored elsewhere.
    pub type_uid: Option<String>,
}

/// The desired-state change for one relation attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RelationMutation {
    /// Replace all associations with the given set.
    Set(Vec<EntityRef>),
    /// Partial change: add and/or remove associations.
    Patch {
        connect: Vec<EntityRef>,
        disconnect: Vec<EntityRef>,
    },
}

impl RelationMutation {
    /// Parse the declarative value of a relation attribute: `null`, an id,
    /// an id array, a `{id, __type}` object, or a
    /// `{set|connect|disconnect}` object.
    pub(crate) fn parse(
        model: &ModelMeta,
        attribute: &str,
        value: &JsonValue,
    ) -> Result<Self, Error> {
        match value {
            JsonValue::Null => Ok(RelationMutation::Set(Vec::new())),
            JsonValue::Number(_) => Ok(RelationMutation::Set(vec![parse_ref(
                model, attribute, value,
            )?])),
            JsonValue::Array(items) => Ok(RelationMutation::Set(parse_refs(
                model, attribute, items,
            )?)),
            JsonValue::Object(map) => {
                if map.contains_key("set") || map.contains_key("connect")
                    || map.contains_key("disconnect")
                {
                    if let Some(set) = map.get("set") {
                        let items = as_ref_list(model, attribute, set)?;
                        return Ok(RelationMutation::Set(items));
                    }
                    let connect = match map.get("connect") {
                        Some(value) => as_ref_list(model, attribute, value)?,
                        None => Vec::new(),
                    };
                    let disconnect = match map.get("disconnect") {
                        Some(value) => as_ref_list(model, attribute, value)?,
                        None => Vec::new(),
                    };
                    Ok(RelationMutation::Patch {
                        connect,
                        disconnect,
                    })
                } else {
                    Ok(RelationMutation::Set(vec![parse_ref(
                        model, attribute, value,
                    )?]))
                }
            }
            other => Err(relation_input_error(model, attribute, other)),
        }
    }

    /// Resolve a single-valued mutation: `Some(Some(ref))` points at a new
    /// target, `Some(None)` clears the association, `None` leaves it
    /// untouched.
    pub(crate) fn resolve_single(
        &self,
        model: &ModelMeta,
        attribute: &str,
    ) -> Result<Option<Option<EntityRef>>, Error> {
        match self {
            RelationMutation::Set(refs) => match refs.as_slice() {
                [] => Ok(Some(None)),
                [only] => Ok(Some(Some(only.clone()))),
                _ => Err(Error::Validation(format!(
                    "relation `{}.{attribute}` holds a single value; got {} targets",
                    model.uid,
                    refs.len()
                ))),
            },
            RelationMutation::Patch {
                connect,
                disconnect,
            } => {
                if let Some(last) = connect.last() {
                    Ok(Some(Some(last.clone())))
                } else if !disconnect.is_empty() {
                    Ok(Some(None))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

fn relation_input_error(model: &ModelMeta, attribute: &str, got: &JsonValue) -> Error {
    Error::Validation(format!(
        "relation `{}.{attribute}` expects an id, an id array, or a set/connect/disconnect object; got `{got}`",
        model.uid
    ))
}

fn parse_ref(model: &ModelMeta, attribute: &str, value: &JsonValue) -> Result<EntityRef, Error> {
    match value {
        JsonValue::Number(_) => value
            .as_i64()
            .map(|id| EntityRef { id, type_uid: None })
            .ok_or_else(|| relation_input_error(model, attribute, value)),
        JsonValue::Object(map) => {
            let id = map
                .get("id")
                .and_then(JsonValue::as_i64)
                .ok_or_else(|| relation_input_error(model, attribute, value))?;
            let type_uid = map
                .get("__type")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            Ok(EntityRef { id, type_uid })
        }
        other => Err(relation_input_error(model, attribute, other)),
    }
}

fn parse_refs(
    model: &ModelMeta,
    attribute: &str,
    items: &[JsonValue],
) -> Result<Vec<EntityRef>, Error> {
    items
        .iter()
        .map(|item| parse_ref(model, attribute, item))
        .collect()
}

fn as_ref_list(
    model: &ModelMeta,
    attribute: &str,
    value: &JsonValue,
) -> Result<Vec<EntityRef>, Error> {
    match value {
        JsonValue::Array(items) => parse_refs(model, attribute, items),
        JsonValue::Null => Ok(Vec::new()),
        single => Ok(vec![parse_ref(model, attribute, single)?]),
    }
}

/// Distinct ids in first-occurrence order.
fn distinct_ids(refs: &[EntityRef]) -> Vec<i64> {
    let mut seen = BTreeSet::new();
    refs.iter()
        .map(|r| r.id)
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Distinct `(type, id)` pairs in first-occurrence order; every reference
/// must carry a discriminator.
fn distinct_morph_refs(
    model: &ModelMeta,
    attribute: &str,
    refs: &[EntityRef],
) -> Result<Vec<(String, i64)>, Error> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(refs.len());
    for r in refs {
        let type_uid = r.type_uid.clone().ok_or_else(|| {
            Error::Validation(format!(
                "polymorphic relation `{}.{attribute}` requires `__type` on every target",
                model.uid
            ))
        })?;
        if seen.insert((type_uid.clone(), r.id)) {
            out.push((type_uid, r.id));
        }
    }
    Ok(out)
}

fn int_params(values: &[i64]) -> Vec<SqlValue> {
    values.iter().copied().map(SqlValue::Int).collect()
}

fn scope_exprs(on: &[(String, String)]) -> Vec<SqlExpr> {
    on.iter()
        .map(|(column, value)| SqlExpr::eq(column.clone(), value.as_str()))
        .collect()
}

/// `UPDATE {table} SET ... WHERE condition`.
async fn update_where<E: SqlExecutor>(
    exec: &E,
    table: &str,
    sets: &[(&str, SqlValue)],
    condition: SqlExpr,
) -> Result<(), Error> {
    let mut sql = format!("UPDATE {table} SET ");
    let mut params = Vec::new();
    for (i, (column, value)) in sets.iter().enumerate() {
        if i > 0 {
            sql.push_str(", ");
        }
        sql.push_str(column);
        sql.push_str(" = ?");
        params.push(value.clone());
    }
    sql.push_str(" WHERE ");
    condition.render(&mut sql, &mut params);
    exec.execute(Statement::new(sql, params)).await?;
    Ok(())
}

/// `DELETE FROM {table} WHERE condition`, for deletes bounded by input size.
/// Unbounded cleanup goes through [`batched_delete`] instead.
async fn delete_where<E: SqlExecutor>(
    exec: &E,
    table: &str,
    condition: SqlExpr,
) -> Result<(), Error> {
    let mut sql = format!("DELETE FROM {table} WHERE ");
    let mut params = Vec::new();
    condition.render(&mut sql, &mut params);
    exec.execute(Statement::new(sql, params)).await?;
    Ok(())
}

async fn insert_row<E: SqlExecutor>(
    exec: &E,
    table: &str,
    columns: Vec<(String, SqlValue)>,
) -> Result<(), Error> {
    let names: Vec<&str> = columns.iter().map(|(c, _)| c.as_str()).collect();
    let marks: Vec<&str> = columns.iter().map(|_| "?").collect();
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        names.join(", "),
        marks.join(", ")
    );
    let params = columns.into_iter().map(|(_, v)| v).collect();
    exec.execute(Statement::new(sql, params)).await?;
    Ok(())
}

/// `MAX(column)` under the given conditions, `0` when no row matches.
async fn max_value<E: SqlExecutor>(
    exec: &E,
    table: &str,
    column: &str,
    conditions: Vec<SqlExpr>,
) -> Result<i64, Error> {
    let mut sql = format!("SELECT MAX({column}) AS max FROM {table} WHERE ");
    let mut params = Vec::new();
    SqlExpr::And(conditions).render(&mut sql, &mut params);
    let rows = exec.query(Statement::new(sql, params)).await?;
    Ok(rows
        .first()
        .and_then(|row| row_get(row, "max"))
        .and_then(SqlValue::as_int)
        .unwrap_or(0))
}

/// Per-key `MAX(value_column)` under the given conditions.
async fn grouped_max<E: SqlExecutor>(
    exec: &E,
    table: &str,
    key_column: &str,
    value_column: &str,
    conditions: Vec<SqlExpr>,
) -> Result<HashMap<i64, i64>, Error> {
    let mut sql = format!(
        "SELECT {key_column} AS k, MAX({value_column}) AS max FROM {table} WHERE "
    );
    let mut params = Vec::new();
    SqlExpr::And(conditions).render(&mut sql, &mut params);
    sql.push_str(&format!(" GROUP BY {key_column}"));
    let rows = exec.query(Statement::new(sql, params)).await?;
    let mut out = HashMap::new();
    for row in rows {
        let key = row_get(&row, "k").and_then(SqlValue::as_int);
        let max = row_get(&row, "max").and_then(SqlValue::as_int);
        if let (Some(key), Some(max)) = (key, max) {
            out.insert(key, max);
        }
    }
    Ok(out)
}

/// Target ids currently linked to `id` through `jt`.
async fn linked_targets<E: SqlExecutor>(
    exec: &E,
    jt: &JoinTable,
    id: i64,
) -> Result<Vec<i64>, Error> {
    let mut conditions = vec![SqlExpr::eq(jt.join_column.name.clone(), id)];
    conditions.extend(scope_exprs(&jt.on));
    let mut sql = format!(
        "SELECT {inverse} FROM {table} WHERE ",
        inverse = jt.inverse_join_column.name,
        table = jt.name
    );
    let mut params = Vec::new();
    SqlExpr::And(conditions).render(&mut sql, &mut params);
    let rows = exec.query(Statement::new(sql, params)).await?;
    Ok(rows
        .iter()
        .filter_map(|row| row_get(row, &jt.inverse_join_column.name).and_then(SqlValue::as_int))
        .collect())
}

/// Apply the deferred relation operations for entity `id` of `model`.
///
/// Relations stored on the entity's own row (owning join columns, morph
/// discriminator columns) are written with the row itself and never reach
/// this function.
pub(crate) async fn apply_relations<D: SqlDriver>(
    registry: &Registry,
    driver: &D,
    conn: Conn<'_, D>,
    model: &ModelMeta,
    id: i64,
    ops: &[(String, RelationMutation)],
) -> Result<(), Error> {
    for (attribute, mutation) in ops {
        let relation = model
            .relation(attribute)
            .ok_or_else(|| QueryError::UnknownAttribute {
                model: model.uid.clone(),
                attribute: attribute.clone(),
            })?;
        debug!(model = %model.uid, attribute = %attribute, kind = %relation.kind, "writing relation");
        match relation.kind {
            RelationKind::OneToOne
            | RelationKind::OneToMany
            | RelationKind::ManyToOne
            | RelationKind::ManyToMany => match &relation.storage {
                RelationStorage::JoinColumn(jc) => {
                    // Mirrored inverse side: the association lives in a
                    // foreign-key column on the target's table.
                    apply_mirrored_join_column(conn, relation.kind, jc, id, mutation).await?;
                }
                RelationStorage::JoinTable(jt) => {
                    apply_join_table(driver, conn, relation.kind, jt, id, mutation).await?;
                }
                _ => {}
            },
            RelationKind::MorphOne | RelationKind::MorphMany => {
                apply_morph_backref(registry, driver, conn, model, relation, id, mutation).await?;
            }
            // Discriminator columns live on the entity's own row.
            RelationKind::MorphToOne => {}
            RelationKind::MorphToMany => {
                apply_morph_join_table(registry, driver, conn, model, attribute, relation, id, mutation)
                    .await?;
            }
        }
    }
    Ok(())
}

/// Clear the previous holder of a unique foreign-key column before a new
/// row claims the value.
pub(crate) async fn evict_column_holder<E: SqlExecutor>(
    exec: &E,
    table: &str,
    column: &str,
    value: i64,
) -> Result<(), Error> {
    update_where(
        exec,
        table,
        &[(column, SqlValue::Null)],
        SqlExpr::eq(column.to_string(), value),
    )
    .await
}

/// Writes on the non-owning side of a join-column relation: updates to the
/// foreign-key column on the target's table.
async fn apply_mirrored_join_column<D: SqlDriver>(
    conn: Conn<'_, D>,
    kind: RelationKind,
    jc: &JoinColumn,
    id: i64,
    mutation: &RelationMutation,
) -> Result<(), Error> {
    let table = &jc.referenced_table;
    let fk = jc.referenced_column.as_str();
    let clear: [(&str, SqlValue); 1] = [(fk, SqlValue::Null)];
    let point: [(&str, SqlValue); 1] = [(fk, SqlValue::Int(id))];

    match mutation {
        RelationMutation::Set(refs) => {
            // Replace all: detach every current holder, then point the new
            // set here.
            update_where(&conn, table, &clear, SqlExpr::eq(fk.to_string(), id)).await?;
            let targets = distinct_ids(refs);
            if !targets.is_empty() {
                update_where(
                    &conn,
                    table,
                    &point,
                    SqlExpr::is_in(ID_COLUMN.to_string(), int_params(&targets)),
                )
                .await?;
            }
        }
        RelationMutation::Patch {
            connect,
            disconnect,
        } => {
            let detach = distinct_ids(disconnect);
            if !detach.is_empty() {
                update_where(
                    &conn,
                    table,
                    &clear,
                    SqlExpr::And(vec![
                        SqlExpr::is_in(ID_COLUMN.to_string(), int_params(&detach)),
                        SqlExpr::eq(fk.to_string(), id),
                    ]),
                )
                .await?;
            }
            let attach = distinct_ids(connect);
            if !attach.is_empty() {
                if kind == RelationKind::OneToOne {
                    // A one-to-one admits a single child; detach the
                    // current one first.
                    update_where(&conn, table, &clear, SqlExpr::eq(fk.to_string(), id)).await?;
                }
                update_where(
                    &conn,
                    table,
                    &point,
                    SqlExpr::is_in(ID_COLUMN.to_string(), int_params(&attach)),
                )
                .await?;
            }
        }
    }
    Ok(())
}

/// Rows deleted by a uniqueness eviction, reported so the caller can
/// re-sequence every partition the delete touched.
#[derive(Default)]
struct Evicted {
    owners: BTreeSet<i64>,
    targets: BTreeSet<i64>,
}

/// Delete the pivot rows matching `conditions`, recording the partitions
/// the delete leaves gaps in. The row set is bounded by the write payload,
/// so a single delete statement suffices.
async fn evict_rows<D: SqlDriver>(
    conn: Conn<'_, D>,
    jt: &JoinTable,
    conditions: Vec<SqlExpr>,
) -> Result<Evicted, Error> {
    let own = &jt.join_column.name;
    let inverse = &jt.inverse_join_column.name;

    let mut sql = format!("SELECT {own}, {inverse} FROM {} WHERE ", jt.name);
    let mut params = Vec::new();
    SqlExpr::And(conditions.clone()).render(&mut sql, &mut params);
    let rows = conn.query(Statement::new(sql, params)).await?;

    let mut evicted = Evicted::default();
    for row in &rows {
        if let Some(owner) = row_get(row, own).and_then(SqlValue::as_int) {
            evicted.owners.insert(owner);
        }
        if let Some(target) = row_get(row, inverse).and_then(SqlValue::as_int) {
            evicted.targets.insert(target);
        }
    }
    if !rows.is_empty() {
        delete_where(&conn, &jt.name, SqlExpr::And(conditions)).await?;
    }
    Ok(evicted)
}

/// A new association on a uniqueness-constrained "one" side must evict the
/// previous holder before insert, else a uniqueness violation occurs.
async fn evict_one_side<D: SqlDriver>(
    conn: Conn<'_, D>,
    kind: RelationKind,
    jt: &JoinTable,
    id: i64,
    targets: &[i64],
) -> Result<Evicted, Error> {
    let own = &jt.join_column.name;
    let inverse = &jt.inverse_join_column.name;
    let mut competing = Vec::new();
    match kind {
        RelationKind::OneToOne => {
            competing.push(SqlExpr::eq(own.clone(), id));
            competing.push(SqlExpr::is_in(inverse.clone(), int_params(targets)));
        }
        RelationKind::ManyToOne => {
            competing.push(SqlExpr::eq(own.clone(), id));
        }
        RelationKind::OneToMany => {
            competing.push(SqlExpr::is_in(inverse.clone(), int_params(targets)));
        }
        _ => return Ok(Evicted::default()),
    }
    let mut conditions = vec![SqlExpr::Or(competing)];
    conditions.extend(scope_exprs(&jt.on));
    evict_rows(conn, jt, conditions).await
}

/// Eviction variant for `set`: the owner's own rows are already reconciled,
/// so only other owners' claims on a unique target side compete.
async fn evict_target_claims<D: SqlDriver>(
    conn: Conn<'_, D>,
    kind: RelationKind,
    jt: &JoinTable,
    id: i64,
    targets: &[i64],
) -> Result<Evicted, Error> {
    if targets.is_empty()
        || !matches!(kind, RelationKind::OneToOne | RelationKind::OneToMany)
    {
        return Ok(Evicted::default());
    }
    let mut conditions = vec![
        SqlExpr::is_in(jt.inverse_join_column.name.clone(), int_params(targets)),
        SqlExpr::Not(Box::new(SqlExpr::eq(jt.join_column.name.clone(), id))),
    ];
    conditions.extend(scope_exprs(&jt.on));
    evict_rows(conn, jt, conditions).await
}

/// Insert pivot rows linking `id` to `targets`, continuing the order
/// sequences past their current maxima.
async fn insert_links<D: SqlDriver>(
    conn: Conn<'_, D>,
    jt: &JoinTable,
    id: i64,
    targets: &[i64],
) -> Result<(), Error> {
    if targets.is_empty() {
        return Ok(());
    }
    let own = &jt.join_column.name;
    let inverse = &jt.inverse_join_column.name;

    let mut next_order = match &jt.order_column {
        Some(order) => {
            let mut conditions = vec![SqlExpr::eq(own.clone(), id)];
            conditions.extend(scope_exprs(&jt.on));
            max_value(&conn, &jt.name, order, conditions).await? + 1
        }
        None => 0,
    };
    let inverse_base = match &jt.inverse_order_column {
        Some(inverse_order) => {
            let mut conditions = vec![SqlExpr::is_in(inverse.clone(), int_params(targets))];
            conditions.extend(scope_exprs(&jt.on));
            grouped_max(&conn, &jt.name, inverse, inverse_order, conditions).await?
        }
        None => HashMap::new(),
    };

    for target in targets {
        let mut columns = vec![
            (own.clone(), SqlValue::Int(id)),
            (inverse.clone(), SqlValue::Int(*target)),
        ];
        if let Some(order) = &jt.order_column {
            columns.push((order.clone(), SqlValue::Int(next_order)));
            next_order += 1;
        }
        if let Some(inverse_order) = &jt.inverse_order_column {
            let base = inverse_base.get(target).copied().unwrap_or(0);
            columns.push((inverse_order.clone(), SqlValue::Int(base + 1)));
        }
        for (column, value) in &jt.on {
            columns.push((column.clone(), SqlValue::Text(value.clone())));
        }
        insert_row(&conn, &jt.name, columns).await?;
    }
    Ok(())
}

/// Desired-state change over a pivot table, owner or mirrored inverse side
/// alike.
async fn apply_join_table<D: SqlDriver>(
    driver: &D,
    conn: Conn<'_, D>,
    kind: RelationKind,
    jt: &JoinTable,
    id: i64,
    mutation: &RelationMutation,
) -> Result<(), Error> {
    let own = &jt.join_column.name;
    let inverse = &jt.inverse_join_column.name;
    // Partitions whose order values the mutation may have disturbed.
    let mut owners: BTreeSet<i64> = BTreeSet::new();
    let mut touched: BTreeSet<i64> = BTreeSet::new();
    owners.insert(id);

    match mutation {
        RelationMutation::Set(refs) => {
            let kept = distinct_ids(refs);
            let existing = linked_targets(&conn, jt, id).await?;
            touched.extend(existing.iter().copied());
            touched.extend(kept.iter().copied());

            // Delete all except the kept set, batched over the pivot's own
            // surrogate id.
            let mut conditions = vec![SqlExpr::eq(own.clone(), id)];
            if !kept.is_empty() {
                conditions.push(SqlExpr::In {
                    column: inverse.clone(),
                    values: int_params(&kept),
                    negated: true,
                });
            }
            conditions.extend(scope_exprs(&jt.on));
            batched_delete(&conn, &jt.name, conditions).await?;

            let evicted = evict_target_claims(conn, kind, jt, id, &kept).await?;
            owners.extend(evicted.owners);
            touched.extend(evicted.targets);

            let existing: BTreeSet<i64> = existing.into_iter().collect();
            let missing: Vec<i64> = kept
                .into_iter()
                .filter(|target| !existing.contains(target))
                .collect();
            insert_links(conn, jt, id, &missing).await?;
        }
        RelationMutation::Patch {
            connect,
            disconnect,
        } => {
            let detach = distinct_ids(disconnect);
            if !detach.is_empty() {
                touched.extend(detach.iter().copied());
                let mut condition = vec![
                    SqlExpr::eq(own.clone(), id),
                    SqlExpr::is_in(inverse.clone(), int_params(&detach)),
                ];
                condition.extend(scope_exprs(&jt.on));
                delete_where(&conn, &jt.name, SqlExpr::And(condition)).await?;
            }
            let attach = distinct_ids(connect);
            if !attach.is_empty() {
                touched.extend(attach.iter().copied());
                let evicted = evict_one_side(conn, kind, jt, id, &attach).await?;
                owners.extend(evicted.owners);
                touched.extend(evicted.targets);
                insert_links(conn, jt, id, &attach).await?;
            }
        }
    }

    // Order values must stay a dense 1..N per owner, and per target when
    // the inverse side is ordered too.
    if let Some(order) = &jt.order_column {
        let partitions: Vec<i64> = owners.into_iter().collect();
        resequence(
            &conn,
            driver.supports_window_functions(),
            &jt.name,
            own,
            order,
            &partitions,
            &jt.on,
        )
        .await?;
    }
    if let Some(inverse_order) = &jt.inverse_order_column {
        let partitions: Vec<i64> = touched.into_iter().collect();
        resequence(
            &conn,
            driver.supports_window_functions(),
            &jt.name,
            inverse,
            inverse_order,
            &partitions,
            &jt.on,
        )
        .await?;
    }
    Ok(())
}

/// Delete rows that would leave a stale single-valued pointer: targets
/// whose model declares a `morphOne` back reference to this attribute may
/// appear in at most one owner's list.
async fn evict_single_backrefs<D: SqlDriver>(
    registry: &Registry,
    conn: Conn<'_, D>,
    model: &ModelMeta,
    attribute: &str,
    mt: &MorphJoinTable,
    refs: &[(String, i64)],
) -> Result<(), Error> {
    let mut by_type: BTreeMap<&str, Vec<i64>> = BTreeMap::new();
    for (type_uid, id) in refs {
        by_type.entry(type_uid.as_str()).or_default().push(*id);
    }
    for (type_uid, ids) in by_type {
        let single = registry.get(type_uid).is_some_and(|target| {
            target.relations().any(|(_, rel)| {
                rel.kind == RelationKind::MorphOne
                    && rel.target.as_deref() == Some(model.uid.as_str())
                    && rel.morph_by.as_deref() == Some(attribute)
            })
        });
        if !single {
            continue;
        }
        delete_where(
            &conn,
            &mt.name,
            SqlExpr::And(vec![
                SqlExpr::eq(mt.field_column.clone(), attribute),
                SqlExpr::eq(mt.morph_column.type_column.clone(), type_uid),
                SqlExpr::is_in(mt.morph_column.id_column.clone(), int_params(&ids)),
            ]),
        )
        .await?;
    }
    Ok(())
}

async fn insert_morph_links<D: SqlDriver>(
    conn: Conn<'_, D>,
    mt: &MorphJoinTable,
    attribute: &str,
    id: i64,
    refs: &[(String, i64)],
    base_order: i64,
) -> Result<(), Error> {
    for (i, (type_uid, target)) in refs.iter().enumerate() {
        insert_row(
            &conn,
            &mt.name,
            vec![
                (mt.join_column.name.clone(), SqlValue::Int(id)),
                (mt.morph_column.id_column.clone(), SqlValue::Int(*target)),
                (
                    mt.morph_column.type_column.clone(),
                    SqlValue::Text(type_uid.clone()),
                ),
                (mt.field_column.clone(), SqlValue::Text(attribute.to_string())),
                (mt.order_column.clone(), SqlValue::Int(base_order + i as i64 + 1)),
            ],
        )
        .await?;
    }
    Ok(())
}

/// Desired-state change of a morph-to-many owner over its shared pivot.
#[allow(clippy::too_many_arguments)]
async fn apply_morph_join_table<D: SqlDriver>(
    registry: &Registry,
    driver: &D,
    conn: Conn<'_, D>,
    model: &ModelMeta,
    attribute: &str,
    relation: &RelationMeta,
    id: i64,
    mutation: &RelationMutation,
) -> Result<(), Error> {
    let mt = match relation.morph_join_table() {
        Some(mt) => mt,
        None => return Ok(()),
    };
    let own_rows = vec![
        SqlExpr::eq(mt.join_column.name.clone(), id),
        SqlExpr::eq(mt.field_column.clone(), attribute),
    ];

    match mutation {
        RelationMutation::Set(refs) => {
            let refs = distinct_morph_refs(model, attribute, refs)?;
            batched_delete(&conn, &mt.name, own_rows.clone()).await?;
            evict_single_backrefs(registry, conn, model, attribute, mt, &refs).await?;
            insert_morph_links(conn, mt, attribute, id, &refs, 0).await?;
        }
        RelationMutation::Patch {
            connect,
            disconnect,
        } => {
            let detach = distinct_morph_refs(model, attribute, disconnect)?;
            if !detach.is_empty() {
                let pairs = detach
                    .iter()
                    .map(|(type_uid, target)| {
                        SqlExpr::And(vec![
                            SqlExpr::eq(mt.morph_column.type_column.clone(), type_uid.as_str()),
                            SqlExpr::eq(mt.morph_column.id_column.clone(), *target),
                        ])
                    })
                    .collect();
                let mut condition = own_rows.clone();
                condition.push(SqlExpr::Or(pairs));
                delete_where(&conn, &mt.name, SqlExpr::And(condition)).await?;
            }
            let attach = distinct_morph_refs(model, attribute, connect)?;
            if !attach.is_empty() {
                evict_single_backrefs(registry, conn, model, attribute, mt, &attach).await?;
                let base = max_value(&conn, &mt.name, &mt.order_column, own_rows.clone()).await?;
                insert_morph_links(conn, mt, attribute, id, &attach, base).await?;
            }
        }
    }

    resequence(
        &conn,
        driver.supports_window_functions(),
        &mt.name,
        &mt.join_column.name,
        &mt.order_column,
        &[id],
        &[(mt.field_column.clone(), attribute.to_string())],
    )
    .await?;
    Ok(())
}

/// Writes on a morph-one/morph-many back reference go through the storage
/// of the target's owning attribute.
async fn apply_morph_backref<D: SqlDriver>(
    registry: &Registry,
    driver: &D,
    conn: Conn<'_, D>,
    model: &ModelMeta,
    relation: &RelationMeta,
    id: i64,
    mutation: &RelationMutation,
) -> Result<(), Error> {
    let target_uid = relation.target.as_deref().unwrap_or_default();
    let target = registry.model(target_uid)?;
    let morph_by = relation.morph_by.as_deref().unwrap_or_default();
    let owner_rel = target
        .relation(morph_by)
        .ok_or_else(|| QueryError::UnknownAttribute {
            model: target.uid.clone(),
            attribute: morph_by.to_string(),
        })?;
    let single = relation.kind == RelationKind::MorphOne;

    match &owner_rel.storage {
        RelationStorage::MorphColumn(mc) => {
            let table = &target.table_name;
            let clear: [(&str, SqlValue); 2] = [
                (mc.id_column.as_str(), SqlValue::Null),
                (mc.type_column.as_str(), SqlValue::Null),
            ];
            let point: [(&str, SqlValue); 2] = [
                (mc.id_column.as_str(), SqlValue::Int(id)),
                (mc.type_column.as_str(), SqlValue::Text(model.uid.clone())),
            ];
            let points_here = SqlExpr::And(vec![
                SqlExpr::eq(mc.type_column.clone(), model.uid.as_str()),
                SqlExpr::eq(mc.id_column.clone(), id),
            ]);
            match mutation {
                RelationMutation::Set(refs) => {
                    update_where(&conn, table, &clear, points_here).await?;
                    let targets = distinct_ids(refs);
                    if !targets.is_empty() {
                        update_where(
                            &conn,
                            table,
                            &point,
                            SqlExpr::is_in(ID_COLUMN.to_string(), int_params(&targets)),
                        )
                        .await?;
                    }
                }
                RelationMutation::Patch {
                    connect,
                    disconnect,
                } => {
                    let detach = distinct_ids(disconnect);
                    if !detach.is_empty() {
                        update_where(
                            &conn,
                            table,
                            &clear,
                            SqlExpr::And(vec![
                                SqlExpr::is_in(ID_COLUMN.to_string(), int_params(&detach)),
                                points_here.clone(),
                            ]),
                        )
                        .await?;
                    }
                    let attach = distinct_ids(connect);
                    if !attach.is_empty() {
                        if single {
                            update_where(&conn, table, &clear, points_here).await?;
                        }
                        update_where(
                            &conn,
                            table,
                            &point,
                            SqlExpr::is_in(ID_COLUMN.to_string(), int_params(&attach)),
                        )
                        .await?;
                    }
                }
            }
        }
        RelationStorage::MorphJoinTable(mt) => {
            // Rows in the target's shared pivot pointing back at this
            // entity.
            let points_here = vec![
                SqlExpr::eq(mt.morph_column.type_column.clone(), model.uid.as_str()),
                SqlExpr::eq(mt.morph_column.id_column.clone(), id),
                SqlExpr::eq(mt.field_column.clone(), morph_by),
            ];
            let mut touched: BTreeSet<i64> = BTreeSet::new();
            match mutation {
                RelationMutation::Set(refs) => {
                    touched.extend(
                        morph_backref_holders(&conn, mt, &points_here).await?,
                    );
                    batched_delete(&conn, &mt.name, points_here.clone()).await?;
                    let targets = distinct_ids(refs);
                    touched.extend(targets.iter().copied());
                    connect_morph_backref(conn, mt, morph_by, model, id, &targets).await?;
                }
                RelationMutation::Patch {
                    connect,
                    disconnect,
                } => {
                    let detach = distinct_ids(disconnect);
                    if !detach.is_empty() {
                        touched.extend(detach.iter().copied());
                        let mut condition = points_here.clone();
                        condition.push(SqlExpr::is_in(
                            mt.join_column.name.clone(),
                            int_params(&detach),
                        ));
                        delete_where(&conn, &mt.name, SqlExpr::And(condition)).await?;
                    }
                    let attach = distinct_ids(connect);
                    if !attach.is_empty() {
                        if single {
                            // This entity may sit in a single owner's list.
                            touched.extend(
                                morph_backref_holders(&conn, mt, &points_here).await?,
                            );
                            batched_delete(&conn, &mt.name, points_here.clone()).await?;
                        }
                        touched.extend(attach.iter().copied());
                        connect_morph_backref(conn, mt, morph_by, model, id, &attach).await?;
                    }
                }
            }
            let partitions: Vec<i64> = touched.into_iter().collect();
            resequence(
                &conn,
                driver.supports_window_functions(),
                &mt.name,
                &mt.join_column.name,
                &mt.order_column,
                &partitions,
                &[(mt.field_column.clone(), morph_by.to_string())],
            )
            .await?;
        }
        _ => {}
    }
    Ok(())
}

/// Owners whose pivot rows currently point at the back-referenced entity.
async fn morph_backref_holders<E: SqlExecutor>(
    exec: &E,
    mt: &MorphJoinTable,
    points_here: &[SqlExpr],
) -> Result<Vec<i64>, Error> {
    let mut sql = format!(
        "SELECT {own} FROM {table} WHERE ",
        own = mt.join_column.name,
        table = mt.name
    );
    let mut params = Vec::new();
    SqlExpr::And(points_here.to_vec()).render(&mut sql, &mut params);
    let rows = exec.query(Statement::new(sql, params)).await?;
    Ok(rows
        .iter()
        .filter_map(|row| row_get(row, &mt.join_column.name).and_then(SqlValue::as_int))
        .collect())
}

/// Insert back-reference pivot rows, one per owning target, continuing each
/// owner's order sequence.
async fn connect_morph_backref<D: SqlDriver>(
    conn: Conn<'_, D>,
    mt: &MorphJoinTable,
    morph_by: &str,
    model: &ModelMeta,
    id: i64,
    targets: &[i64],
) -> Result<(), Error> {
    if targets.is_empty() {
        return Ok(());
    }
    let base = grouped_max(
        &conn,
        &mt.name,
        &mt.join_column.name,
        &mt.order_column,
        vec![
            SqlExpr::is_in(mt.join_column.name.clone(), int_params(targets)),
            SqlExpr::eq(mt.field_column.clone(), morph_by),
        ],
    )
    .await?;
    for target in targets {
        let order = base.get(target).copied().unwrap_or(0) + 1;
        insert_row(
            &conn,
            &mt.name,
            vec![
                (mt.join_column.name.clone(), SqlValue::Int(*target)),
                (mt.morph_column.id_column.clone(), SqlValue::Int(id)),
                (
                    mt.morph_column.type_column.clone(),
                    SqlValue::Text(model.uid.clone()),
                ),
                (mt.field_column.clone(), SqlValue::Text(morph_by.to_string())),
                (mt.order_column.clone(), SqlValue::Int(order)),
            ],
        )
        .await?;
    }
    Ok(())
}

/// Remove every association of entity `id` ahead of its deletion.
///
/// Skipped entirely when the dialect enforces foreign keys: `ON DELETE
/// CASCADE` cleans the links up server-side.
pub(crate) async fn delete_relations<D: SqlDriver>(
    registry: &Registry,
    driver: &D,
    conn: Conn<'_, D>,
    model: &ModelMeta,
    id: i64,
) -> Result<(), Error> {
    if driver.uses_foreign_keys() {
        debug!(model = %model.uid, "dialect enforces foreign keys; skipping explicit link deletion");
        return Ok(());
    }

    for (attribute, relation) in model.relations() {
        match &relation.storage {
            RelationStorage::JoinColumn(jc) if !relation.owner => {
                // Orphaned foreign keys on the target's table.
                update_where(
                    &conn,
                    &jc.referenced_table,
                    &[(jc.referenced_column.as_str(), SqlValue::Null)],
                    SqlExpr::eq(jc.referenced_column.clone(), id),
                )
                .await?;
            }
            RelationStorage::JoinColumn(_) | RelationStorage::MorphColumn(_) => {
                // Stored on the row being deleted.
            }
            RelationStorage::JoinTable(jt) => {
                let touched = if jt.inverse_order_column.is_some() {
                    linked_targets(&conn, jt, id).await?
                } else {
                    Vec::new()
                };
                let mut conditions = vec![SqlExpr::eq(jt.join_column.name.clone(), id)];
                conditions.extend(scope_exprs(&jt.on));
                batched_delete(&conn, &jt.name, conditions).await?;
                if let Some(inverse_order) = &jt.inverse_order_column {
                    resequence(
                        &conn,
                        driver.supports_window_functions(),
                        &jt.name,
                        &jt.inverse_join_column.name,
                        inverse_order,
                        &touched,
                        &jt.on,
                    )
                    .await?;
                }
            }
            RelationStorage::MorphJoinTable(mt) => {
                batched_delete(
                    &conn,
                    &mt.name,
                    vec![
                        SqlExpr::eq(mt.join_column.name.clone(), id),
                        SqlExpr::eq(mt.field_column.clone(), attribute),
                    ],
                )
                .await?;
            }
            RelationStorage::None => {
                detach_morph_backref(registry, driver, conn, model, relation, id).await?;
            }
        }
    }
    Ok(())
}

/// Clear the owning-side storage of a morph back reference when the
/// referenced entity goes away.
async fn detach_morph_backref<D: SqlDriver>(
    registry: &Registry,
    driver: &D,
    conn: Conn<'_, D>,
    model: &ModelMeta,
    relation: &RelationMeta,
    id: i64,
) -> Result<(), Error> {
    let target_uid = relation.target.as_deref().unwrap_or_default();
    let target = match registry.get(target_uid) {
        Some(target) => target,
        None => return Ok(()),
    };
    let morph_by = relation.morph_by.as_deref().unwrap_or_default();
    let owner_rel = match target.relation(morph_by) {
        Some(rel) => rel,
        None => return Ok(()),
    };
    match &owner_rel.storage {
        RelationStorage::MorphColumn(mc) => {
            update_where(
                &conn,
                &target.table_name,
                &[
                    (mc.id_column.as_str(), SqlValue::Null),
                    (mc.type_column.as_str(), SqlValue::Null),
                ],
                SqlExpr::And(vec![
                    SqlExpr::eq(mc.type_column.clone(), model.uid.as_str()),
                    SqlExpr::eq(mc.id_column.clone(), id),
                ]),
            )
            .await?;
        }
        RelationStorage::MorphJoinTable(mt) => {
            let points_here = vec![
                SqlExpr::eq(mt.morph_column.type_column.clone(), model.uid.as_str()),
                SqlExpr::eq(mt.morph_column.id_column.clone(), id),
                SqlExpr::eq(mt.field_column.clone(), morph_by),
            ];
            let touched = morph_backref_holders(&conn, mt, &points_here).await?;
            batched_delete(&conn, &mt.name, points_here).await?;
            resequence(
                &conn,
                driver.supports_window_functions(),
                &mt.name,
                &mt.join_column.name,
                &mt.order_column,
                &touched,
                &[(mt.field_column.clone(), morph_by.to_string())],
            )
            .await?;
        }
        _ => {}
    }
    Ok(())
}
