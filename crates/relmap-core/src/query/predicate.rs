//! Filter-tree compilation.
//!
//! Turns the declarative `$and/$or/$not` + comparison-operator vocabulary
//! into column-qualified predicates. Non-relational keys compile to
//! `alias.column`; relational keys allocate a join and recurse into the
//! target's criteria under the fresh alias.

use serde_json::{Map, Value as JsonValue};

use crate::error::QueryError;
use crate::schema::{Attribute, ModelMeta, OrderDirection, Registry, ID_COLUMN};
use crate::value::SqlValue;

use super::join::{create_join, Join};
use super::sql::{escape_like, CmpOp, SqlExpr};

/// Mutable query state the compiler allocates joins into.
pub(crate) struct FilterContext<'a> {
    pub registry: &'a Registry,
    pub joins: &'a mut Vec<Join>,
    pub counter: &'a mut u32,
}

/// Compile a root criteria tree for `model` under `alias`.
pub(crate) fn compile_filter(
    cx: &mut FilterContext<'_>,
    model: &ModelMeta,
    alias: &str,
    criteria: &JsonValue,
) -> Result<SqlExpr, QueryError> {
    compile_value(cx, model, alias, criteria, 0)
}

fn compile_value(
    cx: &mut FilterContext<'_>,
    model: &ModelMeta,
    alias: &str,
    criteria: &JsonValue,
    depth: usize,
) -> Result<SqlExpr, QueryError> {
    match criteria {
        JsonValue::Object(map) => compile_object(cx, model, alias, map, depth),
        other => Err(QueryError::InvalidOperand {
            op: "filters".into(),
            expected: if other.is_array() {
                "an object of criteria (arrays only appear under `$and`/`$or`)"
            } else {
                "an object of criteria"
            },
        }),
    }
}

fn compile_object(
    cx: &mut FilterContext<'_>,
    model: &ModelMeta,
    alias: &str,
    map: &Map<String, JsonValue>,
    depth: usize,
) -> Result<SqlExpr, QueryError> {
    let mut parts = Vec::with_capacity(map.len());

    for (key, value) in map {
        match key.as_str() {
            "$and" => parts.push(compile_group(cx, model, alias, key, value, depth, false)?),
            "$or" => parts.push(compile_group(cx, model, alias, key, value, depth, true)?),
            "$not" => {
                let inner = compile_value(cx, model, alias, value, depth + 1)?;
                parts.push(SqlExpr::Not(Box::new(inner)));
            }
            _ if key.starts_with('$') => {
                // Comparison operators must hang off an attribute; at the
                // root only group operators are meaningful.
                return Err(if depth == 0 {
                    QueryError::InvalidRootOperator(key.clone())
                } else {
                    QueryError::UnknownOperator(key.clone())
                });
            }
            attribute => parts.push(compile_attribute(cx, model, alias, attribute, value, depth)?),
        }
    }

    Ok(SqlExpr::And(parts))
}

fn compile_group(
    cx: &mut FilterContext<'_>,
    model: &ModelMeta,
    alias: &str,
    op: &str,
    value: &JsonValue,
    depth: usize,
    disjunction: bool,
) -> Result<SqlExpr, QueryError> {
    let items = value.as_array().ok_or(QueryError::InvalidOperand {
        op: op.to_string(),
        expected: "an array of criteria objects",
    })?;
    let children = items
        .iter()
        .map(|item| compile_value(cx, model, alias, item, depth + 1))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(if disjunction {
        SqlExpr::Or(children)
    } else {
        SqlExpr::And(children)
    })
}

fn compile_attribute(
    cx: &mut FilterContext<'_>,
    model: &ModelMeta,
    alias: &str,
    attribute: &str,
    value: &JsonValue,
    depth: usize,
) -> Result<SqlExpr, QueryError> {
    match model.attribute(attribute) {
        Some(Attribute::Scalar(_)) => {
            let column = format!(
                "{alias}.{}",
                model
                    .scalar_column(attribute)
                    .unwrap_or_else(|| attribute.to_string())
            );
            compile_operand(&column, value)
        }
        Some(Attribute::Relation(relation)) => {
            let (target_alias, target_uid) = create_join(
                cx.registry,
                cx.joins,
                cx.counter,
                model,
                attribute,
                relation,
                alias,
            )?;
            let target = cx.registry.model(&target_uid)?;
            match value {
                // Nested criteria against the target model.
                JsonValue::Object(map) => {
                    compile_object(cx, target, &target_alias, map, depth + 1)
                }
                // Shorthand: match the target identifier directly.
                JsonValue::Array(items) => Ok(SqlExpr::is_in(
                    format!("{target_alias}.{ID_COLUMN}"),
                    items.iter().map(SqlValue::from_json).collect(),
                )),
                scalar => Ok(SqlExpr::eq(
                    format!("{target_alias}.{ID_COLUMN}"),
                    SqlValue::from_json(scalar),
                )),
            }
        }
        None => Err(QueryError::UnknownAttribute {
            model: model.uid.clone(),
            attribute: attribute.to_string(),
        }),
    }
}

/// Compile the operand of a scalar attribute key.
fn compile_operand(column: &str, value: &JsonValue) -> Result<SqlExpr, QueryError> {
    match value {
        JsonValue::Object(ops) => {
            let parts = ops
                .iter()
                .map(|(op, operand)| compile_operator(column, op, operand))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SqlExpr::And(parts))
        }
        // A bare array is an implicit `$in`.
        JsonValue::Array(items) => Ok(SqlExpr::is_in(
            column.to_string(),
            items.iter().map(SqlValue::from_json).collect(),
        )),
        scalar => Ok(SqlExpr::eq(column, SqlValue::from_json(scalar))),
    }
}

fn compile_operator(column: &str, op: &str, operand: &JsonValue) -> Result<SqlExpr, QueryError> {
    match op {
        "$eq" => scalar_cmp(column, CmpOp::Eq, op, operand),
        "$ne" => scalar_cmp(column, CmpOp::Ne, op, operand),
        "$gt" => scalar_cmp(column, CmpOp::Gt, op, operand),
        "$gte" => scalar_cmp(column, CmpOp::Gte, op, operand),
        "$lt" => scalar_cmp(column, CmpOp::Lt, op, operand),
        "$lte" => scalar_cmp(column, CmpOp::Lte, op, operand),
        "$in" | "$notIn" => {
            let items = operand.as_array().ok_or(QueryError::InvalidOperand {
                op: op.to_string(),
                expected: "an array of values",
            })?;
            Ok(SqlExpr::In {
                column: column.to_string(),
                values: items.iter().map(SqlValue::from_json).collect(),
                negated: op == "$notIn",
            })
        }
        "$null" | "$notNull" => {
            let wanted = operand.as_bool().unwrap_or(true);
            let negated = (op == "$notNull") == wanted;
            Ok(SqlExpr::Null {
                column: column.to_string(),
                negated,
            })
        }
        "$between" => {
            let items = operand.as_array().filter(|a| a.len() == 2).ok_or(
                QueryError::InvalidOperand {
                    op: op.to_string(),
                    expected: "an array of exactly two bounds",
                },
            )?;
            Ok(SqlExpr::Between {
                column: column.to_string(),
                low: SqlValue::from_json(&items[0]),
                high: SqlValue::from_json(&items[1]),
            })
        }
        "$startsWith" | "$endsWith" | "$contains" | "$notContains" => {
            like_op(column, op, operand)
        }
        other => Err(QueryError::UnknownOperator(other.to_string())),
    }
}

/// Comparison against a scalar operand. An array operand distributes into a
/// disjunction over its elements; `$in`/`$notIn`/`$between` are the only
/// operators that accept arrays natively.
fn scalar_cmp(
    column: &str,
    op: CmpOp,
    op_name: &str,
    operand: &JsonValue,
) -> Result<SqlExpr, QueryError> {
    if let JsonValue::Array(items) = operand {
        let parts = items
            .iter()
            .map(|item| scalar_cmp(column, op, op_name, item))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(SqlExpr::Or(parts));
    }
    Ok(SqlExpr::Cmp {
        column: column.to_string(),
        op,
        value: SqlValue::from_json(operand),
    })
}

fn like_op(column: &str, op: &str, operand: &JsonValue) -> Result<SqlExpr, QueryError> {
    if let JsonValue::Array(items) = operand {
        let parts = items
            .iter()
            .map(|item| like_op(column, op, item))
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(SqlExpr::Or(parts));
    }
    let needle = operand.as_str().ok_or(QueryError::InvalidOperand {
        op: op.to_string(),
        expected: "a string",
    })?;
    let escaped = escape_like(needle);
    let (pattern, negated) = match op {
        "$startsWith" => (format!("{escaped}%"), false),
        "$endsWith" => (format!("%{escaped}"), false),
        "$contains" => (format!("%{escaped}%"), false),
        _ => (format!("%{escaped}%"), true),
    };
    Ok(SqlExpr::Like {
        column: column.to_string(),
        pattern,
        negated,
    })
}

/// Compile an order-by path (`author.name`) into a qualified column
/// reference, allocating joins for relation segments. Only scalar
/// attributes are sortable.
pub(crate) fn compile_order_path(
    cx: &mut FilterContext<'_>,
    model: &ModelMeta,
    alias: &str,
    path: &str,
) -> Result<String, QueryError> {
    let mut current = model;
    let mut current_alias = alias.to_string();
    let segments: Vec<&str> = path.split('.').collect();

    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        match current.attribute(segment) {
            Some(Attribute::Scalar(_)) if last => {
                let column = current
                    .scalar_column(segment)
                    .unwrap_or_else(|| segment.to_string());
                return Ok(format!("{current_alias}.{column}"));
            }
            Some(Attribute::Scalar(_)) => {
                return Err(QueryError::NotSortable {
                    model: current.uid.clone(),
                    attribute: segment.to_string(),
                });
            }
            Some(Attribute::Relation(relation)) if !last => {
                let (next_alias, target_uid) = create_join(
                    cx.registry,
                    cx.joins,
                    cx.counter,
                    current,
                    segment,
                    relation,
                    &current_alias,
                )?;
                current = cx.registry.model(&target_uid)?;
                current_alias = next_alias;
            }
            Some(Attribute::Relation(_)) => {
                return Err(QueryError::NotSortable {
                    model: current.uid.clone(),
                    attribute: segment.to_string(),
                });
            }
            None => {
                return Err(QueryError::UnknownAttribute {
                    model: current.uid.clone(),
                    attribute: segment.to_string(),
                });
            }
        }
    }

    // Unreachable: the loop always returns on the last segment.
    Err(QueryError::UnknownAttribute {
        model: model.uid.clone(),
        attribute: path.to_string(),
    })
}

/// Parse an order spec (`"title"`, `"title:desc"`, `"author.name:asc"`).
pub(crate) fn parse_order_spec(spec: &str) -> (&str, OrderDirection) {
    match spec.rsplit_once(':') {
        Some((path, dir)) if dir.eq_ignore_ascii_case("desc") => (path, OrderDirection::Desc),
        Some((path, _)) => (path, OrderDirection::Asc),
        None => (spec, OrderDirection::Asc),
    }
}
