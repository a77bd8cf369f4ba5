//! Order-column maintenance.
//!
//! After any mutation of an ordered relation, order values must form a
//! dense `1..N` sequence per partition (owner, and inverse owner for
//! bidirectional many-relations). Two strategies: a window-function update
//! for dialects that have them, and a session-variable counter fallback.

use tracing::debug;

use crate::driver::{SqlExecutor, Statement};
use crate::error::Error;
use crate::query::sql::SqlExpr;
use crate::value::SqlValue;

/// Fixed batch size for cursor-based pivot deletes.
pub(crate) const DELETE_BATCH_SIZE: u64 = 100;

/// Re-sequence `order_column` to a dense `1..N` per `partition_column`
/// for the given partition values.
///
/// `scope` restricts the renumbered rows with extra equality conditions:
/// pivots shared across several attributes (component and morph tables)
/// must only renumber their own discriminated rows.
pub(crate) async fn resequence<E: SqlExecutor>(
    exec: &E,
    window_functions: bool,
    table: &str,
    partition_column: &str,
    order_column: &str,
    partitions: &[i64],
    scope: &[(String, String)],
) -> Result<(), Error> {
    if partitions.is_empty() {
        return Ok(());
    }
    let stmt = if window_functions {
        window_statement(table, partition_column, order_column, partitions, scope)
    } else {
        session_variable_statement(table, partition_column, order_column, partitions, scope)
    };
    debug!(table = %table, partitions = partitions.len(), "resequencing order column");
    exec.execute(stmt).await?;
    Ok(())
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 3);
    for i in 0..count {
        if i > 0 {
            out.push_str(", ");
        }
        out.push('?');
    }
    out
}

fn int_params(values: &[i64]) -> Vec<SqlValue> {
    values.iter().copied().map(SqlValue::Int).collect()
}

fn scope_sql(scope: &[(String, String)], params: &mut Vec<SqlValue>) -> String {
    let mut out = String::new();
    for (column, value) in scope {
        out.push_str(&format!(" AND {column} = ?"));
        params.push(SqlValue::Text(value.clone()));
    }
    out
}

/// `ROW_NUMBER() OVER (PARTITION BY owner ORDER BY order)` strategy.
fn window_statement(
    table: &str,
    partition_column: &str,
    order_column: &str,
    partitions: &[i64],
    scope: &[(String, String)],
) -> Statement {
    let mut params = int_params(partitions);
    let scoped = scope_sql(scope, &mut params);
    let sql = format!(
        "UPDATE {table} AS a SET {order} = b.src_order FROM (\
         SELECT id, ROW_NUMBER() OVER (PARTITION BY {partition} ORDER BY {order}) AS src_order \
         FROM {table} WHERE {partition} IN ({marks}){scoped}\
         ) AS b WHERE b.id = a.id",
        table = table,
        order = order_column,
        partition = partition_column,
        marks = placeholders(partitions.len()),
        scoped = scoped,
    );
    Statement::new(sql, params)
}

/// Incrementing session-variable fallback for dialects without window
/// functions.
fn session_variable_statement(
    table: &str,
    partition_column: &str,
    order_column: &str,
    partitions: &[i64],
    scope: &[(String, String)],
) -> Statement {
    let mut params = int_params(partitions);
    let scoped = scope_sql(scope, &mut params);
    let sql = format!(
        "UPDATE {table} AS a JOIN (\
         SELECT id, (@n := IF(@p = {partition}, @n + 1, 1)) AS src_order, @p := {partition} \
         FROM {table} CROSS JOIN (SELECT @n := 0, @p := NULL) AS vars \
         WHERE {partition} IN ({marks}){scoped} ORDER BY {partition} ASC, {order} ASC\
         ) AS b ON b.id = a.id SET a.{order} = b.src_order",
        table = table,
        order = order_column,
        partition = partition_column,
        marks = placeholders(partitions.len()),
        scoped = scoped,
    );
    Statement::new(sql, params)
}

/// Delete pivot rows matching `conditions` in fixed-size batches, cursoring
/// over the pivot's own surrogate id in ascending order to bound the
/// working set on large fan-outs.
pub(crate) async fn batched_delete<E: SqlExecutor>(
    exec: &E,
    table: &str,
    conditions: Vec<SqlExpr>,
) -> Result<u64, Error> {
    let mut total = 0u64;
    loop {
        let mut sql = format!("SELECT id FROM {table} WHERE ");
        let mut params = Vec::new();
        SqlExpr::And(conditions.clone()).render(&mut sql, &mut params);
        sql.push_str(&format!(" ORDER BY id ASC LIMIT {DELETE_BATCH_SIZE}"));

        let rows = exec.query(Statement::new(sql, params)).await?;
        let ids: Vec<i64> = rows
            .iter()
            .filter_map(|row| crate::value::row_get(row, "id").and_then(SqlValue::as_int))
            .collect();
        if ids.is_empty() {
            break;
        }

        let mut delete_sql = format!("DELETE FROM {table} WHERE ");
        let mut delete_params = Vec::new();
        SqlExpr::is_in("id".to_string(), int_params(&ids)).render(&mut delete_sql, &mut delete_params);
        exec.execute(Statement::new(delete_sql, delete_params)).await?;

        total += ids.len() as u64;
        if (ids.len() as u64) < DELETE_BATCH_SIZE {
            break;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{row, MockDriver};

    #[tokio::test]
    async fn test_window_strategy_sql() {
        let driver = MockDriver::new();
        resequence(
            &driver,
            true,
            "articles_tags_links",
            "article_id",
            "tag_order",
            &[1, 2],
            &[],
        )
        .await
        .unwrap();

        let statements = driver.statements();
        assert_eq!(statements.len(), 1);
        let sql = &statements[0].sql;
        assert!(sql.contains("ROW_NUMBER() OVER (PARTITION BY article_id ORDER BY tag_order)"));
        assert!(sql.contains("article_id IN (?, ?)"));
        assert_eq!(
            statements[0].params,
            vec![SqlValue::Int(1), SqlValue::Int(2)]
        );
    }

    #[tokio::test]
    async fn test_session_variable_fallback_sql() {
        let driver = MockDriver::new();
        resequence(
            &driver,
            false,
            "articles_tags_links",
            "article_id",
            "tag_order",
            &[1],
            &[],
        )
        .await
        .unwrap();

        let statements = driver.statements();
        assert_eq!(statements.len(), 1);
        let sql = &statements[0].sql;
        assert!(sql.contains("@n := IF(@p = article_id, @n + 1, 1)"));
        assert!(sql.contains("ORDER BY article_id ASC, tag_order ASC"));
        assert!(!sql.contains("ROW_NUMBER"));
    }

    #[tokio::test]
    async fn test_empty_partitions_issue_no_statement() {
        let driver = MockDriver::new();
        resequence(&driver, true, "t", "p", "o", &[], &[])
            .await
            .unwrap();
        assert!(driver.statements().is_empty());
    }

    #[tokio::test]
    async fn test_scope_restricts_shared_pivots() {
        let driver = MockDriver::new();
        resequence(
            &driver,
            true,
            "pages_morphs",
            "entity_id",
            "order",
            &[4],
            &[("field".to_string(), "content".to_string())],
        )
        .await
        .unwrap();

        let statements = driver.statements();
        assert!(statements[0].sql.contains("entity_id IN (?) AND field = ?"));
        assert_eq!(
            statements[0].params,
            vec![SqlValue::Int(4), SqlValue::Text("content".into())]
        );
    }

    #[tokio::test]
    async fn test_batched_delete_cursors_on_pivot_id() {
        let driver = MockDriver::new();
        // First batch full, second batch short, then done.
        let full: Vec<_> = (1..=DELETE_BATCH_SIZE as i64)
            .map(|i| row(&[("id", SqlValue::Int(i))]))
            .collect();
        driver.enqueue_rows(full);
        driver.enqueue_rows(vec![row(&[("id", SqlValue::Int(200))])]);

        let deleted = batched_delete(
            &driver,
            "articles_tags_links",
            vec![SqlExpr::eq("article_id".to_string(), 1i64)],
        )
        .await
        .unwrap();

        assert_eq!(deleted, DELETE_BATCH_SIZE + 1);
        let statements = driver.statements();
        // select, delete, select, delete
        assert_eq!(statements.len(), 4);
        assert!(statements[0]
            .sql
            .contains(&format!("ORDER BY id ASC LIMIT {DELETE_BATCH_SIZE}")));
        assert!(statements[1].sql.starts_with("DELETE FROM articles_tags_links"));
    }
}
