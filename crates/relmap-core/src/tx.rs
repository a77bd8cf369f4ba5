//! Explicit transaction scoping.
//!
//! Transaction state is passed, never ambient: every entity-manager and
//! query execution takes a [`Conn`] that is either the root driver or a
//! live transaction handle. [`with_transaction`] is the thin helper used at
//! the outermost boundary; re-entrant calls that already hold a transaction
//! scope flatten into it, so only the outermost scope commits or rolls back.

use futures::future::BoxFuture;

use crate::driver::{ExecResult, SqlDriver, SqlExecutor, Statement, TransactionHandle};
use crate::error::Error;
use crate::value::Row;

/// A connection scope: the root driver or a live transaction.
pub enum Conn<'a, D: SqlDriver> {
    /// Outside any transaction; statements auto-commit.
    Driver(&'a D),
    /// Inside a transaction opened by the caller.
    Tx(&'a D::Tx),
}

impl<'a, D: SqlDriver> Clone for Conn<'a, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, D: SqlDriver> Copy for Conn<'a, D> {}

impl<'a, D: SqlDriver> Conn<'a, D> {
    /// Whether this scope is inside a transaction.
    pub fn in_transaction(&self) -> bool {
        matches!(self, Conn::Tx(_))
    }
}

impl<'a, D: SqlDriver> SqlExecutor for Conn<'a, D> {
    async fn query(&self, stmt: Statement) -> Result<Vec<Row>, Error> {
        match self {
            Conn::Driver(d) => d.query(stmt).await,
            Conn::Tx(t) => t.query(stmt).await,
        }
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, Error> {
        match self {
            Conn::Driver(d) => d.execute(stmt).await,
            Conn::Tx(t) => t.execute(stmt).await,
        }
    }
}

/// Run `f` inside a transaction scope.
///
/// If `conn` already carries a transaction the call flattens: `f` runs in
/// the existing scope and commit/rollback stay with the outermost caller.
/// Otherwise a transaction is opened, committed on `Ok` and rolled back on
/// `Err`. A rollback failure is ignored in favor of the original error.
pub async fn with_transaction<'a, D, T, F>(
    driver: &'a D,
    conn: Conn<'a, D>,
    f: F,
) -> Result<T, Error>
where
    D: SqlDriver,
    F: for<'t> FnOnce(Conn<'t, D>) -> BoxFuture<'t, Result<T, Error>>,
{
    match conn {
        Conn::Tx(_) => f(conn).await,
        Conn::Driver(_) => {
            let tx = driver.begin().await?;
            match f(Conn::Tx(&tx)).await {
                Ok(value) => {
                    tx.commit().await?;
                    Ok(value)
                }
                Err(err) => {
                    let _ = tx.rollback().await;
                    Err(err)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockDriver;
    use crate::value::SqlValue;

    fn stmt(sql: &str) -> Statement {
        Statement::new(sql, vec![])
    }

    #[tokio::test]
    async fn test_outermost_scope_commits() {
        let driver = MockDriver::new();
        let result = with_transaction(&driver, Conn::Driver(&driver), |conn| {
            Box::pin(async move {
                conn.execute(stmt("UPDATE t SET a = 1")).await?;
                Ok(7)
            })
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        let sql: Vec<String> = driver.statements().into_iter().map(|s| s.sql).collect();
        assert_eq!(sql, vec!["BEGIN", "UPDATE t SET a = 1", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_nested_scope_flattens() {
        let driver = MockDriver::new();
        let driver_clone = driver.clone();
        with_transaction(&driver, Conn::Driver(&driver), move |conn| {
            Box::pin(async move {
                conn.execute(stmt("UPDATE t SET a = 1")).await?;
                // Re-entrant request: must not open a second transaction.
                with_transaction(&driver_clone, conn, |inner| {
                    Box::pin(async move {
                        inner.execute(stmt("UPDATE t SET b = 2")).await?;
                        Ok(())
                    })
                })
                .await
            })
        })
        .await
        .unwrap();

        let sql: Vec<String> = driver.statements().into_iter().map(|s| s.sql).collect();
        assert_eq!(
            sql,
            vec!["BEGIN", "UPDATE t SET a = 1", "UPDATE t SET b = 2", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_error_rolls_back_whole_scope() {
        let driver = MockDriver::new();
        let err = with_transaction(&driver, Conn::Driver(&driver), |conn| {
            Box::pin(async move {
                conn.execute(Statement::new(
                    "INSERT INTO t (a) VALUES (?)",
                    vec![SqlValue::Int(1)],
                ))
                .await?;
                Err::<(), _>(Error::Driver("unique violation".into()))
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Driver(_)));
        let sql: Vec<String> = driver.statements().into_iter().map(|s| s.sql).collect();
        assert_eq!(sql.last().map(String::as_str), Some("ROLLBACK"));
        assert!(!sql.contains(&"COMMIT".to_string()));
    }
}
