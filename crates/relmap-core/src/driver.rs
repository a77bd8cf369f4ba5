//! SQL driver collaborator interfaces.
//!
//! The engine never talks to a database directly. It emits parametrized
//! statements against the [`SqlExecutor`] trait and reads dialect
//! capabilities from [`SqlDriver`]; connection pooling and raw execution
//! live behind these traits in the embedding application.

use crate::error::Error;
use crate::value::{Row, SqlValue};

/// A single parametrized SQL statement.
///
/// Placeholders use `?` in parameter order; drivers for dialects with
/// positional placeholders (`$1`, ...) rewrite them on execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// The SQL text.
    pub sql: String,
    /// Bound parameters, in placeholder order.
    pub params: Vec<SqlValue>,
}

impl Statement {
    /// Create a statement.
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Result of a write statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
    /// Number of rows the statement touched.
    pub rows_affected: u64,
    /// Identifier generated for an inserted row, when the dialect reports one.
    pub last_insert_id: Option<i64>,
}

/// Anything statements can be executed against: the root driver or a live
/// transaction handle.
pub trait SqlExecutor: Sync {
    /// Run a statement that returns rows.
    fn query(
        &self,
        stmt: Statement,
    ) -> impl std::future::Future<Output = Result<Vec<Row>, Error>> + Send;

    /// Run a statement that returns an affected-row count.
    fn execute(
        &self,
        stmt: Statement,
    ) -> impl std::future::Future<Output = Result<ExecResult, Error>> + Send;
}

/// The root driver: an executor that can open transactions and describes
/// its dialect's capabilities.
pub trait SqlDriver: SqlExecutor {
    /// Transaction handle type produced by [`SqlDriver::begin`].
    type Tx: TransactionHandle;

    /// Open a transaction.
    fn begin(&self) -> impl std::future::Future<Output = Result<Self::Tx, Error>> + Send;

    /// Whether the dialect enforces foreign keys with `ON DELETE CASCADE`.
    ///
    /// When true, the entity manager skips explicit join-table cleanup on
    /// entity deletion.
    fn uses_foreign_keys(&self) -> bool {
        false
    }

    /// Whether the dialect supports window functions.
    ///
    /// Selects the order-column re-sequencing strategy.
    fn supports_window_functions(&self) -> bool {
        true
    }

    /// Whether inserts should use a `RETURNING` clause to read generated ids.
    fn use_returning(&self) -> bool {
        false
    }

    /// Dialect-specific error transform, applied to storage errors before
    /// they are re-thrown. The engine never retries or swallows the result.
    fn transform_error(&self, err: Error) -> Error {
        err
    }
}

/// A live transaction. Dropping a handle without calling either method
/// leaves the outcome to the driver (typically rollback).
pub trait TransactionHandle: SqlExecutor + Sized + Send {
    /// Commit the transaction.
    fn commit(self) -> impl std::future::Future<Output = Result<(), Error>> + Send;

    /// Roll the transaction back.
    fn rollback(self) -> impl std::future::Future<Output = Result<(), Error>> + Send;
}
