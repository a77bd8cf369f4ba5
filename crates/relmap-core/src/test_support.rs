//! In-memory driver double for exercising the engine without a database.
//!
//! The mock records every statement it receives and replays queued row
//! sets for `query` calls, so tests can assert on the exact statement
//! sequence the engine emits.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{ExecResult, SqlDriver, SqlExecutor, Statement, TransactionHandle};
use crate::error::Error;
use crate::value::{Row, SqlValue};

#[derive(Default)]
struct MockState {
    log: Mutex<Vec<Statement>>,
    responses: Mutex<VecDeque<Result<Vec<Row>, String>>>,
    next_insert_id: Mutex<i64>,
}

impl MockState {
    fn record(&self, stmt: &Statement) {
        self.log.lock().push(stmt.clone());
    }

    fn pop_response(&self) -> Result<Vec<Row>, Error> {
        match self.responses.lock().pop_front() {
            Some(Ok(rows)) => Ok(rows),
            Some(Err(message)) => Err(Error::Driver(message)),
            None => Ok(Vec::new()),
        }
    }
}

/// Capability flags the mock reports.
#[derive(Debug, Clone, Copy)]
struct MockCaps {
    window_functions: bool,
    foreign_keys: bool,
    returning: bool,
}

/// A scripted in-memory [`SqlDriver`].
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<MockState>,
    caps: MockCaps,
}

impl MockDriver {
    /// Create a mock with window functions on and the other flags off.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
            caps: MockCaps {
                window_functions: true,
                foreign_keys: false,
                returning: false,
            },
        }
    }

    /// Toggle window-function support.
    pub fn with_window_functions(mut self, enabled: bool) -> Self {
        self.caps.window_functions = enabled;
        self
    }

    /// Toggle enforced foreign keys.
    pub fn with_foreign_keys(mut self, enabled: bool) -> Self {
        self.caps.foreign_keys = enabled;
        self
    }

    /// Toggle `RETURNING` support.
    pub fn with_returning(mut self, enabled: bool) -> Self {
        self.caps.returning = enabled;
        self
    }

    /// Queue a row set for the next `query` call.
    pub fn enqueue_rows(&self, rows: Vec<Row>) {
        self.state.responses.lock().push_back(Ok(rows));
    }

    /// Queue an error for the next `query` call.
    pub fn enqueue_error(&self, message: impl Into<String>) {
        self.state.responses.lock().push_back(Err(message.into()));
    }

    /// All statements seen so far, including transaction markers.
    pub fn statements(&self) -> Vec<Statement> {
        self.state.log.lock().clone()
    }

    /// Statements whose SQL contains `needle`.
    pub fn statements_matching(&self, needle: &str) -> Vec<Statement> {
        self.statements()
            .into_iter()
            .filter(|s| s.sql.contains(needle))
            .collect()
    }

    /// Forget recorded statements.
    pub fn clear_log(&self) {
        self.state.log.lock().clear();
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqlExecutor for MockDriver {
    async fn query(&self, stmt: Statement) -> Result<Vec<Row>, Error> {
        self.state.record(&stmt);
        self.state.pop_response()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, Error> {
        self.state.record(&stmt);
        let mut next = self.state.next_insert_id.lock();
        *next += 1;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: Some(*next),
        })
    }
}

impl SqlDriver for MockDriver {
    type Tx = MockTransaction;

    async fn begin(&self) -> Result<Self::Tx, Error> {
        self.state.record(&Statement::new("BEGIN", vec![]));
        Ok(MockTransaction {
            state: Arc::clone(&self.state),
        })
    }

    fn uses_foreign_keys(&self) -> bool {
        self.caps.foreign_keys
    }

    fn supports_window_functions(&self) -> bool {
        self.caps.window_functions
    }

    fn use_returning(&self) -> bool {
        self.caps.returning
    }
}

/// Transaction handle sharing the parent mock's statement log.
pub struct MockTransaction {
    state: Arc<MockState>,
}

impl SqlExecutor for MockTransaction {
    async fn query(&self, stmt: Statement) -> Result<Vec<Row>, Error> {
        self.state.record(&stmt);
        self.state.pop_response()
    }

    async fn execute(&self, stmt: Statement) -> Result<ExecResult, Error> {
        self.state.record(&stmt);
        let mut next = self.state.next_insert_id.lock();
        *next += 1;
        Ok(ExecResult {
            rows_affected: 1,
            last_insert_id: Some(*next),
        })
    }
}

impl TransactionHandle for MockTransaction {
    async fn commit(self) -> Result<(), Error> {
        self.state.record(&Statement::new("COMMIT", vec![]));
        Ok(())
    }

    async fn rollback(self) -> Result<(), Error> {
        self.state.record(&Statement::new("ROLLBACK", vec![]));
        Ok(())
    }
}

/// Build a row from column/value pairs.
pub fn row(pairs: &[(&str, SqlValue)]) -> Row {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_string(), value.clone()))
        .collect()
}
