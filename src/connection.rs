//! Sessions against the target database.
//!
//! A [ConnectionManager] hands out one [Session] per run. The session is borrowed from the
//! manager, so it can never outlive it, and backends release the underlying connection when the
//! session is dropped, rolling back any transaction still open. Every exit path of a run, early
//! failures included, therefore leaves nothing behind.

use crate::dialect::Dialect;
use crate::error::Error;

/// How the engine wraps scripts in transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionMode {
    /// Scripts run outside any transaction. A failing script may leave partial effects behind.
    None,
    /// Each script, together with its ledger entry, runs in its own transaction.
    #[default]
    PerScript,
    /// The whole run is one transaction: a failure undoes every script applied by the run.
    SingleTransaction,
}

/// An open handle to the target database.
pub trait Session {
    fn dialect(&self) -> &dyn Dialect;

    fn begin(&mut self) -> Result<(), Error>;

    fn commit(&mut self) -> Result<(), Error>;

    fn rollback(&mut self) -> Result<(), Error>;

    fn in_transaction(&self) -> bool;

    /// Execute raw SQL text, which may hold several statements.
    fn execute_batch(&mut self, sql: &str) -> Result<(), Error>;

    /// Execute one parameterised statement, returning the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[&str]) -> Result<u64, Error>;

    /// Run a query whose first column of the first row is an integer count.
    fn query_count(&mut self, sql: &str, params: &[&str]) -> Result<i64, Error>;

    /// Run a query and read every column of every row as text. NULL reads as an empty string.
    fn query_rows(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Vec<String>>, Error>;
}

/// Opens sessions against one target database.
pub trait ConnectionManager {
    type Session<'a>: Session
    where
        Self: 'a;

    fn open_session(&mut self) -> Result<Self::Session<'_>, Error>;

    fn transaction_mode(&self) -> TransactionMode {
        TransactionMode::PerScript
    }
}
