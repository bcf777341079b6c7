//! Testing utilities for exercising scripts against a throwaway SQLite database.
//!
//! ```
//! use scriptup::testing::TemporarySqliteDatabase;
//! use scriptup::MigrationEngine;
//!
//! # fn main() -> Result<(), scriptup::Error> {
//! let db = TemporarySqliteDatabase::new("test.db")?;
//! let summary = MigrationEngine::new()
//!     .with_script("Script0001", "CREATE TABLE IF NOT EXISTS Foo (Id int)")
//!     .run(&mut db.connection_manager())?;
//! assert!(summary.is_successful());
//!
//! let runner = db.sql_runner();
//! assert!(runner.table_exists("Foo")?);
//! runner.execute("INSERT INTO Foo VALUES (1)")?;
//! assert_eq!(runner.query_count("SELECT COUNT(*) FROM Foo")?, 1);
//!
//! // closes pooled connections and deletes the file
//! db.close()?;
//! # Ok(())
//! # }
//! ```

use crate::connection::{ConnectionManager, Session};
use crate::dialect::Dialect;
use crate::error::Error;
use crate::sqlite::{ConnectionPool, SqliteConnectionManager, SqliteDialect};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A SQLite database file in a fresh temporary directory.
///
/// Every [SqliteConnectionManager] handed out shares one [ConnectionPool], so the fixture knows
/// about every connection it has to close. Dropping the fixture closes them and deletes the
/// directory; [TemporarySqliteDatabase::close] does the same but reports failures.
#[derive(Debug)]
pub struct TemporarySqliteDatabase {
    dir: Option<TempDir>,
    path: PathBuf,
    pool: Arc<ConnectionPool>,
}

impl TemporarySqliteDatabase {
    /// Create an empty database file called `name`.
    pub fn new(name: &str) -> Result<Self, Error> {
        let dir = tempfile::Builder::new()
            .prefix("scriptup-")
            .tempdir()
            .map_err(|source| Error::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        let path = dir.path().join(name);
        let pool = Arc::new(ConnectionPool::new());
        // opening creates the file; the connection goes straight back to the pool
        pool.acquire(&path)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(path = %path.display(), "Created temporary database");

        Ok(Self {
            dir: Some(dir),
            path,
            pool,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// A manager for this database, sharing the fixture's pool.
    pub fn connection_manager(&self) -> SqliteConnectionManager {
        SqliteConnectionManager::new(&self.path).with_pool(Arc::clone(&self.pool))
    }

    pub fn sql_runner(&self) -> AdHocSqlRunner<'_> {
        AdHocSqlRunner { database: self }
    }

    /// Close every pooled connection and delete the database.
    pub fn close(mut self) -> Result<(), Error> {
        self.cleanup()
    }

    fn cleanup(&mut self) -> Result<(), Error> {
        self.pool.clear_all()?;
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            dir.close().map_err(|source| Error::Io { path, source })?;
        }
        Ok(())
    }
}

impl Drop for TemporarySqliteDatabase {
    fn drop(&mut self) {
        if let Err(_error) = self.cleanup() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_error, "Failed to remove temporary database");
        }
    }
}

/// Runs one-off SQL against a [TemporarySqliteDatabase], outside of any script.
///
/// Each call opens its own session, so nothing here is transactional across calls.
#[derive(Debug, Clone, Copy)]
pub struct AdHocSqlRunner<'a> {
    database: &'a TemporarySqliteDatabase,
}

impl AdHocSqlRunner<'_> {
    /// Execute raw SQL, which may hold several statements.
    pub fn execute(&self, sql: &str) -> Result<(), Error> {
        let mut manager = self.database.connection_manager();
        let mut session = manager.open_session()?;
        session.execute_batch(sql)
    }

    /// Run a query returning a single integer, such as `SELECT COUNT(*) ...`.
    pub fn query_count(&self, sql: &str) -> Result<i64, Error> {
        let mut manager = self.database.connection_manager();
        let mut session = manager.open_session()?;
        session.query_count(sql, &[])
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, Error> {
        let (sql, params) = SqliteDialect.table_exists_query(None, table);
        let params = params.iter().map(String::as_str).collect::<Vec<_>>();
        let mut manager = self.database.connection_manager();
        let mut session = manager.open_session()?;
        Ok(session.query_count(&sql, &params)? > 0)
    }

    /// Column names of a table, in declaration order. Empty if the table does not exist.
    pub fn column_names(&self, table: &str) -> Result<Vec<String>, Error> {
        let mut manager = self.database.connection_manager();
        let mut session = manager.open_session()?;
        let rows = session.query_rows(
            "SELECT name FROM pragma_table_info(?1) ORDER BY cid",
            &[table],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next())
            .collect())
    }
}
