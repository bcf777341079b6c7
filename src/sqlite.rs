//! # SQLite support
//!
//! SQLite supports transactional DDL, so a failing script leaves nothing behind when it runs
//! inside a transaction (the default [TransactionMode::PerScript]).
//!
//! There are two ways to point a run at a SQLite database:
//!
//! - Pass a [rusqlite::Connection] you already hold. The session borrows it for the run.
//! - Use a [SqliteConnectionManager], which opens connections through an explicit
//!   [ConnectionPool] and configures a busy timeout so concurrent runs wait on each other
//!   instead of failing.
//!
//! ```
//! use scriptup::MigrationEngine;
//! use rusqlite::Connection;
//!
//! let engine = MigrationEngine::new()
//!     .with_script("Script0001", "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
//!     .with_script("Script0002", "ALTER TABLE users ADD COLUMN email TEXT");
//!
//! let mut conn = Connection::open_in_memory().unwrap();
//! let summary = engine.run(&mut conn).unwrap();
//! assert!(summary.is_successful());
//! assert_eq!(summary.applied(), vec!["Script0001", "Script0002"]);
//!
//! let mut stmt = conn.prepare("PRAGMA table_info(users)").unwrap();
//! let columns = stmt
//!     .query_map([], |row| row.get::<_, String>(1))
//!     .unwrap()
//!     .collect::<Result<Vec<_>, _>>()
//!     .unwrap();
//! assert_eq!(columns, vec!["id", "name", "email"]);
//! ```
//!
//! ## Pooling
//!
//! A [ConnectionPool] keeps idle connections per database path. It is an ordinary value: share
//! it between managers with an [Arc], and call [ConnectionPool::clear_all] to close every idle
//! connection, for instance before deleting a database file. An in-memory database
//! (`":memory:"`) lives exactly as long as its connection sits in the pool.

use crate::connection::{ConnectionManager, Session, TransactionMode};
use crate::dialect::Dialect;
use crate::error::Error;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};
use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default busy timeout applied to connections opened by a [SqliteConnectionManager].
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite quoting and capabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{index}")
    }

    fn table_exists_query(&self, schema: Option<&str>, table: &str) -> (String, Vec<String>) {
        let master = match schema {
            Some(schema) => format!("{}.sqlite_master", self.quote_identifier(schema)),
            None => "sqlite_master".to_string(),
        };
        (
            format!("SELECT COUNT(*) FROM {master} WHERE type = 'table' AND name = ?1"),
            vec![table.to_string()],
        )
    }

    fn supports_transactional_ddl(&self) -> bool {
        true
    }
}

/// Idle SQLite connections, keyed by database path.
#[derive(Default)]
pub struct ConnectionPool {
    idle: Mutex<HashMap<PathBuf, Vec<Connection>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check out a connection to `path`, reusing an idle one when available.
    /// The connection returns to the pool when the guard is dropped.
    pub fn acquire(&self, path: impl AsRef<Path>) -> Result<PooledConnection<'_>, Error> {
        let path = path.as_ref().to_path_buf();
        let reused = self.idle().get_mut(&path).and_then(Vec::pop);
        let conn = match reused {
            Some(conn) => conn,
            None => Connection::open(&path)?,
        };
        Ok(PooledConnection {
            pool: self,
            path,
            conn: Some(conn),
        })
    }

    /// Number of connections currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle().values().map(Vec::len).sum()
    }

    /// Close every idle connection. Returns how many were closed.
    ///
    /// Connections checked out at the time of the call are unaffected and return to the pool
    /// when released.
    pub fn clear_all(&self) -> Result<usize, Error> {
        let drained = self
            .idle()
            .drain()
            .flat_map(|(_, conns)| conns)
            .collect::<Vec<_>>();
        let closed = drained.len();
        for conn in drained {
            conn.close().map_err(|(_, e)| Error::from(e))?;
        }
        Ok(closed)
    }

    fn idle(&self) -> MutexGuard<'_, HashMap<PathBuf, Vec<Connection>>> {
        // a poisoned map only ever holds whole connections
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, path: PathBuf, conn: Connection) {
        self.idle().entry(path).or_default().push(conn);
    }
}

/// A connection checked out of a [ConnectionPool].
pub struct PooledConnection<'pool> {
    pool: &'pool ConnectionPool,
    path: PathBuf,
    conn: Option<Connection>,
}

impl std::fmt::Debug for PooledConnection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("path", &self.path)
            .finish()
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // only None while dropping
        self.conn.as_ref().expect("pooled connection already released")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // never hand out a connection with a transaction still open
            if conn.is_autocommit() {
                self.pool.release(std::mem::take(&mut self.path), conn);
            }
        }
    }
}

enum Handle<'a> {
    Pooled(PooledConnection<'a>),
    Borrowed(&'a mut Connection),
}

/// A session on a SQLite connection. Dropping it rolls back any open transaction.
pub struct SqliteSession<'a> {
    handle: Handle<'a>,
}

impl SqliteSession<'_> {
    pub fn connection(&self) -> &Connection {
        match &self.handle {
            Handle::Pooled(conn) => &**conn,
            Handle::Borrowed(conn) => &**conn,
        }
    }
}

impl Session for SqliteSession<'_> {
    fn dialect(&self) -> &dyn Dialect {
        &SqliteDialect
    }

    /// Takes the write lock up front (`BEGIN IMMEDIATE`), so checking the ledger and applying a
    /// script cannot interleave with another run.
    fn begin(&mut self) -> Result<(), Error> {
        self.connection().execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.connection().execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), Error> {
        self.connection().execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.connection().is_autocommit()
    }

    fn execute_batch(&mut self, sql: &str) -> Result<(), Error> {
        self.connection().execute_batch(sql)?;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[&str]) -> Result<u64, Error> {
        let affected = self
            .connection()
            .execute(sql, params_from_iter(params.iter()))?;
        Ok(affected as u64)
    }

    fn query_count(&mut self, sql: &str, params: &[&str]) -> Result<i64, Error> {
        let count = self
            .connection()
            .query_row(sql, params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(count)
    }

    fn query_rows(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Vec<String>>, Error> {
        let conn = self.connection();
        let mut stmt = conn.prepare(sql)?;
        let columns = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                (0..columns)
                    .map(|i| {
                        Ok(match row.get_ref(i)? {
                            ValueRef::Null => String::new(),
                            ValueRef::Integer(value) => value.to_string(),
                            ValueRef::Real(value) => value.to_string(),
                            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                                String::from_utf8_lossy(bytes).into_owned()
                            }
                        })
                    })
                    .collect::<rusqlite::Result<Vec<_>>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl Drop for SqliteSession<'_> {
    fn drop(&mut self) {
        if self.in_transaction() {
            if let Err(_error) = self.connection().execute_batch("ROLLBACK") {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_error, "Failed to roll back transaction on session release");
            }
        }
    }
}

/// A caller-owned connection. The session borrows it and leaves its settings alone.
impl ConnectionManager for Connection {
    type Session<'a>
        = SqliteSession<'a>
    where
        Self: 'a;

    fn open_session(&mut self) -> Result<SqliteSession<'_>, Error> {
        Ok(SqliteSession {
            handle: Handle::Borrowed(self),
        })
    }
}

/// Opens pooled connections to a SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteConnectionManager {
    path: PathBuf,
    pool: Arc<ConnectionPool>,
    busy_timeout: Duration,
    transaction_mode: TransactionMode,
}

impl SqliteConnectionManager {
    /// Manage connections to the database at `path`, with a pool of its own.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: Arc::new(ConnectionPool::new()),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            transaction_mode: TransactionMode::default(),
        }
    }

    /// An in-memory database, kept alive by the manager's pool between sessions.
    pub fn in_memory() -> Self {
        Self::new(":memory:")
    }

    /// Share an existing pool instead of owning one.
    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Set the busy timeout for SQLite database operations.
    /// This controls how long concurrent runs will wait for locks.
    /// Defaults to 30 seconds.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn with_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl ConnectionManager for SqliteConnectionManager {
    type Session<'a>
        = SqliteSession<'a>
    where
        Self: 'a;

    fn open_session(&mut self) -> Result<SqliteSession<'_>, Error> {
        let conn = self.pool.acquire(&self.path)?;
        // concurrent runs wait on each other instead of failing immediately
        conn.busy_timeout(self.busy_timeout)?;
        Ok(SqliteSession {
            handle: Handle::Pooled(conn),
        })
    }

    fn transaction_mode(&self) -> TransactionMode {
        self.transaction_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn dialect_queries_catalog_of_the_right_schema() {
        let (sql, params) = SqliteDialect.table_exists_query(None, "schema_versions");
        assert_eq!(
            sql,
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1"
        );
        assert_eq!(params, vec!["schema_versions".to_string()]);

        let (sql, _) = SqliteDialect.table_exists_query(Some("audit"), "schema_versions");
        assert!(sql.starts_with("SELECT COUNT(*) FROM \"audit\".sqlite_master"));
        assert_eq!(SqliteDialect.placeholder(2), "?2");
    }

    #[test]
    fn pool_reuses_idle_connections() {
        let pool = ConnectionPool::new();
        {
            let conn = pool.acquire(":memory:").unwrap();
            conn.execute_batch("CREATE TABLE kept (id INTEGER)").unwrap();
        }
        assert_eq!(pool.idle_count(), 1);

        // the same in-memory database comes back out of the pool
        let conn = pool.acquire(":memory:").unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'kept'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn clear_all_closes_idle_connections_only() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::new();
        let a = dir.path().join("a.db");
        let b = dir.path().join("b.db");
        drop(pool.acquire(&a).unwrap());
        drop(pool.acquire(&b).unwrap());
        let held = pool.acquire(&a).unwrap();
        assert_eq!(pool.idle_count(), 1);

        assert_eq!(pool.clear_all().unwrap(), 1);
        assert_eq!(pool.idle_count(), 0);

        drop(held);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.clear_all().unwrap(), 1);
    }

    #[test]
    fn connection_with_open_transaction_is_not_pooled() {
        let pool = ConnectionPool::new();
        {
            let conn = pool.acquire(":memory:").unwrap();
            conn.execute_batch("BEGIN").unwrap();
        }
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn dropping_a_session_rolls_back_open_transaction() {
        let mut conn = Connection::open_in_memory().unwrap();
        {
            let mut session = conn.open_session().unwrap();
            session.begin().unwrap();
            session
                .execute_batch("CREATE TABLE abandoned (id INTEGER)")
                .unwrap();
            assert!(session.in_transaction());
        }
        assert!(conn.is_autocommit());
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'abandoned'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn session_queries_read_rows_as_text() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut session = conn.open_session().unwrap();
        session
            .execute_batch("CREATE TABLE t (id INTEGER, name TEXT, score REAL)")
            .unwrap();
        assert_eq!(
            session
                .execute(
                    "INSERT INTO t (id, name, score) VALUES (1, ?1, 2.5)",
                    &["alice"]
                )
                .unwrap(),
            1
        );
        session
            .execute("INSERT INTO t (id, name) VALUES (2, NULL)", &[])
            .unwrap();

        assert_eq!(
            session
                .query_count("SELECT COUNT(*) FROM t WHERE name = ?1", &["alice"])
                .unwrap(),
            1
        );
        assert_eq!(
            session
                .query_rows("SELECT id, name, score FROM t ORDER BY id", &[])
                .unwrap(),
            vec![
                vec!["1".to_string(), "alice".to_string(), "2.5".to_string()],
                vec!["2".to_string(), String::new(), String::new()],
            ]
        );
    }

    #[test]
    fn manager_sessions_share_the_pooled_database() {
        let mut manager = SqliteConnectionManager::in_memory();
        {
            let mut session = manager.open_session().unwrap();
            session
                .execute_batch("CREATE TABLE shared (id INTEGER)")
                .unwrap();
        }
        let mut session = manager.open_session().unwrap();
        assert_eq!(
            session
                .query_count(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = 'shared'",
                    &[]
                )
                .unwrap(),
            1
        );
    }

    #[test]
    fn manager_applies_busy_timeout() {
        let dir = TempDir::new().unwrap();
        let mut manager = SqliteConnectionManager::new(dir.path().join("busy.db"))
            .with_busy_timeout(Duration::from_millis(1234));
        let session = manager.open_session().unwrap();
        let timeout: i64 = session
            .connection()
            .query_row("PRAGMA busy_timeout", [], |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, 1234);
    }
}
