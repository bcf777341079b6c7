//! The ledger of applied scripts.

use crate::connection::Session;
use crate::error::Error;
use chrono::{DateTime, SecondsFormat, Utc};

/// Default name of the ledger table.
pub const DEFAULT_JOURNAL_TABLE: &str = "schema_versions";

/// One row of the ledger: a script that has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub script_name: String,
    pub applied_at: DateTime<Utc>,
}

/// Records which scripts have been applied to a database.
///
/// The ledger is append-only and holds at most one entry per script name.
pub trait Journal {
    /// Human readable location of the ledger, used in errors and logs.
    fn describe(&self) -> String;

    /// Create the ledger if it does not exist yet. Returns true if this call created it; a
    /// concurrent run creating it first makes this call return false.
    fn ensure_ledger_exists(&self, session: &mut dyn Session) -> Result<bool, Error>;

    /// Whether a script with exactly this name has been recorded.
    fn has_been_applied(&self, session: &mut dyn Session, script_name: &str)
        -> Result<bool, Error>;

    /// Record a script as applied. Callers must only do so once the script ran without error.
    fn record_applied(
        &self,
        session: &mut dyn Session,
        script_name: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<(), Error>;

    /// Every recorded script, ordered by application time then name.
    fn applied_scripts(&self, session: &mut dyn Session) -> Result<Vec<JournalEntry>, Error>;
}

/// A ledger kept in a table of the target database.
///
/// Schema: `script_name TEXT PRIMARY KEY NOT NULL, applied_at TEXT NOT NULL`, where
/// `applied_at` is an RFC 3339 UTC timestamp with microsecond precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableJournal {
    schema: Option<String>,
    table: String,
}

impl Default for TableJournal {
    fn default() -> Self {
        Self::new(DEFAULT_JOURNAL_TABLE)
    }
}

impl TableJournal {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
        }
    }

    /// Keep the ledger in a specific schema (an attached database for SQLite).
    ///
    /// SQLite resolves an unqualified table name through every attached database, so a journal
    /// without a schema can still find a ledger kept in an attached one.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    fn quoted_table(&self, session: &dyn Session) -> String {
        session
            .dialect()
            .quote_table(self.schema.as_deref(), &self.table)
    }

    fn ledger_error(&self, source: Error) -> Error {
        Error::ledger(self.describe(), source)
    }

    fn table_exists(&self, session: &mut dyn Session) -> Result<bool, Error> {
        let (sql, params) = session
            .dialect()
            .table_exists_query(self.schema.as_deref(), &self.table);
        let params = params.iter().map(String::as_str).collect::<Vec<_>>();
        Ok(session.query_count(&sql, &params)? > 0)
    }
}

impl Journal for TableJournal {
    fn describe(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.table),
            None => self.table.clone(),
        }
    }

    fn ensure_ledger_exists(&self, session: &mut dyn Session) -> Result<bool, Error> {
        let existed = self
            .table_exists(session)
            .map_err(|e| self.ledger_error(e))?;
        if existed {
            return Ok(false);
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Creating ledger table: {}", self.describe());

        let sql = format!(
            "CREATE TABLE {} (script_name TEXT PRIMARY KEY NOT NULL, applied_at TEXT NOT NULL)",
            self.quoted_table(session)
        );
        match session.execute_batch(&sql) {
            Ok(()) => Ok(true),
            // another run created it between the check and here
            Err(_) if self.table_exists(session).unwrap_or(false) => Ok(false),
            Err(e) => Err(self.ledger_error(e)),
        }
    }

    fn has_been_applied(
        &self,
        session: &mut dyn Session,
        script_name: &str,
    ) -> Result<bool, Error> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE script_name = {}",
            self.quoted_table(session),
            session.dialect().placeholder(1)
        );
        let count = session
            .query_count(&sql, &[script_name])
            .map_err(|e| self.ledger_error(e))?;
        Ok(count > 0)
    }

    fn record_applied(
        &self,
        session: &mut dyn Session,
        script_name: &str,
        applied_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let dialect = session.dialect();
        let sql = format!(
            "INSERT INTO {} (script_name, applied_at) VALUES ({}, {})",
            self.quoted_table(session),
            dialect.placeholder(1),
            dialect.placeholder(2)
        );
        let applied_at = applied_at.to_rfc3339_opts(SecondsFormat::Micros, true);
        session
            .execute(&sql, &[script_name, &applied_at])
            .map_err(|e| self.ledger_error(e))?;
        Ok(())
    }

    fn applied_scripts(&self, session: &mut dyn Session) -> Result<Vec<JournalEntry>, Error> {
        if !self
            .table_exists(session)
            .map_err(|e| self.ledger_error(e))?
        {
            return Ok(vec![]);
        }

        let sql = format!(
            "SELECT script_name, applied_at FROM {} ORDER BY applied_at, script_name",
            self.quoted_table(session)
        );
        let rows = session
            .query_rows(&sql, &[])
            .map_err(|e| self.ledger_error(e))?;

        rows.into_iter()
            .map(|row| {
                let [script_name, applied_at] = <[String; 2]>::try_from(row).map_err(|row| {
                    self.ledger_error(Error::Generic(format!(
                        "expected 2 ledger columns, found {}",
                        row.len()
                    )))
                })?;
                let applied_at = DateTime::parse_from_rfc3339(&applied_at)
                    .map_err(|e| {
                        self.ledger_error(Error::Generic(format!(
                            "Failed to parse applied_at '{}' of script {}: {}",
                            applied_at, script_name, e
                        )))
                    })?
                    .with_timezone(&Utc);
                Ok(JournalEntry {
                    script_name,
                    applied_at,
                })
            })
            .collect()
    }
}

/// A journal that records nothing: every script runs on every invocation.
///
/// Useful for scripts that must always be re-applied, such as views or stored procedures
/// written with `CREATE OR REPLACE`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullJournal;

impl Journal for NullJournal {
    fn describe(&self) -> String {
        "(none)".to_string()
    }

    fn ensure_ledger_exists(&self, _session: &mut dyn Session) -> Result<bool, Error> {
        Ok(false)
    }

    fn has_been_applied(
        &self,
        _session: &mut dyn Session,
        _script_name: &str,
    ) -> Result<bool, Error> {
        Ok(false)
    }

    fn record_applied(
        &self,
        _session: &mut dyn Session,
        _script_name: &str,
        _applied_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn applied_scripts(&self, _session: &mut dyn Session) -> Result<Vec<JournalEntry>, Error> {
        Ok(vec![])
    }
}

#[cfg(all(test, feature = "sqlite"))]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use rusqlite::Connection;

    #[test]
    fn ensure_ledger_exists_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        let journal = TableJournal::default();
        {
            let mut session = conn.open_session().unwrap();
            assert!(journal.ensure_ledger_exists(&mut session).unwrap());
            assert!(!journal.ensure_ledger_exists(&mut session).unwrap());
        }
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_versions'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn records_and_reports_applied_scripts() {
        let mut conn = Connection::open_in_memory().unwrap();
        let journal = TableJournal::new("journal");
        let mut session = conn.open_session().unwrap();
        journal.ensure_ledger_exists(&mut session).unwrap();

        assert!(!journal.has_been_applied(&mut session, "Script0001").unwrap());
        let applied_at = DateTime::parse_from_rfc3339("2024-03-01T10:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        journal
            .record_applied(&mut session, "Script0001", applied_at)
            .unwrap();

        assert!(journal.has_been_applied(&mut session, "Script0001").unwrap());
        // names match exactly
        assert!(!journal.has_been_applied(&mut session, "script0001").unwrap());
        assert_eq!(
            journal.applied_scripts(&mut session).unwrap(),
            vec![JournalEntry {
                script_name: "Script0001".to_string(),
                applied_at,
            }]
        );
    }

    #[test]
    fn ledger_rejects_a_second_entry_for_the_same_script() {
        let mut conn = Connection::open_in_memory().unwrap();
        let journal = TableJournal::default();
        let mut session = conn.open_session().unwrap();
        journal.ensure_ledger_exists(&mut session).unwrap();
        journal
            .record_applied(&mut session, "Script0001", Utc::now())
            .unwrap();
        let err = journal
            .record_applied(&mut session, "Script0001", Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::LedgerUnavailable { ref table, .. } if table == "schema_versions"));
    }

    #[test]
    fn applied_scripts_on_missing_ledger_is_empty() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut session = conn.open_session().unwrap();
        assert_eq!(
            TableJournal::default()
                .applied_scripts(&mut session)
                .unwrap(),
            vec![]
        );
    }

    #[test]
    fn ledger_in_attached_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("ATTACH DATABASE ':memory:' AS audit")
            .unwrap();
        let journal = TableJournal::new("schema_versions").with_schema("audit");
        assert_eq!(journal.describe(), "audit.schema_versions");

        let mut session = conn.open_session().unwrap();
        assert!(journal.ensure_ledger_exists(&mut session).unwrap());
        journal
            .record_applied(&mut session, "Script0001", Utc::now())
            .unwrap();
        assert!(journal.has_been_applied(&mut session, "Script0001").unwrap());
        drop(session);

        // the main schema has no ledger at all
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM main.sqlite_master WHERE name = 'schema_versions'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    /// Reports the ledger as missing on the first existence check only, as if another run
    /// created it right after.
    struct LateLedgerSession<'a> {
        inner: crate::sqlite::SqliteSession<'a>,
        hide_ledger: bool,
    }

    impl Session for LateLedgerSession<'_> {
        fn dialect(&self) -> &dyn crate::dialect::Dialect {
            self.inner.dialect()
        }
        fn begin(&mut self) -> Result<(), Error> {
            self.inner.begin()
        }
        fn commit(&mut self) -> Result<(), Error> {
            self.inner.commit()
        }
        fn rollback(&mut self) -> Result<(), Error> {
            self.inner.rollback()
        }
        fn in_transaction(&self) -> bool {
            self.inner.in_transaction()
        }
        fn execute_batch(&mut self, sql: &str) -> Result<(), Error> {
            self.inner.execute_batch(sql)
        }
        fn execute(&mut self, sql: &str, params: &[&str]) -> Result<u64, Error> {
            self.inner.execute(sql, params)
        }
        fn query_count(&mut self, sql: &str, params: &[&str]) -> Result<i64, Error> {
            if std::mem::take(&mut self.hide_ledger) {
                return Ok(0);
            }
            self.inner.query_count(sql, params)
        }
        fn query_rows(&mut self, sql: &str, params: &[&str]) -> Result<Vec<Vec<String>>, Error> {
            self.inner.query_rows(sql, params)
        }
    }

    #[test]
    fn ledger_created_by_a_concurrent_run_is_not_claimed() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE schema_versions (script_name TEXT PRIMARY KEY NOT NULL, applied_at TEXT NOT NULL)",
        )
        .unwrap();
        let mut session = LateLedgerSession {
            inner: conn.open_session().unwrap(),
            hide_ledger: true,
        };
        assert!(!TableJournal::default()
            .ensure_ledger_exists(&mut session)
            .unwrap());
    }

    #[test]
    fn ledger_creation_failure_is_reported() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE VIEW schema_versions AS SELECT 1 AS script_name")
            .unwrap();
        let mut session = conn.open_session().unwrap();
        let err = TableJournal::default()
            .ensure_ledger_exists(&mut session)
            .unwrap_err();
        assert!(matches!(err, Error::LedgerUnavailable { ref table, .. } if table == "schema_versions"));
    }

    #[test]
    fn null_journal_never_reports_anything_applied() {
        let mut conn = Connection::open_in_memory().unwrap();
        let mut session = conn.open_session().unwrap();
        let journal = NullJournal;
        assert!(!journal.ensure_ledger_exists(&mut session).unwrap());
        journal
            .record_applied(&mut session, "Script0001", Utc::now())
            .unwrap();
        assert!(!journal.has_been_applied(&mut session, "Script0001").unwrap());
        assert!(journal.applied_scripts(&mut session).unwrap().is_empty());
    }
}
