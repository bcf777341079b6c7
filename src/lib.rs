//! # scriptup
//!
//! `scriptup` applies plain SQL scripts to a database, each exactly once, and keeps a ledger of
//! which scripts have been applied.
//!
//! Scripts are named; a run sorts them by name, skips those already in the ledger and applies
//! the rest one at a time, stopping at the first failure. The outcome of every script considered
//! is reported in a [RunSummary].
//!
//! ## Example
//!
//! ```
//! use scriptup::{MigrationEngine, RunSummary, ScriptOutcome, ScriptResult};
//! use rusqlite::Connection;
//!
//! let engine = MigrationEngine::new()
//!     .with_script("Script0001", "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
//!     .with_script("Script0002", "ALTER TABLE users ADD COLUMN email TEXT");
//!
//! // run against a connection, receiving a summary of the results
//! let mut conn = Connection::open_in_memory().unwrap();
//! let summary = engine.run(&mut conn).unwrap();
//! assert_eq!(
//!     summary,
//!     RunSummary {
//!         results: vec![
//!             ScriptResult {
//!                 name: "Script0001".to_string(),
//!                 outcome: ScriptOutcome::Succeeded,
//!             },
//!             ScriptResult {
//!                 name: "Script0002".to_string(),
//!                 outcome: ScriptOutcome::Succeeded,
//!             },
//!         ],
//!         ledger_created: true,
//!     }
//! );
//!
//! // the ledger lives in the same database
//! let applied: i64 = conn
//!     .query_row("SELECT COUNT(*) FROM schema_versions", [], |row| row.get(0))
//!     .unwrap();
//! assert_eq!(applied, 2);
//! ```
//!
//! ## Features
//!
//! - `sqlite` (default): SQLite backend through `rusqlite`.
//! - `postgres`: PostgreSQL backend through the `postgres` crate.
//! - `tracing` (default): structured logs through `tracing`. No subscriber is installed.
//! - `testing`: a disposable SQLite database for tests, in the `testing` module.

mod connection;
mod dialect;
mod engine;
mod error;
mod journal;
mod provider;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(all(feature = "sqlite", any(test, feature = "testing")))]
pub mod testing;

#[cfg(all(test, feature = "postgres"))]
pub(crate) mod test_postgres;

pub use connection::{ConnectionManager, Session, TransactionMode};
pub use dialect::Dialect;
pub use engine::{MigrationEngine, RunSummary, ScriptOutcome, ScriptResult};
pub use error::Error;
pub use journal::{Journal, JournalEntry, NullJournal, TableJournal, DEFAULT_JOURNAL_TABLE};
pub use provider::{
    FileSystemScriptProvider, Script, ScriptProvider, ScriptSource, StaticScriptProvider,
};
