//! The migration engine: applies pending scripts in order and reports what happened.

use crate::connection::{ConnectionManager, Session, TransactionMode};
use crate::error::Error;
use crate::journal::{Journal, JournalEntry, TableJournal};
use crate::provider::{FileSystemScriptProvider, Script, ScriptProvider, StaticScriptProvider};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// What happened to one script during a run.
#[derive(Debug, PartialEq)]
pub enum ScriptOutcome {
    /// Already recorded in the ledger; nothing was executed.
    Skipped,
    /// Executed and recorded.
    Succeeded,
    /// Execution or recording failed. The run stopped here.
    Failed(Error),
    /// Executed without error, then undone together with the rest of the run because a later
    /// script failed under [TransactionMode::SingleTransaction].
    RolledBack,
}

/// The outcome of one script, by name.
#[derive(Debug, PartialEq)]
pub struct ScriptResult {
    pub name: String,
    pub outcome: ScriptOutcome,
}

/// A report of one run.
///
/// `results` follows execution order. Scripts after a failure were never attempted and are
/// absent.
#[derive(Debug, PartialEq)]
pub struct RunSummary {
    pub results: Vec<ScriptResult>,
    /// Whether this run created the ledger table.
    pub ledger_created: bool,
}

impl RunSummary {
    /// True iff no script failed.
    pub fn is_successful(&self) -> bool {
        self.failure().is_none()
    }

    /// Names of the scripts this run applied, in order.
    pub fn applied(&self) -> Vec<&str> {
        self.names_with(|outcome| matches!(outcome, ScriptOutcome::Succeeded))
    }

    /// Names of the scripts that were already recorded in the ledger.
    pub fn skipped(&self) -> Vec<&str> {
        self.names_with(|outcome| matches!(outcome, ScriptOutcome::Skipped))
    }

    /// The script that stopped the run, and why.
    pub fn failure(&self) -> Option<(&str, &Error)> {
        self.results.iter().find_map(|result| match &result.outcome {
            ScriptOutcome::Failed(error) => Some((result.name.as_str(), error)),
            _ => None,
        })
    }

    fn names_with(&self, predicate: impl Fn(&ScriptOutcome) -> bool) -> Vec<&str> {
        self.results
            .iter()
            .filter(|result| predicate(&result.outcome))
            .map(|result| result.name.as_str())
            .collect()
    }
}

/// Applies a set of scripts to a database, each exactly once.
///
/// Scripts are gathered from every configured [ScriptProvider], sorted case-insensitively by
/// name, and compared against the [Journal]. Pending scripts run one at a time; the first
/// failure stops the run.
///
/// ```
/// use scriptup::{MigrationEngine, ScriptOutcome};
/// use rusqlite::Connection;
///
/// let engine = MigrationEngine::new()
///     .with_script("Script0001", "CREATE TABLE IF NOT EXISTS Foo (Id int)");
/// let mut conn = Connection::open_in_memory().unwrap();
///
/// let first = engine.run(&mut conn).unwrap();
/// assert_eq!(first.applied(), vec!["Script0001"]);
///
/// // a second run finds everything already applied
/// let second = engine.run(&mut conn).unwrap();
/// assert_eq!(second.results[0].outcome, ScriptOutcome::Skipped);
/// ```
pub struct MigrationEngine {
    providers: Vec<Box<dyn ScriptProvider>>,
    journal: Box<dyn Journal>,
    on_script_start: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_script_complete: Option<Box<dyn Fn(&str, Duration) + Send + Sync>>,
    on_script_skipped: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_script_error: Option<Box<dyn Fn(&str, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for MigrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationEngine")
            .field("providers", &self.providers.len())
            .field("journal", &self.journal.describe())
            .field("on_script_start", &self.on_script_start.is_some())
            .field("on_script_complete", &self.on_script_complete.is_some())
            .field("on_script_skipped", &self.on_script_skipped.is_some())
            .field("on_script_error", &self.on_script_error.is_some())
            .finish()
    }
}

impl Default for MigrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationEngine {
    /// An engine with no scripts, journaling to the default ledger table.
    pub fn new() -> Self {
        Self {
            providers: Vec::new(),
            journal: Box::new(TableJournal::default()),
            on_script_start: None,
            on_script_complete: None,
            on_script_skipped: None,
            on_script_error: None,
        }
    }

    /// Add a single script.
    pub fn with_script(self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.with_scripts(StaticScriptProvider::default().with_script(name, contents))
    }

    /// Add every script of a provider.
    pub fn with_scripts(mut self, provider: impl ScriptProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    /// Add every `.sql` file directly inside `directory`.
    pub fn with_scripts_in(self, directory: impl Into<PathBuf>) -> Self {
        self.with_scripts(FileSystemScriptProvider::new(directory))
    }

    pub fn with_journal(mut self, journal: impl Journal + 'static) -> Self {
        self.journal = Box::new(journal);
        self
    }

    /// Keep the ledger in a table with a custom name.
    /// Defaults to "schema_versions".
    pub fn with_journal_table(self, table: impl Into<String>) -> Self {
        self.with_journal(TableJournal::new(table))
    }

    /// Set a callback to be invoked when a script starts executing.
    pub fn on_script_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_script_start = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a script has been applied and recorded.
    /// The callback receives the script name and how long it took.
    pub fn on_script_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.on_script_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a script is not executed: it was already applied, or
    /// [MigrationEngine::mark_as_applied] recorded it.
    pub fn on_script_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_script_skipped = Some(Box::new(callback));
        self
    }

    /// Set a callback to be invoked when a script fails.
    pub fn on_script_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.on_script_error = Some(Box::new(callback));
        self
    }

    pub fn journal(&self) -> &dyn Journal {
        self.journal.as_ref()
    }

    /// Every script from every provider, in run order.
    /// Returns [Error::DuplicateScript] if two scripts share a name.
    pub fn scripts(&self) -> Result<Vec<Script>, Error> {
        let mut scripts = Vec::new();
        for provider in &self.providers {
            scripts.extend(provider.scripts()?);
        }

        let mut seen = HashSet::new();
        for script in &scripts {
            if !seen.insert(script.name()) {
                return Err(Error::DuplicateScript(script.name().to_string()));
            }
        }

        scripts.sort_by(|a, b| a.run_order(b));
        Ok(scripts)
    }

    /// Apply every pending script.
    ///
    /// Failures of individual scripts are reported in the [RunSummary]. `Err` means the run
    /// could not start (invalid script set, [Error::ConnectionFailure] or
    /// [Error::LedgerUnavailable]) and no script has been executed, with one exception: under
    /// [TransactionMode::SingleTransaction] a failure to begin or commit the run's transaction
    /// is also returned as `Err`. A failed commit comes after every script has run, and leaves
    /// the database as the backend left it.
    pub fn run<C: ConnectionManager>(&self, manager: &mut C) -> Result<RunSummary, Error> {
        let scripts = self.scripts()?;
        let mode = manager.transaction_mode();
        let mut session = Self::open(manager)?;
        let ledger_created = self.journal.ensure_ledger_exists(&mut session)?;
        // every script applied by this run gets the same timestamp
        let batch_applied_at = Utc::now();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            scripts = ?scripts.iter().map(Script::name).collect::<Vec<_>>(),
            transaction_mode = ?mode,
            journal = %self.journal.describe(),
            "Considering scripts to run"
        );

        if mode == TransactionMode::SingleTransaction {
            session.begin()?;
        }

        let mut results = Vec::with_capacity(scripts.len());
        for script in &scripts {
            let result = self.run_script(&mut session, script, mode, batch_applied_at);
            let failed = matches!(result.outcome, ScriptOutcome::Failed(_));
            results.push(result);
            if failed {
                break;
            }
        }

        if mode == TransactionMode::SingleTransaction {
            let failed = results
                .last()
                .is_some_and(|result| matches!(result.outcome, ScriptOutcome::Failed(_)));
            // a script that ended the transaction itself has already committed everything
            // before it
            let rolled_back = session.in_transaction();
            if failed && rolled_back {
                Self::rollback(&mut session);
                for result in &mut results {
                    if result.outcome == ScriptOutcome::Succeeded {
                        result.outcome = ScriptOutcome::RolledBack;
                    }
                }
            } else if !failed {
                session.commit()?;
            }
        }

        Ok(RunSummary {
            results,
            ledger_created,
        })
    }

    /// Scripts that [MigrationEngine::run] would apply, in the order it would apply them.
    /// Read-only: a missing ledger means every script is pending.
    pub fn pending_scripts<C: ConnectionManager>(
        &self,
        manager: &mut C,
    ) -> Result<Vec<Script>, Error> {
        let scripts = self.scripts()?;
        let mut session = Self::open(manager)?;
        let applied = self
            .journal
            .applied_scripts(&mut session)?
            .into_iter()
            .map(|entry| entry.script_name)
            .collect::<HashSet<_>>();
        Ok(scripts
            .into_iter()
            .filter(|script| !applied.contains(script.name()))
            .collect())
    }

    pub fn is_upgrade_required<C: ConnectionManager>(&self, manager: &mut C) -> Result<bool, Error> {
        Ok(!self.pending_scripts(manager)?.is_empty())
    }

    /// The ledger's history. Empty if no script has ever been applied.
    pub fn applied_scripts<C: ConnectionManager>(
        &self,
        manager: &mut C,
    ) -> Result<Vec<JournalEntry>, Error> {
        let mut session = Self::open(manager)?;
        self.journal.applied_scripts(&mut session)
    }

    /// Record every pending script as applied without executing it, for adopting a database
    /// whose schema is already in place. Returns the names recorded.
    ///
    /// Unless the manager runs without transactions, all entries are written atomically.
    pub fn mark_as_applied<C: ConnectionManager>(
        &self,
        manager: &mut C,
    ) -> Result<Vec<String>, Error> {
        let scripts = self.scripts()?;
        let transactional = manager.transaction_mode() != TransactionMode::None;
        let mut session = Self::open(manager)?;
        self.journal.ensure_ledger_exists(&mut session)?;
        let applied_at = Utc::now();

        if transactional {
            session.begin()?;
        }
        let mut marked = Vec::new();
        for script in &scripts {
            if self.journal.has_been_applied(&mut session, script.name())? {
                continue;
            }
            self.journal
                .record_applied(&mut session, script.name(), applied_at)?;

            #[cfg(feature = "tracing")]
            tracing::info!(name = %script.name(), "Marked script as applied without running it");

            if let Some(ref callback) = self.on_script_skipped {
                callback(script.name());
            }
            marked.push(script.name().to_string());
        }
        // an early return above drops the session, rolling the transaction back
        if transactional {
            session.commit()?;
        }
        Ok(marked)
    }

    fn open<C: ConnectionManager>(manager: &mut C) -> Result<C::Session<'_>, Error> {
        manager
            .open_session()
            .map_err(|e| Error::ConnectionFailure(Box::new(e)))
    }

    fn rollback(session: &mut dyn Session) {
        if !session.in_transaction() {
            return;
        }
        if let Err(_error) = session.rollback() {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %_error, "Failed to roll back transaction");
        }
    }

    fn run_script(
        &self,
        session: &mut dyn Session,
        script: &Script,
        mode: TransactionMode,
        applied_at: DateTime<Utc>,
    ) -> ScriptResult {
        let name = script.name();

        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("script_up", name = %name).entered();

        let per_script = mode == TransactionMode::PerScript;
        // the ledger is checked inside the script's transaction so a concurrent run cannot
        // apply the same script in between
        if per_script {
            if let Err(error) = session.begin() {
                return self.failed(name, error);
            }
        }
        let applied = match self.journal.has_been_applied(session, name) {
            Ok(applied) => applied,
            Err(error) => {
                if per_script {
                    Self::rollback(session);
                }
                return self.failed(name, error);
            }
        };

        if applied {
            if per_script {
                if let Err(error) = session.commit() {
                    return self.failed(name, error);
                }
            }

            #[cfg(feature = "tracing")]
            tracing::debug!("Skipping script (already applied)");

            if let Some(ref callback) = self.on_script_skipped {
                callback(name);
            }
            return ScriptResult {
                name: name.to_string(),
                outcome: ScriptOutcome::Skipped,
            };
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Starting script");

        if let Some(ref callback) = self.on_script_start {
            callback(name);
        }

        let started = Instant::now();
        match self.apply(session, script, mode, applied_at) {
            Ok(()) => {
                let duration = started.elapsed();

                #[cfg(feature = "tracing")]
                tracing::info!(
                    duration_ms = duration.as_millis(),
                    "Script completed successfully"
                );

                if let Some(ref callback) = self.on_script_complete {
                    callback(name, duration);
                }
                ScriptResult {
                    name: name.to_string(),
                    outcome: ScriptOutcome::Succeeded,
                }
            }
            Err(error) => {
                if per_script {
                    Self::rollback(session);
                }
                self.failed(name, error)
            }
        }
    }

    fn apply(
        &self,
        session: &mut dyn Session,
        script: &Script,
        mode: TransactionMode,
        applied_at: DateTime<Utc>,
    ) -> Result<(), Error> {
        let executed = session.execute_batch(script.contents());
        // a COMMIT or ROLLBACK inside the script leaves nothing for the ledger entry to join
        let transaction_lost = mode != TransactionMode::None && !session.in_transaction();
        let partial_effects_possible = transaction_lost
            || mode == TransactionMode::None
            || !session.dialect().supports_transactional_ddl();

        let source = match executed {
            Ok(()) if !transaction_lost => None,
            Ok(()) => Some(Error::Generic(
                "script ended the transaction it was run in".to_string(),
            )),
            Err(error) => Some(error),
        };
        if let Some(source) = source {
            #[cfg(feature = "tracing")]
            if partial_effects_possible {
                tracing::warn!(
                    dialect = session.dialect().name(),
                    transaction_lost,
                    "Script failed outside a rollback-capable transaction; it may have left partial changes behind"
                );
            }
            return Err(Error::ScriptExecutionFailed {
                script: script.name().to_string(),
                source: Box::new(source),
                partial_effects_possible,
            });
        }

        // recorded inside the script's transaction when there is one, so both commit together
        self.journal
            .record_applied(session, script.name(), applied_at)?;

        if mode == TransactionMode::PerScript {
            session.commit()?;
        }
        Ok(())
    }

    fn failed(&self, name: &str, error: Error) -> ScriptResult {
        #[cfg(feature = "tracing")]
        tracing::error!(error = %error, "Script failed");

        if let Some(ref callback) = self.on_script_error {
            callback(name, &error);
        }
        ScriptResult {
            name: name.to_string(),
            outcome: ScriptOutcome::Failed(error),
        }
    }
}
