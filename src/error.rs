use std::path::PathBuf;

/// Error type for the scriptup crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The ledger table could not be created, read or written.
    #[error("ledger table {table} is unavailable: {source}")]
    LedgerUnavailable {
        table: String,
        #[source]
        source: Box<Error>,
    },
    /// A script's SQL failed. `partial_effects_possible` is set when the script ran outside a
    /// transaction or the backend cannot roll back DDL.
    #[error("script {script} failed: {source}")]
    ScriptExecutionFailed {
        script: String,
        #[source]
        source: Box<Error>,
        partial_effects_possible: bool,
    },
    /// No session could be opened against the target database.
    #[error("unable to open a database session: {0}")]
    ConnectionFailure(#[source] Box<Error>),
    #[error("duplicate script name found: {0}")]
    DuplicateScript(String),
    #[error("failed to read scripts from {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Rusqlite(rusqlite::Error),
    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
    #[error("{0}")]
    Generic(String),
}

impl Error {
    /// Name of the script this error is attributed to, if any.
    pub fn script(&self) -> Option<&str> {
        match self {
            Self::ScriptExecutionFailed { script, .. } => Some(script),
            _ => None,
        }
    }

    pub(crate) fn ledger(table: impl Into<String>, source: Error) -> Self {
        Self::LedgerUnavailable {
            table: table.into(),
            source: Box::new(source),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Rusqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}

// Manual PartialEq implementation because postgres::Error and io::Error don't implement PartialEq
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::LedgerUnavailable {
                    table: a,
                    source: a_source,
                },
                Self::LedgerUnavailable {
                    table: b,
                    source: b_source,
                },
            ) => a == b && a_source == b_source,
            (
                Self::ScriptExecutionFailed {
                    script: a,
                    source: a_source,
                    partial_effects_possible: a_partial,
                },
                Self::ScriptExecutionFailed {
                    script: b,
                    source: b_source,
                    partial_effects_possible: b_partial,
                },
            ) => a == b && a_source == b_source && a_partial == b_partial,
            (Self::ConnectionFailure(a), Self::ConnectionFailure(b)) => a == b,
            (Self::DuplicateScript(a), Self::DuplicateScript(b)) => a == b,
            (
                Self::Io {
                    path: a,
                    source: a_source,
                },
                Self::Io {
                    path: b,
                    source: b_source,
                },
            ) => a == b && a_source.kind() == b_source.kind(),
            #[cfg(feature = "sqlite")]
            (Self::Rusqlite(a), Self::Rusqlite(b)) => a == b,
            #[cfg(feature = "postgres")]
            (Self::Postgres(a), Self::Postgres(b)) => a.to_string() == b.to_string(),
            (Self::Generic(a), Self::Generic(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_execution_failure_displays_script_and_cause() {
        let error = Error::ScriptExecutionFailed {
            script: "Script0002".to_string(),
            source: Box::new(Error::Generic("near \"bleep\": syntax error".to_string())),
            partial_effects_possible: false,
        };
        assert_eq!(
            error.to_string(),
            "script Script0002 failed: near \"bleep\": syntax error"
        );
        assert_eq!(error.script(), Some("Script0002"));
    }

    #[test]
    fn io_errors_compare_by_path_and_kind() {
        let a = Error::Io {
            path: PathBuf::from("scripts"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        let b = Error::Io {
            path: PathBuf::from("scripts"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(a, b);
        assert_ne!(a, Error::Generic("gone".to_string()));
    }
}
