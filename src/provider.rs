//! Script discovery.
//!
//! A [ScriptProvider] hands the engine a set of named [Script]s. Providers make no ordering
//! promise: the engine sorts everything it receives before consulting the journal.

use crate::error::Error;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// Where a [Script] was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// Supplied directly in code.
    Provided,
    /// Compiled into the binary, typically with `include_str!`.
    Embedded,
    /// Read from a file on disk.
    File(PathBuf),
}

/// A named unit of SQL to be applied exactly once.
///
/// The name identifies the script in the ledger and decides its position in a run.
///
/// # IMPORTANT WARNING
///
/// **Once a script has been applied to any database, its name must NEVER be changed.**
/// A renamed script is a new script as far as the ledger is concerned, and will run again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    name: String,
    contents: String,
    source: ScriptSource,
}

impl Script {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
            source: ScriptSource::Provided,
        }
    }

    /// A script compiled into the binary.
    ///
    /// ```
    /// use scriptup::Script;
    ///
    /// let script = Script::embedded("Script0001", "CREATE TABLE IF NOT EXISTS Foo (Id int)");
    /// assert_eq!(script.name(), "Script0001");
    /// ```
    pub fn embedded(name: impl Into<String>, contents: &'static str) -> Self {
        Self {
            name: name.into(),
            contents: contents.to_string(),
            source: ScriptSource::Embedded,
        }
    }

    /// Read a script from disk. A leading UTF-8 byte order mark is dropped.
    pub fn from_file(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let contents = match contents.strip_prefix('\u{feff}') {
            Some(stripped) => stripped.to_string(),
            None => contents,
        };
        Ok(Self {
            name: name.into(),
            contents,
            source: ScriptSource::File(path.to_path_buf()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn source(&self) -> &ScriptSource {
        &self.source
    }

    /// Execution order: case-insensitive by name, ties broken by the exact name so the order is
    /// total regardless of discovery order.
    pub fn run_order(&self, other: &Script) -> Ordering {
        self.name
            .to_lowercase()
            .cmp(&other.name.to_lowercase())
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// Supplies the set of scripts a run considers.
pub trait ScriptProvider {
    fn scripts(&self) -> Result<Vec<Script>, Error>;
}

/// Scripts supplied directly in code.
#[derive(Debug, Clone, Default)]
pub struct StaticScriptProvider {
    scripts: Vec<Script>,
}

impl StaticScriptProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self { scripts }
    }

    pub fn with_script(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.scripts.push(Script::new(name, contents));
        self
    }
}

impl ScriptProvider for StaticScriptProvider {
    fn scripts(&self) -> Result<Vec<Script>, Error> {
        Ok(self.scripts.clone())
    }
}

/// Every `.sql` file in a directory.
///
/// Scripts are named by their path relative to the directory, with `/` separators, so a
/// non-recursive provider names each script after its file name.
pub struct FileSystemScriptProvider {
    directory: PathBuf,
    recursive: bool,
    filter: Option<Box<dyn Fn(&Path) -> bool + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for FileSystemScriptProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemScriptProvider")
            .field("directory", &self.directory)
            .field("recursive", &self.recursive)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

impl FileSystemScriptProvider {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            recursive: false,
            filter: None,
        }
    }

    /// Also pick up `.sql` files in subdirectories. Symbolic links to directories are skipped.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Only include files for which `filter` returns true.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Path) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }

    fn collect(&self, dir: &Path, scripts: &mut Vec<Script>) -> Result<(), Error> {
        let io_error = |source| Error::Io {
            path: dir.to_path_buf(),
            source,
        };
        for entry in std::fs::read_dir(dir).map_err(io_error)? {
            let entry = entry.map_err(io_error)?;
            let path = entry.path();
            // file_type does not follow symlinks, so linked directories are never descended into
            let file_type = entry.file_type().map_err(io_error)?;
            if file_type.is_dir() {
                if self.recursive {
                    self.collect(&path, scripts)?;
                }
                continue;
            }
            if file_type.is_symlink() && path.is_dir() {
                continue;
            }
            let is_sql = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"));
            if !is_sql {
                continue;
            }
            if let Some(filter) = &self.filter {
                if !filter(&path) {
                    continue;
                }
            }
            let relative = path.strip_prefix(&self.directory).unwrap_or(&path);
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            scripts.push(Script::from_file(name, &path)?);
        }
        Ok(())
    }
}

impl ScriptProvider for FileSystemScriptProvider {
    fn scripts(&self) -> Result<Vec<Script>, Error> {
        let mut scripts = Vec::new();
        self.collect(&self.directory, &mut scripts)?;
        Ok(scripts)
    }
}
