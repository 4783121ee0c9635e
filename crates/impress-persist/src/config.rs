//! Database configuration
//!
//! A [`DbConfig`] names one logical database and carries its schema version
//! and lifecycle callbacks. The plain settings load from TOML:
//!
//! ```toml
//! name = "library.db"
//! version = 3
//! directory = "/var/lib/impress"
//! allow_transaction = true
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::context::DbIdentity;
use crate::error::{DbError, Result};
use crate::manager::SchemaUpgrade;

/// File name used when the configured name is blank.
pub const DEFAULT_DB_NAME: &str = "impress.db";

/// Directory marker for in-memory databases.
pub const MEMORY_DIRECTORY: &str = ":memory:";

/// Invoked on every newly opened connection, before versioning.
pub type OpenCallback = Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

/// Invoked when the stored schema version differs from the configured one.
pub type VersionCallback = Arc<dyn Fn(&SchemaUpgrade<'_>) -> Result<()> + Send + Sync>;

/// Invoked after a table is first created, with the table name.
pub type TableCreatedCallback = Arc<dyn Fn(&Connection, &str) -> Result<()> + Send + Sync>;

/// Configuration of one logical database
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// File name inside `directory`; blank selects [`DEFAULT_DB_NAME`]
    pub name: String,
    /// Schema version, at least 1
    pub version: u32,
    /// Containing directory; defaults to the platform data directory
    pub directory: Option<PathBuf>,
    /// Wrap multi-statement operations in transactions
    pub allow_transaction: bool,

    #[serde(skip)]
    on_open: Option<OpenCallback>,
    #[serde(skip)]
    on_upgrade: Option<VersionCallback>,
    #[serde(skip)]
    on_downgrade: Option<VersionCallback>,
    #[serde(skip)]
    on_table_created: Option<TableCreatedCallback>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_DB_NAME.to_string(),
            version: 1,
            directory: None,
            allow_transaction: true,
            on_open: None,
            on_upgrade: None,
            on_downgrade: None,
            on_table_created: None,
        }
    }
}

impl DbConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A database that lives only as long as its manager.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(name).with_directory(MEMORY_DIRECTORY)
    }

    /// Parse the plain settings from TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: DbConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn allow_transaction(mut self, allow: bool) -> Self {
        self.allow_transaction = allow;
        self
    }

    pub fn on_open<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    {
        self.on_open = Some(Arc::new(callback));
        self
    }

    /// Replace the default upgrade policy, which drops every managed table.
    pub fn on_upgrade<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SchemaUpgrade<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.on_upgrade = Some(Arc::new(callback));
        self
    }

    pub fn on_downgrade<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SchemaUpgrade<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.on_downgrade = Some(Arc::new(callback));
        self
    }

    pub fn on_table_created<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Connection, &str) -> Result<()> + Send + Sync + 'static,
    {
        self.on_table_created = Some(Arc::new(callback));
        self
    }

    /// Check the plain settings.
    pub fn validate(&self) -> Result<()> {
        if self.version < 1 {
            return Err(DbError::Config(format!(
                "version must be at least 1, got {}",
                self.version
            )));
        }
        let name = self.db_name();
        if name.contains('/') || name.contains('\\') {
            return Err(DbError::Config(format!(
                "database name '{}' must not contain path separators",
                name
            )));
        }
        Ok(())
    }

    /// Effective file name.
    pub fn db_name(&self) -> &str {
        let trimmed = self.name.trim();
        if trimmed.is_empty() {
            DEFAULT_DB_NAME
        } else {
            trimmed
        }
    }

    /// Effective directory.
    pub fn db_directory(&self) -> PathBuf {
        match self.directory {
            Some(ref dir) => dir.clone(),
            None => default_directory(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.directory
            .as_deref()
            .map_or(false, |dir| dir == Path::new(MEMORY_DIRECTORY))
    }

    /// Database file path, `None` for in-memory databases.
    pub fn db_path(&self) -> Option<PathBuf> {
        if self.is_in_memory() {
            None
        } else {
            Some(self.db_directory().join(self.db_name()))
        }
    }

    pub fn identity(&self) -> DbIdentity {
        DbIdentity::new(self.db_name(), self.db_directory())
    }

    pub(crate) fn open_callback(&self) -> Option<&OpenCallback> {
        self.on_open.as_ref()
    }

    pub(crate) fn upgrade_callback(&self) -> Option<&VersionCallback> {
        self.on_upgrade.as_ref()
    }

    pub(crate) fn downgrade_callback(&self) -> Option<&VersionCallback> {
        self.on_downgrade.as_ref()
    }

    pub(crate) fn table_created_callback(&self) -> Option<&TableCreatedCallback> {
        self.on_table_created.as_ref()
    }
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("directory", &self.directory)
            .field("allow_transaction", &self.allow_transaction)
            .field("on_open", &self.on_open.is_some())
            .field("on_upgrade", &self.on_upgrade.is_some())
            .field("on_downgrade", &self.on_downgrade.is_some())
            .field("on_table_created", &self.on_table_created.is_some())
            .finish()
    }
}

/// Platform data directory, falling back to the working directory.
pub fn default_directory() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("impress").join("databases"))
        .unwrap_or_else(|| PathBuf::from("."))
}
