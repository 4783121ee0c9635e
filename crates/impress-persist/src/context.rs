//! Process-scoped persistence state.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::DbConfig;
use crate::converter::ConverterRegistry;
use crate::entity::MetadataCache;
use crate::error::Result;
use crate::manager::DbManager;

/// Identity of a logical database: its file name and directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbIdentity {
    name: String,
    directory: PathBuf,
}

impl DbIdentity {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl fmt::Display for DbIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.directory.join(&self.name).display())
    }
}

pub(crate) type ManagerMap = RwLock<HashMap<DbIdentity, Arc<DbManager>>>;

/// Owner of the converter registry, the metadata cache and one
/// [`DbManager`] per database identity.
///
/// Managers opened from the same context share its registry and cache.
pub struct PersistenceContext {
    registry: Arc<ConverterRegistry>,
    metadata: Arc<MetadataCache>,
    managers: Arc<ManagerMap>,
}

impl PersistenceContext {
    /// A context with the built-in converters.
    pub fn new() -> Self {
        Self::with_registry(ConverterRegistry::with_builtins())
    }

    pub fn with_registry(registry: ConverterRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            metadata: Arc::new(MetadataCache::new()),
            managers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Converter registry shared by every manager of this context.
    ///
    /// Register custom converters before the entities using them are first
    /// touched; storage kinds are resolved once per entity type.
    pub fn converters(&self) -> &ConverterRegistry {
        &self.registry
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    /// Return the manager for `config`'s identity, creating it on first use.
    ///
    /// The connection itself opens lazily. A later call for the same
    /// identity returns the existing manager and ignores the new config.
    pub fn open(&self, config: DbConfig) -> Result<Arc<DbManager>> {
        config.validate()?;
        let identity = config.identity();

        if let Some(existing) = self.get(&identity) {
            warn_on_mismatch(&existing, &config);
            return Ok(existing);
        }

        let mut managers = self.managers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = managers.get(&identity) {
            warn_on_mismatch(existing, &config);
            return Ok(Arc::clone(existing));
        }
        let manager = Arc::new(DbManager::new(
            config,
            Arc::clone(&self.registry),
            Arc::clone(&self.metadata),
            Arc::downgrade(&self.managers),
        ));
        managers.insert(identity, Arc::clone(&manager));
        Ok(manager)
    }

    pub fn get(&self, identity: &DbIdentity) -> Option<Arc<DbManager>> {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    /// Number of live managers.
    pub fn len(&self) -> usize {
        self.managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close and forget every manager.
    pub fn close_all(&self) {
        let drained: Vec<Arc<DbManager>> = {
            let mut managers = self.managers.write().unwrap_or_else(PoisonError::into_inner);
            managers.drain().map(|(_, manager)| manager).collect()
        };
        for manager in drained {
            manager.close();
        }
    }
}

impl Default for PersistenceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("registry", &self.registry)
            .field("metadata", &self.metadata)
            .field("managers", &self.len())
            .finish()
    }
}

fn warn_on_mismatch(existing: &DbManager, requested: &DbConfig) {
    if existing.version() != requested.version {
        tracing::warn!(
            db = %existing.identity(),
            open_version = existing.version(),
            requested_version = requested.version,
            "database already open with a different version"
        );
    }
}
