// ABOUTME: Named backend lookup used when composing a run from configuration
// ABOUTME: Registration and lookup failures are returned as errors, never panics

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::{DatabaseConfig, DifferConfig, TrackerConfig};
use crate::error::{ReconcileError, Result};
use crate::storage::{DifferStorage, MemoryDifferStorage, SqliteDifferStorage};
use crate::table::{DbStorage, SqliteStorage};
use crate::tracker::{FileTracker, MemoryTracker, Tracker};

/// Builds a [`DbStorage`] from one side of the configuration.
#[async_trait]
pub trait DbStorageFactory: Send + Sync {
    async fn open(&self, config: &DatabaseConfig) -> Result<Arc<dyn DbStorage>>;
}

#[async_trait]
pub trait TrackerFactory: Send + Sync {
    async fn open(&self, config: &TrackerConfig) -> Result<Arc<dyn Tracker>>;
}

#[async_trait]
pub trait DifferStorageFactory: Send + Sync {
    async fn open(&self, config: &DifferConfig) -> Result<Arc<dyn DifferStorage>>;
}

/// Write-once map from name to implementation for one kind of backend.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register `entry` under `name`. A name can only be registered once.
    pub fn register(&self, name: impl Into<String>, entry: Arc<T>) -> Result<()> {
        let name = name.into();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ReconcileError::storage(format!("{} registry poisoned", self.kind)))?;
        if entries.contains_key(&name) {
            return Err(ReconcileError::DuplicateName {
                kind: self.kind,
                name,
            });
        }
        tracing::debug!("Registered {} '{}'", self.kind, name);
        entries.insert(name, entry);
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Arc<T>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| ReconcileError::storage(format!("{} registry poisoned", self.kind)))?;
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| ReconcileError::NotFound {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.entries.read() {
            Ok(entries) => entries.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }
}

/// One registry per backend kind.
pub struct Registries {
    pub databases: Registry<dyn DbStorageFactory>,
    pub trackers: Registry<dyn TrackerFactory>,
    pub differs: Registry<dyn DifferStorageFactory>,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            databases: Registry::new("database"),
            trackers: Registry::new("tracker"),
            differs: Registry::new("differ storage"),
        }
    }
}

impl Registries {
    /// Registries holding the backends that ship with this crate.
    pub fn with_builtin() -> Result<Self> {
        let registries = Self::default();
        registries
            .databases
            .register("sqlite", Arc::new(SqliteDbFactory))?;
        registries
            .trackers
            .register("file", Arc::new(FileTrackerFactory))?;
        registries
            .trackers
            .register("memory", Arc::new(MemoryTrackerFactory))?;
        registries
            .differs
            .register("sqlite", Arc::new(SqliteDifferFactory))?;
        registries
            .differs
            .register("memory", Arc::new(MemoryDifferFactory))?;
        Ok(registries)
    }

    pub async fn open_database(&self, config: &DatabaseConfig) -> Result<Arc<dyn DbStorage>> {
        self.databases.load(&config.kind)?.open(config).await
    }

    pub async fn open_tracker(&self, config: &TrackerConfig) -> Result<Arc<dyn Tracker>> {
        self.trackers.load(&config.kind)?.open(config).await
    }

    pub async fn open_differ_storage(&self, config: &DifferConfig) -> Result<Arc<dyn DifferStorage>> {
        self.differs.load(&config.kind)?.open(config).await
    }
}

struct SqliteDbFactory;

#[async_trait]
impl DbStorageFactory for SqliteDbFactory {
    async fn open(&self, config: &DatabaseConfig) -> Result<Arc<dyn DbStorage>> {
        let path = config
            .path
            .as_ref()
            .ok_or_else(|| ReconcileError::InvalidInput("sqlite database needs a path".to_string()))?;
        if !path.exists() {
            return Err(ReconcileError::NotFound {
                kind: "database",
                name: path.display().to_string(),
            });
        }
        let storage = config
            .table_options()
            .into_iter()
            .fold(SqliteStorage::new(path), |storage, (table, options)| {
                storage.with_table_options(table, options)
            });
        Ok(Arc::new(storage))
    }
}

struct FileTrackerFactory;

#[async_trait]
impl TrackerFactory for FileTrackerFactory {
    async fn open(&self, config: &TrackerConfig) -> Result<Arc<dyn Tracker>> {
        let dir = match &config.dir {
            Some(dir) => dir.clone(),
            None => FileTracker::default_dir()?,
        };
        Ok(Arc::new(FileTracker::new(dir)))
    }
}

struct MemoryTrackerFactory;

#[async_trait]
impl TrackerFactory for MemoryTrackerFactory {
    async fn open(&self, _config: &TrackerConfig) -> Result<Arc<dyn Tracker>> {
        Ok(Arc::new(MemoryTracker::new()))
    }
}

struct SqliteDifferFactory;

#[async_trait]
impl DifferStorageFactory for SqliteDifferFactory {
    async fn open(&self, config: &DifferConfig) -> Result<Arc<dyn DifferStorage>> {
        let path = match &config.path {
            Some(path) => path.clone(),
            None => default_differ_path()?,
        };
        Ok(Arc::new(SqliteDifferStorage::open(path).await?))
    }
}

struct MemoryDifferFactory;

#[async_trait]
impl DifferStorageFactory for MemoryDifferFactory {
    async fn open(&self, _config: &DifferConfig) -> Result<Arc<dyn DifferStorage>> {
        Ok(Arc::new(MemoryDifferStorage::new()))
    }
}

/// `~/.database-reconciler/differs.db`
pub fn default_differ_path() -> Result<std::path::PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ReconcileError::storage("could not find home directory"))?;
    Ok(home.join(".database-reconciler").join("differs.db"))
}
