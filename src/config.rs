// ABOUTME: TOML configuration for reconciliation runs
// ABOUTME: Every section is optional; CLI flags are applied on top of the file values

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::table::SqliteTableOptions;
use crate::task::TaskConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcilerConfig {
    #[serde(default)]
    pub job: JobSection,
    #[serde(default)]
    pub master: DatabaseConfig,
    #[serde(default)]
    pub slave: DatabaseConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub differ: DifferConfig,
    #[serde(default)]
    pub compare: CompareConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSection {
    /// Job identifier; a random UUID when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_split")]
    pub split: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Tables to reconcile; empty means all master tables
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            id: None,
            split: default_split(),
            concurrency: default_concurrency(),
            tables: Vec::new(),
            progress_every: default_progress_every(),
        }
    }
}

impl JobSection {
    pub fn task_config(&self) -> TaskConfig {
        TaskConfig {
            split_num: self.split,
            progress_every: self.progress_every,
        }
    }
}

/// One side of the reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_kind")]
    pub kind: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Per-table primary-key override, e.g. `users = ["user_id"]`
    #[serde(default)]
    pub key_columns: HashMap<String, Vec<String>>,
    /// Per-table SQL predicate applied to every page read
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: default_database_kind(),
            path: None,
            key_columns: HashMap::new(),
            filters: HashMap::new(),
        }
    }
}

impl DatabaseConfig {
    /// Adapter options for every table that has an override or a filter.
    pub fn table_options(&self) -> HashMap<String, SqliteTableOptions> {
        let mut options: HashMap<String, SqliteTableOptions> = HashMap::new();
        for (table, keys) in &self.key_columns {
            options.entry(table.clone()).or_default().key_columns = Some(keys.clone());
        }
        for (table, filter) in &self.filters {
            options.entry(table.clone()).or_default().filter = Some(filter.clone());
        }
        options
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    #[serde(default = "default_tracker_kind")]
    pub kind: String,
    /// Checkpoint directory; `~/.database-reconciler/checkpoints` when absent
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            kind: default_tracker_kind(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DifferConfig {
    #[serde(default = "default_differ_kind")]
    pub kind: String,
    /// Diff database; `~/.database-reconciler/differs.db` when absent
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for DifferConfig {
    fn default() -> Self {
        Self {
            kind: default_differ_kind(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompareConfig {
    #[serde(default)]
    pub ignore_columns: Vec<String>,
}

fn default_split() -> usize {
    16
}

fn default_concurrency() -> usize {
    4
}

fn default_progress_every() -> usize {
    10
}

fn default_database_kind() -> String {
    "sqlite".to_string()
}

fn default_tracker_kind() -> String {
    "file".to_string()
}

fn default_differ_kind() -> String {
    "sqlite".to_string()
}

/// Values given on the command line; `None` leaves the file value alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub master: Option<PathBuf>,
    pub slave: Option<PathBuf>,
    pub split: Option<usize>,
    pub concurrency: Option<usize>,
    pub tables: Option<Vec<String>>,
    pub state_dir: Option<PathBuf>,
    pub differ_db: Option<PathBuf>,
}

impl ReconcilerConfig {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse reconciler configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Load `path` if given, otherwise start from defaults, then apply overrides.
    pub fn merge(path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(overrides);
        Ok(config)
    }

    /// [`merge`](Self::merge) plus [`validate`](Self::validate).
    pub fn resolve(path: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let config = Self::merge(path, overrides)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(path) = overrides.master {
            self.master.path = Some(path);
        }
        if let Some(path) = overrides.slave {
            self.slave.path = Some(path);
        }
        if let Some(split) = overrides.split {
            self.job.split = split;
        }
        if let Some(concurrency) = overrides.concurrency {
            self.job.concurrency = concurrency;
        }
        if let Some(tables) = overrides.tables {
            self.job.tables = tables;
        }
        if let Some(dir) = overrides.state_dir {
            self.tracker.dir = Some(dir);
        }
        if let Some(path) = overrides.differ_db {
            self.differ.path = Some(path);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.job.split == 0 {
            bail!("job.split must be at least 1");
        }
        if self.job.concurrency == 0 {
            bail!("job.concurrency must be at least 1");
        }
        for (side, db) in [("master", &self.master), ("slave", &self.slave)] {
            if db.kind == "sqlite" && db.path.as_deref().map_or(true, |p| p.as_os_str().is_empty()) {
                bail!("{}.path is required for sqlite databases", side);
            }
        }
        if self.job.tables.iter().any(|t| t.trim().is_empty()) {
            bail!("job.tables must not contain empty names");
        }
        Ok(())
    }

    pub fn job_id(&self) -> String {
        self.job
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}
