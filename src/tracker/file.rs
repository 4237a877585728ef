// ABOUTME: JSON-file checkpoint tracker - one offset file and one page-plan file per master table
// ABOUTME: Writes are atomic (temp file, fsync, rename) so a crash never leaves a torn checkpoint

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{OffsetTracker, PageParamTracker, Tracker};
use crate::cancel;
use crate::error::{ReconcileError, Result};
use crate::offset::Offset;
use crate::page::PageParam;
use crate::table::TableId;

const CHECKPOINT_VERSION: u32 = 1;
const OFFSET_SUFFIX: &str = "offset.json";
const PAGES_SUFFIX: &str = "pages.json";

/// On-disk envelope shared by both checkpoint kinds.
#[derive(Serialize, Deserialize)]
struct Checkpoint<T> {
    version: u32,
    table: TableId,
    updated_at: DateTime<Utc>,
    data: T,
}

/// Tracker storing checkpoints as JSON files under one directory.
#[derive(Debug, Clone)]
pub struct FileTracker {
    dir: PathBuf,
}

impl FileTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `~/.database-reconciler/checkpoints`
    pub fn default_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| ReconcileError::storage("could not find home directory"))?;
        Ok(home.join(".database-reconciler").join("checkpoints"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn checkpoint(&self, master: &TableId, suffix: &str) -> CheckpointFile {
        CheckpointFile {
            path: self
                .dir
                .join(format!("{}.{}", checkpoint_stem(master), suffix)),
            table: master.clone(),
            closed: AtomicBool::new(false),
        }
    }
}

/// File name stem for a table: readable prefix plus a hash so that names which
/// sanitize to the same string still get distinct files.
fn checkpoint_stem(table: &TableId) -> String {
    let qualified = table.qualified_name();
    let readable: String = qualified
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(qualified.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", readable, &digest[..12])
}

struct CheckpointFile {
    path: PathBuf,
    table: TableId,
    closed: AtomicBool,
}

impl CheckpointFile {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReconcileError::storage(format!(
                "checkpoint {} is closed",
                self.path.display()
            )));
        }
        Ok(())
    }

    async fn store<T: Serialize + Sync>(&self, cancel: &CancellationToken, data: &T) -> Result<()> {
        cancel::check(cancel)?;
        self.ensure_open()?;

        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            table: self.table.clone(),
            updated_at: Utc::now(),
            data,
        };
        let contents = serde_json::to_vec_pretty(&checkpoint)?;
        write_atomic(&self.path, &contents).await
    }

    async fn load<T: DeserializeOwned>(&self, cancel: &CancellationToken) -> Result<Option<T>> {
        cancel::check(cancel)?;
        self.ensure_open()?;

        let contents = match fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ReconcileError::storage(format!(
                    "failed to read checkpoint {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let checkpoint: Checkpoint<T> = serde_json::from_slice(&contents).map_err(|e| {
            ReconcileError::storage(format!(
                "failed to parse checkpoint {}: {}",
                self.path.display(),
                e
            ))
        })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(ReconcileError::InvalidInput(format!(
                "checkpoint {} has unsupported version {}",
                self.path.display(),
                checkpoint.version
            )));
        }
        if checkpoint.table != self.table {
            return Err(ReconcileError::InvalidInput(format!(
                "checkpoint {} belongs to {}, not {}",
                self.path.display(),
                checkpoint.table,
                self.table
            )));
        }
        Ok(Some(checkpoint.data))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Replace `path` with `contents` so that readers see either the old or the new
/// file, never a mix, and the new one survives a crash once this returns.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| ReconcileError::storage(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent).await?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, path).await?;

    #[cfg(unix)]
    {
        let dir = fs::File::open(parent).await?;
        dir.sync_all().await?;
    }
    Ok(())
}

struct FileOffsetTracker(CheckpointFile);

#[async_trait]
impl OffsetTracker for FileOffsetTracker {
    async fn write(&self, cancel: &CancellationToken, offset: &Offset) -> Result<()> {
        self.0.store(cancel, offset).await?;
        tracing::debug!("Checkpointed offset {} for {}", offset, self.0.table);
        Ok(())
    }

    async fn read(&self, cancel: &CancellationToken) -> Result<Option<Offset>> {
        self.0.load(cancel).await
    }

    async fn close(&self) -> Result<()> {
        self.0.close();
        Ok(())
    }
}

struct FilePageParamTracker(CheckpointFile);

#[async_trait]
impl PageParamTracker for FilePageParamTracker {
    async fn write(&self, cancel: &CancellationToken, pages: &[PageParam]) -> Result<()> {
        self.0.store(cancel, &pages).await?;
        tracing::debug!(
            "Checkpointed {} remaining pages for {}",
            pages.len(),
            self.0.table
        );
        Ok(())
    }

    async fn read(&self, cancel: &CancellationToken) -> Result<Option<Vec<PageParam>>> {
        self.0.load(cancel).await
    }

    async fn close(&self) -> Result<()> {
        self.0.close();
        Ok(())
    }
}

#[async_trait]
impl Tracker for FileTracker {
    async fn offset_tracker(
        &self,
        cancel: &CancellationToken,
        master: &TableId,
    ) -> Result<Box<dyn OffsetTracker>> {
        cancel::check(cancel)?;
        Ok(Box::new(FileOffsetTracker(
            self.checkpoint(master, OFFSET_SUFFIX),
        )))
    }

    async fn page_param_tracker(
        &self,
        cancel: &CancellationToken,
        master: &TableId,
    ) -> Result<Box<dyn PageParamTracker>> {
        cancel::check(cancel)?;
        Ok(Box::new(FilePageParamTracker(
            self.checkpoint(master, PAGES_SUFFIX),
        )))
    }

    async fn clear(&self, cancel: &CancellationToken, master: &TableId) -> Result<()> {
        cancel::check(cancel)?;
        for suffix in [OFFSET_SUFFIX, PAGES_SUFFIX] {
            let path = self.checkpoint(master, suffix).path;
            match fs::remove_file(&path).await {
                Ok(()) => tracing::info!("Removed checkpoint {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
