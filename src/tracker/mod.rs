// ABOUTME: Durable scan-progress checkpoints, keyed per master table
// ABOUTME: Offset checkpoints record the last committed boundary; page checkpoints the remaining plan

pub mod file;
pub mod memory;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::offset::Offset;
use crate::page::PageParam;
use crate::table::TableId;

pub use file::FileTracker;
pub use memory::MemoryTracker;

/// Checkpoint of the furthest fully-processed offset.
///
/// `write` must be durable before it returns. `read` returns `Ok(None)` when
/// nothing was ever written.
#[async_trait]
pub trait OffsetTracker: Send + Sync {
    async fn write(&self, cancel: &CancellationToken, offset: &Offset) -> Result<()>;
    async fn read(&self, cancel: &CancellationToken) -> Result<Option<Offset>>;
    async fn close(&self) -> Result<()>;
}

/// Checkpoint of the page windows not yet processed.
///
/// An empty list is a valid checkpoint and means the scan completed.
#[async_trait]
pub trait PageParamTracker: Send + Sync {
    async fn write(&self, cancel: &CancellationToken, pages: &[PageParam]) -> Result<()>;
    async fn read(&self, cancel: &CancellationToken) -> Result<Option<Vec<PageParam>>>;
    async fn close(&self) -> Result<()>;
}

/// Hands out per-table checkpoint handles. Two different master tables never
/// share state.
#[async_trait]
pub trait Tracker: Send + Sync {
    async fn offset_tracker(
        &self,
        cancel: &CancellationToken,
        master: &TableId,
    ) -> Result<Box<dyn OffsetTracker>>;

    async fn page_param_tracker(
        &self,
        cancel: &CancellationToken,
        master: &TableId,
    ) -> Result<Box<dyn PageParamTracker>>;

    /// Forget both checkpoints of `master`. Clearing a table with no checkpoint
    /// is not an error.
    async fn clear(&self, cancel: &CancellationToken, master: &TableId) -> Result<()>;
}
