// ABOUTME: Diff sinks - append-only persistence of classified differences
// ABOUTME: Writers pull from a producer closure; readers replay in original write order

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::compare::Differ;
use crate::error::Result;
use crate::table::TableId;

pub use memory::MemoryDifferStorage;
pub use sqlite::SqliteDifferStorage;

/// The unit of diff persistence: which pair of tables, and what differed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDiffer {
    pub master_table: TableId,
    pub slave_table: TableId,
    pub differ: Differ,
}

impl TableDiffer {
    pub fn new(master_table: TableId, slave_table: TableId, differ: Differ) -> Self {
        Self {
            master_table,
            slave_table,
            differ,
        }
    }
}

/// Producer handed to [`DifferStorage::write`]. `Ok(None)` ends the stream.
pub type FetchDiffer<'a> = dyn FnMut() -> Result<Option<TableDiffer>> + Send + 'a;

/// Callback handed to [`DifferStorage::read`]. An error stops the replay.
pub type OnDiffer<'a> = dyn FnMut(TableDiffer) -> Result<()> + Send + 'a;

#[async_trait]
pub trait DifferStorage: Send + Sync {
    /// Pull differs from `fetch` until it returns `Ok(None)`, persisting each one
    /// durably before asking for the next. Returns how many were stored.
    ///
    /// A producer error stops the write and is returned unchanged; differs
    /// stored before it stay stored.
    async fn write(&self, cancel: &CancellationToken, fetch: &mut FetchDiffer<'_>) -> Result<u64>;

    /// Replay every stored differ in write order. Returns how many were
    /// delivered.
    async fn read(&self, cancel: &CancellationToken, on_differ: &mut OnDiffer<'_>) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}
