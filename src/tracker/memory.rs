// ABOUTME: Process-local tracker - checkpoints live in a shared map
// ABOUTME: Clones share state, so a second task run in the same process resumes

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{OffsetTracker, PageParamTracker, Tracker};
use crate::cancel;
use crate::error::{ReconcileError, Result};
use crate::offset::Offset;
use crate::page::PageParam;
use crate::table::TableId;

#[derive(Default)]
struct State {
    offsets: HashMap<TableId, Offset>,
    pages: HashMap<TableId, Vec<PageParam>>,
}

#[derive(Clone, Default)]
pub struct MemoryTracker {
    state: Arc<Mutex<State>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock(state: &Mutex<State>) -> Result<std::sync::MutexGuard<'_, State>> {
    state
        .lock()
        .map_err(|_| ReconcileError::storage("tracker state poisoned"))
}

struct MemoryOffsetTracker {
    table: TableId,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl OffsetTracker for MemoryOffsetTracker {
    async fn write(&self, cancel: &CancellationToken, offset: &Offset) -> Result<()> {
        cancel::check(cancel)?;
        lock(&self.state)?
            .offsets
            .insert(self.table.clone(), offset.clone());
        Ok(())
    }

    async fn read(&self, cancel: &CancellationToken) -> Result<Option<Offset>> {
        cancel::check(cancel)?;
        Ok(lock(&self.state)?.offsets.get(&self.table).cloned())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryPageParamTracker {
    table: TableId,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl PageParamTracker for MemoryPageParamTracker {
    async fn write(&self, cancel: &CancellationToken, pages: &[PageParam]) -> Result<()> {
        cancel::check(cancel)?;
        lock(&self.state)?
            .pages
            .insert(self.table.clone(), pages.to_vec());
        Ok(())
    }

    async fn read(&self, cancel: &CancellationToken) -> Result<Option<Vec<PageParam>>> {
        cancel::check(cancel)?;
        Ok(lock(&self.state)?.pages.get(&self.table).cloned())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Tracker for MemoryTracker {
    async fn offset_tracker(
        &self,
        cancel: &CancellationToken,
        master: &TableId,
    ) -> Result<Box<dyn OffsetTracker>> {
        cancel::check(cancel)?;
        Ok(Box::new(MemoryOffsetTracker {
            table: master.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn page_param_tracker(
        &self,
        cancel: &CancellationToken,
        master: &TableId,
    ) -> Result<Box<dyn PageParamTracker>> {
        cancel::check(cancel)?;
        Ok(Box::new(MemoryPageParamTracker {
            table: master.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn clear(&self, cancel: &CancellationToken, master: &TableId) -> Result<()> {
        cancel::check(cancel)?;
        let mut state = lock(&self.state)?;
        state.offsets.remove(master);
        state.pages.remove(master);
        Ok(())
    }
}
