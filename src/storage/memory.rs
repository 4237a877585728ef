// ABOUTME: In-memory diff sink for tests and embedders

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{DifferStorage, FetchDiffer, OnDiffer, TableDiffer};
use crate::cancel;
use crate::error::{ReconcileError, Result};

#[derive(Clone, Default)]
pub struct MemoryDifferStorage {
    items: Arc<Mutex<Vec<TableDiffer>>>,
}

impl MemoryDifferStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything stored so far, in write order.
    pub fn snapshot(&self) -> Result<Vec<TableDiffer>> {
        Ok(self.lock()?.clone())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<TableDiffer>>> {
        self.items
            .lock()
            .map_err(|_| ReconcileError::storage("differ storage poisoned"))
    }
}

#[async_trait]
impl DifferStorage for MemoryDifferStorage {
    async fn write(&self, cancel: &CancellationToken, fetch: &mut FetchDiffer<'_>) -> Result<u64> {
        let mut written = 0;
        loop {
            cancel::check(cancel)?;
            match fetch()? {
                Some(differ) => {
                    self.lock()?.push(differ);
                    written += 1;
                }
                None => return Ok(written),
            }
        }
    }

    async fn read(&self, cancel: &CancellationToken, on_differ: &mut OnDiffer<'_>) -> Result<u64> {
        let items = self.snapshot()?;
        let mut delivered = 0;
        for item in items {
            cancel::check(cancel)?;
            on_differ(item)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::Differ;
    use crate::record::{Column, Record};
    use crate::table::TableId;

    fn differ(id: i64) -> TableDiffer {
        TableDiffer::new(
            TableId::new("m", "users"),
            TableId::new("s", "users"),
            Differ::only_master(Record::new(vec![Column::new("id", id)])),
        )
    }

    #[tokio::test]
    async fn test_callback_error_stops_replay() {
        let storage = MemoryDifferStorage::new();
        let cancel = CancellationToken::new();
        let mut source = (1..=3).map(differ);
        storage
            .write(&cancel, &mut || Ok(source.next()))
            .await
            .unwrap();

        let mut seen = 0;
        let err = storage
            .read(&cancel, &mut |_| {
                seen += 1;
                if seen == 2 {
                    return Err(ReconcileError::storage("consumer failed"));
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(seen, 2);
    }
}
