// ABOUTME: Crash and cancellation tests for checkpoint ordering
// ABOUTME: Injects failures between diff persistence and checkpointing, then resumes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use database_reconciler::compare::{ColumnComparator, DifferType};
use database_reconciler::error::{ReconcileError, Result};
use database_reconciler::offset::Offset;
use database_reconciler::page::{Page, PageParam};
use database_reconciler::record::{Column, Record, Value};
use database_reconciler::storage::MemoryDifferStorage;
use database_reconciler::table::{MemoryTable, SlaveTable, StorageTable, TableId};
use database_reconciler::task::{Checkpoints, Task, TaskConfig, TaskId, TaskSummary};
use database_reconciler::tracker::{FileTracker, OffsetTracker, PageParamTracker, Tracker};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const SPLIT: usize = 4;

fn table(db: &str, ids: impl IntoIterator<Item = i64>) -> MemoryTable {
    let rows = ids
        .into_iter()
        .map(|id| Record::new(vec![Column::new("id", id), Column::new("name", format!("n{}", id))]))
        .collect();
    MemoryTable::new(TableId::new(db, "users"), vec!["id".to_string()], rows).unwrap()
}

/// Master 1..=12 splits into [-inf,4) [4,7) [7,10) [10,+inf); the slave misses
/// one row per page.
fn master() -> MemoryTable {
    table("primary", 1..=12)
}

fn slave() -> MemoryTable {
    table("replica", (1..=12).filter(|id| ![2, 5, 8, 11].contains(id)))
}

/// Slave adapter that fails its n-th page read.
struct FailingSlave {
    inner: MemoryTable,
    fail_on: usize,
    calls: AtomicUsize,
    cancel: Option<CancellationToken>,
}

impl FailingSlave {
    fn new(fail_on: usize) -> Self {
        Self {
            inner: slave(),
            fail_on,
            calls: AtomicUsize::new(0),
            cancel: None,
        }
    }

    fn cancelling(fail_on: usize, cancel: CancellationToken) -> Self {
        Self {
            cancel: Some(cancel),
            ..Self::new(fail_on)
        }
    }
}

#[async_trait]
impl StorageTable for FailingSlave {
    fn table(&self) -> &TableId {
        self.inner.table()
    }

    async fn read_page(&self, cancel: &CancellationToken, param: &PageParam) -> Result<Page> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            if let Some(token) = &self.cancel {
                token.cancel();
                return Err(ReconcileError::Cancelled);
            }
            return Err(ReconcileError::storage("injected slave read failure"));
        }
        self.inner.read_page(cancel, param).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl SlaveTable for FailingSlave {
    fn transform_page(&self, start: Option<&Offset>, end: Option<&Offset>) -> Result<PageParam> {
        self.inner.transform_page(start, end)
    }
}

/// Page tracker whose n-th write fails before reaching the inner tracker.
struct FlakyPages {
    inner: Box<dyn PageParamTracker>,
    fail_on: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl PageParamTracker for FlakyPages {
    async fn write(&self, cancel: &CancellationToken, pages: &[PageParam]) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(ReconcileError::storage("injected checkpoint failure"));
        }
        self.inner.write(cancel, pages).await
    }

    async fn read(&self, cancel: &CancellationToken) -> Result<Option<Vec<PageParam>>> {
        self.inner.read(cancel).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

struct Harness {
    _dir: TempDir,
    tracker: FileTracker,
    storage: MemoryDifferStorage,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let tracker = FileTracker::new(dir.path().join("checkpoints"));
        Self {
            _dir: dir,
            tracker,
            storage: MemoryDifferStorage::new(),
        }
    }

    fn master_id(&self) -> TableId {
        TableId::new("primary", "users")
    }

    async fn checkpoints(&self) -> Checkpoints {
        Checkpoints::open(&self.tracker, &CancellationToken::new(), &self.master_id())
            .await
            .unwrap()
    }

    fn task(&self, slave: Box<dyn SlaveTable>, checkpoints: Checkpoints) -> Task {
        Task::new(
            TaskId::new("job", "primary", "users"),
            Box::new(master()),
            slave,
            checkpoints,
            Arc::new(self.storage.clone()),
            Arc::new(ColumnComparator::new()),
            TaskConfig {
                split_num: SPLIT,
                progress_every: 0,
            },
        )
    }

    async fn run_healthy(&self) -> TaskSummary {
        let checkpoints = self.checkpoints().await;
        self.task(Box::new(slave()), checkpoints)
            .run(&CancellationToken::new())
            .await
            .unwrap()
    }

    /// Master ids of every stored OnlyMaster differ, in write order.
    fn stored_ids(&self) -> Vec<i64> {
        self.storage
            .snapshot()
            .unwrap()
            .iter()
            .map(|item| {
                assert_eq!(item.differ.kind(), DifferType::OnlyMaster);
                match item.differ.master_column().and_then(|r| r.get("id")) {
                    Some(Value::Integer(id)) => *id,
                    other => panic!("unexpected id {:?}", other),
                }
            })
            .collect()
    }

    async fn offset_checkpoint(&self) -> Option<Offset> {
        let cancel = CancellationToken::new();
        self.tracker
            .offset_tracker(&cancel, &self.master_id())
            .await
            .unwrap()
            .read(&cancel)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_uninterrupted_run_reports_each_gap_once() {
    let harness = Harness::new();
    let summary = harness.run_healthy().await;
    assert_eq!(summary.pages_planned, 4);
    assert_eq!(summary.pages_processed, 4);
    assert_eq!(harness.stored_ids(), vec![2, 5, 8, 11]);
    assert_eq!(
        harness.offset_checkpoint().await,
        Some(Offset::single("id", 12))
    );
}

#[tokio::test]
async fn test_crash_before_checkpoint_reprocesses_page() {
    let harness = Harness::new();

    // Write 1 persists the plan, write 2 would checkpoint page 0.
    let cancel = CancellationToken::new();
    let offsets: Box<dyn OffsetTracker> = harness
        .tracker
        .offset_tracker(&cancel, &harness.master_id())
        .await
        .unwrap();
    let pages = FlakyPages {
        inner: harness
            .tracker
            .page_param_tracker(&cancel, &harness.master_id())
            .await
            .unwrap(),
        fail_on: 2,
        calls: AtomicUsize::new(0),
    };
    let err = harness
        .task(
            Box::new(slave()),
            Checkpoints {
                offsets,
                pages: Box::new(pages),
            },
        )
        .run(&cancel)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(harness.stored_ids(), vec![2]);
    assert_eq!(harness.offset_checkpoint().await, None);

    let summary = harness.run_healthy().await;
    assert!(summary.resumed);
    assert_eq!(summary.pages_planned, 4);
    // Page 0 ran twice, so its differ is stored twice; nothing is skipped.
    assert_eq!(harness.stored_ids(), vec![2, 2, 5, 8, 11]);
}

#[tokio::test]
async fn test_crash_after_checkpoint_skips_committed_pages() {
    let harness = Harness::new();

    let checkpoints = harness.checkpoints().await;
    let err = harness
        .task(Box::new(FailingSlave::new(3)), checkpoints)
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(harness.stored_ids(), vec![2, 5]);
    assert_eq!(
        harness.offset_checkpoint().await,
        Some(Offset::single("id", 7))
    );

    let summary = harness.run_healthy().await;
    assert!(summary.resumed);
    assert_eq!(summary.pages_planned, 2);
    assert_eq!(summary.master_records, 6);
    assert_eq!(harness.stored_ids(), vec![2, 5, 8, 11]);
}

#[tokio::test]
async fn test_cancellation_mid_scan_is_resumable() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();

    let checkpoints = harness.checkpoints().await;
    let err = harness
        .task(
            Box::new(FailingSlave::cancelling(2, cancel.clone())),
            checkpoints,
        )
        .run(&cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(cancel.is_cancelled());
    assert_eq!(harness.stored_ids(), vec![2]);

    let summary = harness.run_healthy().await;
    assert_eq!(summary.pages_planned, 3);
    assert_eq!(harness.stored_ids(), vec![2, 5, 8, 11]);
}

#[tokio::test]
async fn test_completed_run_is_not_repeated_until_cleared() {
    let harness = Harness::new();
    harness.run_healthy().await;

    let again = harness.run_healthy().await;
    assert_eq!(again.pages_processed, 0);
    assert_eq!(harness.stored_ids().len(), 4);

    harness
        .tracker
        .clear(&CancellationToken::new(), &harness.master_id())
        .await
        .unwrap();
    let fresh = harness.run_healthy().await;
    assert!(!fresh.resumed);
    assert_eq!(fresh.pages_processed, 4);
    assert_eq!(harness.stored_ids().len(), 8);
}
