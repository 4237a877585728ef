// ABOUTME: Reconciliation driver for one master/slave table pair
// ABOUTME: Plans pages, compares them in offset order and checkpoints only after diffs are stored

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::compare::{diff_pages, DifferType, RecordComparable};
use crate::error::{ReconcileError, Result};
use crate::page::{check_plan, PageParam};
use crate::storage::{DifferStorage, TableDiffer};
use crate::table::{MasterTable, SlaveTable, TableId};
use crate::tracker::{OffsetTracker, PageParamTracker, Tracker};

/// Identity of a task within a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub job_id: String,
    pub task_group_id: String,
    pub task_id: String,
}

impl TaskId {
    pub fn new(
        job_id: impl Into<String>,
        task_group_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_group_id: task_group_id.into(),
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.job_id, self.task_group_id, self.task_id)
    }
}

/// Lifecycle of a task. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Planning,
    Scanning(usize),
    Comparing(usize),
    Checkpointing(usize),
    Done,
    Post,
}

impl TaskState {
    fn rank(&self) -> (u8, usize, u8) {
        match *self {
            TaskState::Init => (0, 0, 0),
            TaskState::Planning => (1, 0, 0),
            TaskState::Scanning(page) => (2, page, 0),
            TaskState::Comparing(page) => (2, page, 1),
            TaskState::Checkpointing(page) => (2, page, 2),
            TaskState::Done => (3, 0, 0),
            TaskState::Post => (4, 0, 0),
        }
    }

    /// Whether moving from `self` to `next` goes forward.
    pub fn can_advance_to(&self, next: TaskState) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Init => write!(f, "init"),
            TaskState::Planning => write!(f, "planning"),
            TaskState::Scanning(page) => write!(f, "scanning page {}", page),
            TaskState::Comparing(page) => write!(f, "comparing page {}", page),
            TaskState::Checkpointing(page) => write!(f, "checkpointing page {}", page),
            TaskState::Done => write!(f, "done"),
            TaskState::Post => write!(f, "post"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    /// Number of pages to split the master into when no plan is checkpointed
    pub split_num: usize,
    /// Log progress every this many pages (0 disables)
    pub progress_every: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            split_num: 16,
            progress_every: 10,
        }
    }
}

/// Final report of a task.
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub master_table: TableId,
    pub slave_table: TableId,
    pub pages_planned: usize,
    pub pages_processed: usize,
    /// The plan came from a checkpoint rather than a fresh split
    pub resumed: bool,
    pub master_records: u64,
    pub slave_records: u64,
    /// Comparisons by outcome, including agreements (`DifferType::None`)
    pub differs: BTreeMap<DifferType, u64>,
    pub duration: Duration,
}

impl TaskSummary {
    fn new(master_table: TableId, slave_table: TableId) -> Self {
        Self {
            master_table,
            slave_table,
            pages_planned: 0,
            pages_processed: 0,
            resumed: false,
            master_records: 0,
            slave_records: 0,
            differs: BTreeMap::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn count(&self, kind: DifferType) -> u64 {
        self.differs.get(&kind).copied().unwrap_or(0)
    }

    /// Differences that were persisted (everything but agreements).
    pub fn persisted(&self) -> u64 {
        self.differs
            .iter()
            .filter(|(kind, _)| **kind != DifferType::None)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn is_clean(&self) -> bool {
        self.persisted() == 0
    }
}

/// Checkpoint handles for one master table.
pub struct Checkpoints {
    pub offsets: Box<dyn OffsetTracker>,
    pub pages: Box<dyn PageParamTracker>,
}

impl Checkpoints {
    pub async fn open(
        tracker: &dyn Tracker,
        cancel: &CancellationToken,
        master: &TableId,
    ) -> Result<Self> {
        Ok(Self {
            offsets: tracker.offset_tracker(cancel, master).await?,
            pages: tracker.page_param_tracker(cancel, master).await?,
        })
    }
}

/// One reconciliation run over a single master/slave pair.
///
/// The task owns its adapters and checkpoint handles and closes all of them
/// when [`Task::run`] returns, whatever the outcome.
pub struct Task {
    id: TaskId,
    master: Box<dyn MasterTable>,
    slave: Box<dyn SlaveTable>,
    checkpoints: Checkpoints,
    storage: Arc<dyn DifferStorage>,
    comparator: Arc<dyn RecordComparable>,
    config: TaskConfig,
    state: TaskState,
}

impl Task {
    pub fn new(
        id: TaskId,
        master: Box<dyn MasterTable>,
        slave: Box<dyn SlaveTable>,
        checkpoints: Checkpoints,
        storage: Arc<dyn DifferStorage>,
        comparator: Arc<dyn RecordComparable>,
        config: TaskConfig,
    ) -> Self {
        Self {
            id,
            master,
            slave,
            checkpoints,
            storage,
            comparator,
            config,
            state: TaskState::Init,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Drive the task to completion.
    ///
    /// On error the last written checkpoint still describes a fully committed
    /// page, so running a new task over the same tracker resumes from there.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<TaskSummary> {
        let started = Instant::now();
        let mut summary = TaskSummary::new(
            self.master.table().clone(),
            self.slave.table().clone(),
        );

        tracing::info!(
            "Task {} reconciling {} against {}",
            self.id,
            summary.master_table,
            summary.slave_table
        );

        let outcome = AssertUnwindSafe(self.execute(cancel, &mut summary))
            .catch_unwind()
            .await;
        let closed = self.close_all().await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                tracing::error!("Task {} panicked during {}", self.id, self.state);
                if let Err(close_err) = closed {
                    tracing::warn!("Task {} also failed to release resources: {}", self.id, close_err);
                }
                std::panic::resume_unwind(panic);
            }
        };

        match outcome {
            Ok(()) => {
                closed?;
                self.advance(TaskState::Post)?;
                summary.duration = started.elapsed();
                tracing::info!(
                    "Task {} finished: {} pages, {} master / {} slave records, {} only-master, {} only-slave, {} value differs in {:.1}s",
                    self.id,
                    summary.pages_processed,
                    summary.master_records,
                    summary.slave_records,
                    summary.count(DifferType::OnlyMaster),
                    summary.count(DifferType::OnlySlave),
                    summary.count(DifferType::Value),
                    summary.duration.as_secs_f64()
                );
                Ok(summary)
            }
            Err(e) => {
                if e.is_cancelled() {
                    tracing::warn!("Task {} cancelled during {}", self.id, self.state);
                } else {
                    tracing::error!("Task {} failed during {}: {}", self.id, self.state, e);
                }
                if let Err(close_err) = closed {
                    tracing::warn!("Task {} also failed to release resources: {}", self.id, close_err);
                }
                Err(e)
            }
        }
    }

    async fn execute(&mut self, cancel: &CancellationToken, summary: &mut TaskSummary) -> Result<()> {
        self.advance(TaskState::Planning)?;
        let (mut remaining, resumed) = self.plan(cancel).await?;
        summary.pages_planned = remaining.len();
        summary.resumed = resumed;

        let mut index = 0;
        while let Some(param) = remaining.first().cloned() {
            self.advance(TaskState::Scanning(index))?;
            tracing::debug!("Task {} reading page {} {}", self.id, index, param);
            let master_page = self.master.read_page(cancel, &param).await?;
            let slave_param = self
                .slave
                .transform_page(param.start.as_ref(), param.end.as_ref())?;
            let slave_page = self.slave.read_page(cancel, &slave_param).await?;
            summary.master_records += master_page.len() as u64;
            summary.slave_records += slave_page.len() as u64;

            self.advance(TaskState::Comparing(index))?;
            let differs = diff_pages(self.comparator.as_ref(), &master_page, &slave_page)?;
            for differ in &differs {
                *summary.differs.entry(differ.kind()).or_insert(0) += 1;
            }
            let master_id = summary.master_table.clone();
            let slave_id = summary.slave_table.clone();
            let mut pending = differs
                .into_iter()
                .filter(|differ| !differ.is_none())
                .map(move |differ| TableDiffer::new(master_id.clone(), slave_id.clone(), differ));
            let stored = self
                .storage
                .write(cancel, &mut || Ok(pending.next()))
                .await?;

            // Diffs for this page are durable; only now may the checkpoint move.
            self.advance(TaskState::Checkpointing(index))?;
            remaining.remove(0);
            self.checkpoints.pages.write(cancel, &remaining).await?;
            if let Some(boundary) = param.end.as_ref().or(master_page.max.as_ref()) {
                self.checkpoints.offsets.write(cancel, boundary).await?;
            }

            index += 1;
            summary.pages_processed = index;
            tracing::debug!(
                "Task {} committed page {} ({} master, {} slave records, {} differs stored)",
                self.id,
                index - 1,
                master_page.len(),
                slave_page.len(),
                stored
            );
            if self.config.progress_every > 0 && index % self.config.progress_every == 0 {
                tracing::info!(
                    "Task {} progress: {}/{} pages",
                    self.id,
                    index,
                    summary.pages_planned
                );
            }
        }

        self.advance(TaskState::Done)
    }

    /// Load the remaining plan from the page checkpoint, or split the master
    /// and persist the fresh plan before any page is read.
    async fn plan(&mut self, cancel: &CancellationToken) -> Result<(Vec<PageParam>, bool)> {
        if let Some(pages) = self.checkpoints.pages.read(cancel).await? {
            check_plan(&pages, false)?;
            if pages.is_empty() {
                tracing::info!(
                    "Task {} has nothing left to do; clear its checkpoint to reconcile again",
                    self.id
                );
            } else {
                let last = self.checkpoints.offsets.read(cancel).await?;
                tracing::warn!(
                    "Task {} resuming with {} remaining pages (last committed offset: {})",
                    self.id,
                    pages.len(),
                    last.map(|o| o.to_string()).unwrap_or_else(|| "none".to_string())
                );
            }
            return Ok((pages, true));
        }

        let plan = self.master.split(cancel, self.config.split_num).await?;
        check_plan(&plan, true)?;
        self.checkpoints.pages.write(cancel, &plan).await?;
        tracing::info!(
            "Task {} split {} into {} pages",
            self.id,
            self.master.table(),
            plan.len()
        );
        Ok((plan, false))
    }

    fn advance(&mut self, next: TaskState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(ReconcileError::InvalidInput(format!(
                "task {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        tracing::trace!("Task {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Close every owned resource, reporting the first failure.
    async fn close_all(&self) -> Result<()> {
        let results = [
            self.master.close().await,
            self.slave.close().await,
            self.checkpoints.offsets.close().await,
            self.checkpoints.pages.close().await,
        ];
        results.into_iter().collect()
    }
}
