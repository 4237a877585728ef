// ABOUTME: Runs one reconciliation task per table pair with bounded parallelism
// ABOUTME: Tasks are independent - a failing table is reported without stopping the others

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cancel;
use crate::compare::{DifferType, RecordComparable};
use crate::error::{ReconcileError, Result};
use crate::storage::DifferStorage;
use crate::table::DbStorage;
use crate::task::{Checkpoints, Task, TaskConfig, TaskId, TaskSummary};
use crate::tracker::Tracker;

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub job_id: String,
    /// Tables to reconcile; empty means every table the master lists
    pub tables: Vec<String>,
    /// Maximum number of tasks running at once
    pub concurrency: usize,
    pub task: TaskConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            tables: Vec::new(),
            concurrency: 4,
            task: TaskConfig::default(),
        }
    }
}

/// Result of reconciling one table.
#[derive(Debug)]
pub struct TableOutcome {
    pub table: String,
    pub result: Result<TaskSummary>,
}

#[derive(Debug)]
pub struct JobReport {
    pub job_id: String,
    /// One entry per table, in the order the tables were requested
    pub outcomes: Vec<TableOutcome>,
}

impl JobReport {
    pub fn summaries(&self) -> impl Iterator<Item = &TaskSummary> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ReconcileError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.table.as_str(), e)))
    }

    pub fn total(&self, kind: DifferType) -> u64 {
        self.summaries().map(|s| s.count(kind)).sum()
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Every table reconciled and none of them differ.
    pub fn is_clean(&self) -> bool {
        self.is_success() && self.summaries().all(TaskSummary::is_clean)
    }
}

/// A set of table reconciliations sharing master, slave, tracker and sink.
pub struct Job {
    config: JobConfig,
    master: Arc<dyn DbStorage>,
    slave: Arc<dyn DbStorage>,
    tracker: Arc<dyn Tracker>,
    storage: Arc<dyn DifferStorage>,
    comparator: Arc<dyn RecordComparable>,
}

impl Job {
    pub fn new(
        config: JobConfig,
        master: Arc<dyn DbStorage>,
        slave: Arc<dyn DbStorage>,
        tracker: Arc<dyn Tracker>,
        storage: Arc<dyn DifferStorage>,
        comparator: Arc<dyn RecordComparable>,
    ) -> Self {
        Self {
            config,
            master,
            slave,
            tracker,
            storage,
            comparator,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Tables this job covers.
    pub async fn tables(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        if !self.config.tables.is_empty() {
            return Ok(self.config.tables.clone());
        }
        Ok(self
            .master
            .all_tables(cancel)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<JobReport> {
        if self.config.concurrency == 0 {
            return Err(ReconcileError::InvalidInput(
                "concurrency must be at least 1".to_string(),
            ));
        }
        let tables = self.tables(cancel).await?;
        tracing::info!(
            "Job {} reconciling {} tables ({} at a time)",
            self.config.job_id,
            tables.len(),
            self.config.concurrency
        );

        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut join_set = JoinSet::new();
        for (index, table) in tables.iter().enumerate() {
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            let unit = TableUnit {
                job_id: self.config.job_id.clone(),
                table: table.clone(),
                config: self.config.task,
                master: Arc::clone(&self.master),
                slave: Arc::clone(&self.slave),
                tracker: Arc::clone(&self.tracker),
                storage: Arc::clone(&self.storage),
                comparator: Arc::clone(&self.comparator),
            };
            join_set.spawn(async move {
                let result = async {
                    let _permit = cancel::run(&cancel, async {
                        permits
                            .acquire_owned()
                            .await
                            .map_err(|_| ReconcileError::Cancelled)
                    })
                    .await?;
                    unit.run(&cancel).await
                }
                .await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<TaskSummary>>> =
            std::iter::repeat_with(|| None).take(tables.len()).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!("Reconciliation task panicked: {}", e),
            }
        }

        let outcomes: Vec<TableOutcome> = tables
            .into_iter()
            .zip(results)
            .map(|(table, result)| {
                let result = result.unwrap_or_else(|| {
                    Err(ReconcileError::storage(format!(
                        "task for {} did not complete",
                        table
                    )))
                });
                if let Err(e) = &result {
                    tracing::warn!("Table {} not reconciled: {}", table, e);
                }
                TableOutcome { table, result }
            })
            .collect();

        let report = JobReport {
            job_id: self.config.job_id.clone(),
            outcomes,
        };
        tracing::info!(
            "Job {} finished: {} tables ok, {} failed, {} only-master, {} only-slave, {} value differs",
            report.job_id,
            report.summaries().count(),
            report.failures().count(),
            report.total(DifferType::OnlyMaster),
            report.total(DifferType::OnlySlave),
            report.total(DifferType::Value)
        );
        Ok(report)
    }
}

/// Everything one spawned task needs, owned so it can move onto the runtime.
struct TableUnit {
    job_id: String,
    table: String,
    config: TaskConfig,
    master: Arc<dyn DbStorage>,
    slave: Arc<dyn DbStorage>,
    tracker: Arc<dyn Tracker>,
    storage: Arc<dyn DifferStorage>,
    comparator: Arc<dyn RecordComparable>,
}

impl TableUnit {
    async fn run(self, cancel: &CancellationToken) -> Result<TaskSummary> {
        let master = self.master.master_table(cancel, &self.table).await?;
        let slave = match self.slave.slave_table(cancel, &self.table).await {
            Ok(slave) => slave,
            Err(e) => {
                if let Err(close_err) = master.close().await {
                    tracing::warn!("Failed to close {}: {}", master.table(), close_err);
                }
                return Err(e);
            }
        };
        let checkpoints = match Checkpoints::open(self.tracker.as_ref(), cancel, master.table()).await {
            Ok(checkpoints) => checkpoints,
            Err(e) => {
                if let Err(close_err) = master.close().await {
                    tracing::warn!("Failed to close {}: {}", master.table(), close_err);
                }
                if let Err(close_err) = slave.close().await {
                    tracing::warn!("Failed to close {}: {}", slave.table(), close_err);
                }
                return Err(e);
            }
        };

        let id = TaskId::new(self.job_id, master.table().database.clone(), self.table);
        Task::new(
            id,
            master,
            slave,
            checkpoints,
            self.storage,
            self.comparator,
            self.config,
        )
        .run(cancel)
        .await
    }
}
