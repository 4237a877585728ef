// ABOUTME: Library root for database-reconciler
// ABOUTME: Resumable master/slave table reconciliation with typed, durable diff output

pub mod cancel;
pub mod compare;
pub mod config;
pub mod error;
pub mod job;
pub mod offset;
pub mod page;
pub mod record;
pub mod registry;
pub mod storage;
pub mod table;
pub mod task;
pub mod tracker;

pub use compare::{diff_pages, ColumnComparator, Differ, DifferType, RecordComparable};
pub use error::{ReconcileError, Result};
pub use job::{Job, JobConfig, JobReport};
pub use offset::Offset;
pub use page::{Page, PageParam, PageRecord};
pub use record::{Column, Record, Value};
pub use storage::{DifferStorage, TableDiffer};
pub use table::{DbStorage, MasterTable, SlaveTable, StorageTable, TableId};
pub use task::{Checkpoints, Task, TaskConfig, TaskId, TaskState, TaskSummary};
pub use tracker::{OffsetTracker, PageParamTracker, Tracker};
