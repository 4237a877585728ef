// ABOUTME: Table adapter capabilities used by the reconciliation driver
// ABOUTME: Master tables split themselves into pages; slave tables translate master ranges

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::error::{ReconcileError, Result};
use crate::offset::Offset;
use crate::page::{Page, PageParam};
use crate::record::Value;

pub use memory::{MemoryStorage, MemoryTable};
pub use sqlite::{SqliteStorage, SqliteTable, SqliteTableOptions};

/// Identity of a table within a backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    /// Name of the database/store the table lives in (e.g. a file stem)
    pub database: String,
    pub name: String,
}

impl TableId {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
        }
    }

    /// Get the qualified table name (database.table)
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

/// A readable table. Implementations must observe `cancel` on every read.
#[async_trait]
pub trait StorageTable: Send + Sync {
    fn table(&self) -> &TableId;

    /// Read every record whose offset falls inside `param`.
    async fn read_page(&self, cancel: &CancellationToken, param: &PageParam) -> Result<Page>;

    /// Release connections and cursors. Calling it more than once is a no-op.
    async fn close(&self) -> Result<()>;
}

/// The authoritative side of a reconciliation.
#[async_trait]
pub trait MasterTable: StorageTable {
    /// Partition the full key range into at most `split_num` contiguous,
    /// non-overlapping windows covering `(-inf, +inf)`.
    ///
    /// Re-running with the same `split_num` against unchanged data must return
    /// identical boundaries. `split_num == 0` is an [`InvalidInput`] error.
    ///
    /// [`InvalidInput`]: crate::error::ReconcileError::InvalidInput
    async fn split(&self, cancel: &CancellationToken, split_num: usize) -> Result<Vec<PageParam>>;
}

/// The side expected to mirror the master.
pub trait SlaveTable: StorageTable {
    /// Express the master window `[start, end)` as a query against this table.
    ///
    /// Fails with [`RangeTranslation`] when the master key cannot be mapped onto
    /// the slave key.
    ///
    /// [`RangeTranslation`]: crate::error::ReconcileError::RangeTranslation
    fn transform_page(&self, start: Option<&Offset>, end: Option<&Offset>) -> Result<PageParam>;
}

/// A backing store that enumerates its tables and hands out adapters for them.
#[async_trait]
pub trait DbStorage: Send + Sync {
    /// Name used as [`TableId::database`] for every table of this store.
    fn database(&self) -> &str;

    async fn all_tables(&self, cancel: &CancellationToken) -> Result<Vec<TableId>>;

    async fn master_table(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Box<dyn MasterTable>>;

    async fn slave_table(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Box<dyn SlaveTable>>;
}

/// Which key values a slave key column can be queried with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAffinity {
    /// Integers and reals
    Numeric,
    Text,
    /// No declared type; any value compares as stored
    Any,
}

impl KeyAffinity {
    /// SQLite's column affinity rules applied to a declared type.
    pub fn from_declared_type(declared: &str) -> Self {
        let declared = declared.to_ascii_uppercase();
        if declared.contains("INT") {
            KeyAffinity::Numeric
        } else if declared.contains("CHAR") || declared.contains("CLOB") || declared.contains("TEXT") {
            KeyAffinity::Text
        } else if declared.is_empty() || declared.contains("BLOB") {
            KeyAffinity::Any
        } else {
            // REAL, FLOAT, DOUBLE, NUMERIC, DECIMAL, BOOLEAN, DATE...
            KeyAffinity::Numeric
        }
    }

    /// Affinity implied by a stored value.
    pub fn of_value(value: &Value) -> Self {
        match value {
            Value::Integer(_) | Value::Real(_) => KeyAffinity::Numeric,
            Value::Text(_) => KeyAffinity::Text,
            Value::Null | Value::Blob(_) => KeyAffinity::Any,
        }
    }

    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            KeyAffinity::Any => true,
            KeyAffinity::Numeric => matches!(value, Value::Null) || value.is_numeric(),
            KeyAffinity::Text => matches!(value, Value::Null | Value::Text(_)),
        }
    }
}

/// Relabel a master offset onto `key_columns` of `table`, failing with
/// [`ReconcileError::RangeTranslation`] when the arity differs or a key value
/// cannot be compared against the slave column.
pub(crate) fn translate_offset(
    table: &TableId,
    key_columns: &[String],
    affinities: &[KeyAffinity],
    offset: &Offset,
) -> Result<Offset> {
    if offset.primary_key().len() != key_columns.len() {
        return Err(ReconcileError::RangeTranslation(format!(
            "master key {} has {} columns but {} is keyed on {:?}",
            offset,
            offset.primary_key().len(),
            table,
            key_columns
        )));
    }
    for ((value, column), affinity) in offset.primary_key().iter().zip(key_columns).zip(affinities) {
        if !affinity.accepts(value) {
            return Err(ReconcileError::RangeTranslation(format!(
                "master key {} holds {} but {}.{} is a {:?} column",
                offset,
                value.kind(),
                table,
                column,
                affinity
            )));
        }
    }
    offset.relabel(key_columns)
}

/// Rows per page for a table of `count` rows split `split_num` ways.
pub(crate) fn split_step(count: usize, split_num: usize) -> usize {
    count.div_ceil(split_num).max(1)
}

/// Turn ordered, distinct boundary offsets `b1 < b2 < … < bk` into the plan
/// `(-inf, b1) [b1, b2) … [bk, +inf)`.
pub(crate) fn plan_from_boundaries(
    boundaries: Vec<Offset>,
    query: serde_json::Value,
) -> Vec<PageParam> {
    let mut plan = Vec::with_capacity(boundaries.len() + 1);
    let mut start = None;
    for boundary in boundaries {
        plan.push(PageParam::new(start, Some(boundary.clone())).with_query(query.clone()));
        start = Some(boundary);
    }
    plan.push(PageParam::new(start, None).with_query(query));
    plan
}
