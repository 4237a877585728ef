// ABOUTME: In-memory table adapter - sorted records held behind an Arc
// ABOUTME: Used by tests and by embedders that already hold both datasets in memory

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{
    plan_from_boundaries, split_step, translate_offset, DbStorage, KeyAffinity, MasterTable,
    SlaveTable, StorageTable, TableId,
};
use crate::cancel;
use crate::error::{ReconcileError, Result};
use crate::offset::Offset;
use crate::page::{Page, PageParam, PageRecord};
use crate::record::{Record, Value};

/// A table whose rows live in memory, sorted by primary key.
///
/// Cloning via [`MemoryTable::handle`] shares the rows but gives the new
/// adapter its own open/closed state.
pub struct MemoryTable {
    id: TableId,
    key_columns: Vec<String>,
    /// Taken from the first non-NULL value of each key column
    key_affinities: Vec<KeyAffinity>,
    rows: Arc<Vec<PageRecord>>,
    closed: AtomicBool,
}

impl MemoryTable {
    /// Build a table from unordered rows. Every row must carry all `key_columns`
    /// and keys must be unique.
    pub fn new(id: TableId, key_columns: Vec<String>, rows: Vec<Record>) -> Result<Self> {
        let mut records = rows
            .into_iter()
            .map(|record| {
                let offset = Offset::from_record(&record, &key_columns)?;
                Ok(PageRecord::new(offset, record))
            })
            .collect::<Result<Vec<_>>>()?;

        // Validate comparability up front so the sort below cannot hit an error.
        if let Some(first) = records.first() {
            for record in &records[1..] {
                first.offset.compare(&record.offset)?;
            }
        }
        records.sort_by(|a, b| {
            a.offset
                .compare(&b.offset)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for pair in records.windows(2) {
            if pair[0].offset.compare(&pair[1].offset)? == std::cmp::Ordering::Equal {
                return Err(ReconcileError::InvalidInput(format!(
                    "duplicate primary key {} in {}",
                    pair[0].offset, id
                )));
            }
        }

        let key_affinities = (0..key_columns.len())
            .map(|idx| {
                records
                    .iter()
                    .map(|r| &r.offset.primary_key()[idx])
                    .find(|v| !matches!(v, Value::Null))
                    .map(KeyAffinity::of_value)
                    .unwrap_or(KeyAffinity::Any)
            })
            .collect();

        Ok(Self {
            id,
            key_columns,
            key_affinities,
            rows: Arc::new(records),
            closed: AtomicBool::new(false),
        })
    }

    /// A fresh adapter over the same rows.
    pub fn handle(&self) -> Self {
        Self {
            id: self.id.clone(),
            key_columns: self.key_columns.clone(),
            key_affinities: self.key_affinities.clone(),
            rows: Arc::clone(&self.rows),
            closed: AtomicBool::new(false),
        }
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ReconcileError::storage(format!("table {} is closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageTable for MemoryTable {
    fn table(&self) -> &TableId {
        &self.id
    }

    async fn read_page(&self, cancel: &CancellationToken, param: &PageParam) -> Result<Page> {
        cancel::check(cancel)?;
        self.ensure_open()?;

        let mut page = Page::new();
        for row in self.rows.iter() {
            if param.contains(&row.offset)? {
                page.insert(row.clone())?;
            }
        }
        Ok(page)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MasterTable for MemoryTable {
    async fn split(&self, cancel: &CancellationToken, split_num: usize) -> Result<Vec<PageParam>> {
        if split_num == 0 {
            return Err(ReconcileError::InvalidInput(
                "split count must be at least 1".to_string(),
            ));
        }
        cancel::check(cancel)?;
        self.ensure_open()?;

        let step = split_step(self.rows.len(), split_num);
        let boundaries = (1..split_num)
            .map(|k| k * step)
            .take_while(|idx| *idx < self.rows.len())
            .map(|idx| self.rows[idx].offset.clone())
            .collect();
        Ok(plan_from_boundaries(boundaries, serde_json::Value::Null))
    }
}

impl SlaveTable for MemoryTable {
    fn transform_page(&self, start: Option<&Offset>, end: Option<&Offset>) -> Result<PageParam> {
        let relabel =
            |offset: &Offset| translate_offset(&self.id, &self.key_columns, &self.key_affinities, offset);
        Ok(PageParam::new(
            start.map(relabel).transpose()?,
            end.map(relabel).transpose()?,
        ))
    }
}

/// A named collection of [`MemoryTable`]s acting as one database.
pub struct MemoryStorage {
    database: String,
    tables: BTreeMap<String, MemoryTable>,
}

impl MemoryStorage {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            tables: BTreeMap::new(),
        }
    }

    /// Add a table. The table keeps the name it was created with.
    pub fn with_table(mut self, table: MemoryTable) -> Self {
        self.tables.insert(table.id.name.clone(), table);
        self
    }

    fn lookup(&self, name: &str) -> Result<MemoryTable> {
        self.tables
            .get(name)
            .map(MemoryTable::handle)
            .ok_or_else(|| ReconcileError::NotFound {
                kind: "table",
                name: format!("{}.{}", self.database, name),
            })
    }
}

#[async_trait]
impl DbStorage for MemoryStorage {
    fn database(&self) -> &str {
        &self.database
    }

    async fn all_tables(&self, cancel: &CancellationToken) -> Result<Vec<TableId>> {
        cancel::check(cancel)?;
        Ok(self.tables.values().map(|t| t.id.clone()).collect())
    }

    async fn master_table(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Box<dyn MasterTable>> {
        cancel::check(cancel)?;
        Ok(Box::new(self.lookup(name)?))
    }

    async fn slave_table(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Box<dyn SlaveTable>> {
        cancel::check(cancel)?;
        Ok(Box::new(self.lookup(name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::check_plan;
    use crate::record::Column;

    fn users(ids: &[i64]) -> MemoryTable {
        let rows = ids
            .iter()
            .map(|id| Record::new(vec![Column::new("id", *id), Column::new("name", format!("u{}", id))]))
            .collect();
        MemoryTable::new(TableId::new("mem", "users"), vec!["id".to_string()], rows).unwrap()
    }

    #[tokio::test]
    async fn test_split_covers_all_rows_exactly_once() {
        let table = users(&[9, 3, 7, 1, 5, 2, 8]);
        let cancel = CancellationToken::new();
        for n in 1..=10 {
            let plan = table.split(&cancel, n).await.unwrap();
            assert!(plan.len() <= n);
            check_plan(&plan, true).unwrap();

            let mut seen = 0;
            for param in &plan {
                seen += table.read_page(&cancel, param).await.unwrap().len();
            }
            assert_eq!(seen, 7, "split({}) lost or duplicated rows", n);
        }
    }

    #[tokio::test]
    async fn test_split_is_deterministic() {
        let table = users(&[4, 1, 3, 2]);
        let cancel = CancellationToken::new();
        let first = table.split(&cancel, 3).await.unwrap();
        let second = table.handle().split(&cancel, 3).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_split_zero_is_rejected() {
        let table = users(&[1]);
        let err = table.split(&CancellationToken::new(), 0).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_empty_table_splits_into_one_page() {
        let table = users(&[]);
        let plan = table.split(&CancellationToken::new(), 4).await.unwrap();
        assert_eq!(plan, vec![PageParam::unbounded()]);
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let rows = vec![
            Record::new(vec![Column::new("id", 1)]),
            Record::new(vec![Column::new("id", 1)]),
        ];
        let result = MemoryTable::new(TableId::new("mem", "t"), vec!["id".to_string()], rows);
        assert!(result.is_err());
    }

    #[test]
    fn test_transform_page_relabels_and_checks_arity() {
        let slave = MemoryTable::new(
            TableId::new("mem", "replica"),
            vec!["user_id".to_string()],
            vec![],
        )
        .unwrap();
        let param = slave
            .transform_page(Some(&Offset::single("id", 1)), None)
            .unwrap();
        let start = param.start.unwrap();
        assert_eq!(start.primary_key_columns(), &["user_id".to_string()]);
        assert_eq!(start.primary_key(), &[Value::Integer(1)]);

        let wide = Offset::new(
            vec!["a".into(), "b".into()],
            vec![Value::Integer(1), Value::Integer(2)],
        )
        .unwrap();
        let err = slave.transform_page(Some(&wide), None).unwrap_err();
        assert!(matches!(err, ReconcileError::RangeTranslation(_)));
    }

    #[test]
    fn test_transform_page_rejects_incompatible_key_kinds() {
        let slave = MemoryTable::new(
            TableId::new("mem", "replica"),
            vec!["id".to_string()],
            vec![Record::new(vec![Column::new("id", "a")])],
        )
        .unwrap();
        let err = slave
            .transform_page(Some(&Offset::single("id", 1)), None)
            .unwrap_err();
        assert!(matches!(err, ReconcileError::RangeTranslation(_)));
        assert!(slave
            .transform_page(Some(&Offset::single("id", "b")), None)
            .is_ok());

        // Integer and real keys live in the same numeric space.
        let numeric = users(&[1, 2]);
        assert!(numeric
            .transform_page(None, Some(&Offset::single("id", 1.5)))
            .is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_reads() {
        let table = users(&[1, 2]);
        table.close().await.unwrap();
        table.close().await.unwrap();
        let err = table
            .read_page(&CancellationToken::new(), &PageParam::unbounded())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_storage_lookup() {
        let storage = MemoryStorage::new("mem").with_table(users(&[1]));
        let cancel = CancellationToken::new();
        assert_eq!(
            storage.all_tables(&cancel).await.unwrap(),
            vec![TableId::new("mem", "users")]
        );
        assert!(storage.master_table(&cancel, "users").await.is_ok());
        assert!(matches!(
            storage.slave_table(&cancel, "nope").await,
            Err(ReconcileError::NotFound { .. })
        ));
    }
}
