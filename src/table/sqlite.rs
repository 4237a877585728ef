// ABOUTME: SQLite table adapter - keyset-paginated page reads over a database file
// ABOUTME: Splits tables on primary-key quantiles and interrupts queries on cancellation

use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, InterruptHandle, OpenFlags, OptionalExtension, ToSql};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{
    plan_from_boundaries, split_step, translate_offset, DbStorage, KeyAffinity, MasterTable,
    SlaveTable, StorageTable, TableId,
};
use crate::cancel;
use crate::error::{ReconcileError, Result};
use crate::offset::Offset;
use crate::page::{Page, PageParam, PageRecord};
use crate::record::{Column, Record, Value};

impl From<rusqlite::types::Value> for Value {
    fn from(value: rusqlite::types::Value) -> Self {
        match value {
            rusqlite::types::Value::Null => Value::Null,
            rusqlite::types::Value::Integer(i) => Value::Integer(i),
            rusqlite::types::Value::Real(r) => Value::Real(r),
            rusqlite::types::Value::Text(s) => Value::Text(s),
            rusqlite::types::Value::Blob(b) => Value::Blob(b),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Real(r) => ToSqlOutput::Borrowed(ValueRef::Real(*r)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// Quote an identifier for use in SQLite SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Per-table settings for the SQLite adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqliteTableOptions {
    /// Key columns to paginate on instead of the declared primary key
    pub key_columns: Option<Vec<String>>,
    /// SQL predicate applied to every read (e.g. `deleted_at IS NULL`)
    pub filter: Option<String>,
}

/// One SQLite table, usable as either side of a reconciliation.
///
/// Each adapter owns its own read-only connection; `close` drops it and later
/// reads fail with a storage error.
pub struct SqliteTable {
    id: TableId,
    conn: Arc<Mutex<Option<Connection>>>,
    interrupt: Arc<InterruptHandle>,
    key_columns: Vec<String>,
    key_affinities: Vec<KeyAffinity>,
    filter: Option<String>,
}

impl SqliteTable {
    /// Open `table` in the database at `path`.
    pub async fn open(
        path: impl AsRef<Path>,
        id: TableId,
        options: SqliteTableOptions,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || Self::open_blocking(&path, id, options)).await?
    }

    fn open_blocking(path: &Path, id: TableId, options: SqliteTableOptions) -> Result<Self> {
        let conn = open_read_only(path)?;

        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&id.name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(ReconcileError::NotFound {
                kind: "table",
                name: id.qualified_name(),
            });
        }

        let declared = table_columns(&conn, &id.name)?;
        let key_columns = match options.key_columns {
            Some(keys) => {
                for key in &keys {
                    if !declared.iter().any(|column| &column.name == key) {
                        return Err(ReconcileError::SchemaMismatch(format!(
                            "key column '{}' does not exist in {}",
                            key, id
                        )));
                    }
                }
                keys
            }
            None => {
                let mut pk: Vec<&DeclaredColumn> = declared.iter().filter(|c| c.pk > 0).collect();
                pk.sort_by_key(|c| c.pk);
                pk.into_iter().map(|c| c.name.clone()).collect()
            }
        };
        if key_columns.is_empty() {
            return Err(ReconcileError::SchemaMismatch(format!(
                "{} has no primary key and no key_columns override",
                id
            )));
        }

        let key_affinities = key_columns
            .iter()
            .map(|key| {
                declared
                    .iter()
                    .find(|c| &c.name == key)
                    .map(|c| KeyAffinity::from_declared_type(&c.declared_type))
                    .unwrap_or(KeyAffinity::Any)
            })
            .collect();

        tracing::debug!("Opened {} keyed on {:?}", id, key_columns);

        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            id,
            conn: Arc::new(Mutex::new(Some(conn))),
            interrupt,
            key_columns,
            key_affinities,
            filter: options.filter,
        })
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    fn query_param(&self) -> serde_json::Value {
        match &self.filter {
            Some(filter) => serde_json::json!({ "filter": filter }),
            None => serde_json::Value::Null,
        }
    }

    fn where_clause(&self, param: &PageParam, filter: Option<&str>) -> String {
        let keys = self
            .key_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let width = self.key_columns.len();

        let mut conditions = Vec::new();
        let mut next_param = 1;
        if param.start.is_some() {
            conditions.push(format!("({}) >= ({})", keys, placeholders(next_param, width)));
            next_param += width;
        }
        if param.end.is_some() {
            let below = format!("({}) < ({})", keys, placeholders(next_param, width));
            if param.start.is_none() {
                // NULL keys compare to NULL; pull them into the first page so
                // the read can reject them instead of silently skipping them.
                conditions.push(format!("({} OR {})", self.null_key_predicate(), below));
            } else {
                conditions.push(below);
            }
        }
        if let Some(filter) = filter {
            conditions.push(format!("({})", filter));
        }

        if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        }
    }

    fn null_key_predicate(&self) -> String {
        self.key_columns
            .iter()
            .map(|c| format!("{} IS NULL", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    fn order_by(&self) -> String {
        self.key_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Run `work` against the connection on a blocking thread, interrupting the
    /// statement if `cancel` fires first.
    async fn with_connection<T, F>(&self, cancel: &CancellationToken, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        cancel::check(cancel)?;
        let conn = Arc::clone(&self.conn);
        let id = self.id.clone();
        let task = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| ReconcileError::storage(format!("connection to {} poisoned", id)))?;
            let conn = guard
                .as_ref()
                .ok_or_else(|| ReconcileError::storage(format!("table {} is closed", id)))?;
            work(conn)
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.interrupt.interrupt();
                Err(ReconcileError::Cancelled)
            }
            result = task => result?,
        }
    }
}

#[async_trait]
impl StorageTable for SqliteTable {
    fn table(&self) -> &TableId {
        &self.id
    }

    async fn read_page(&self, cancel: &CancellationToken, param: &PageParam) -> Result<Page> {
        let filter = param.query.get("filter").and_then(|f| f.as_str());
        let sql = format!(
            "SELECT * FROM {}{} ORDER BY {}",
            quote_ident(&self.id.name),
            self.where_clause(param, filter),
            self.order_by()
        );
        let bind: Vec<Value> = param
            .start
            .iter()
            .chain(param.end.iter())
            .flat_map(|offset| offset.primary_key().iter().cloned())
            .collect();
        let key_columns = self.key_columns.clone();
        let id = self.id.clone();

        tracing::trace!("Reading page {} of {}: {}", param, self.id, sql);

        self.with_connection(cancel, move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
            let key_idx = key_columns
                .iter()
                .map(|key| {
                    names.iter().position(|n| n == key).ok_or_else(|| {
                        ReconcileError::SchemaMismatch(format!(
                            "key column '{}' missing from result set",
                            key
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let mut rows = stmt.query(rusqlite::params_from_iter(bind.iter()))?;
            let mut page = Page::new();
            while let Some(row) = rows.next()? {
                let mut columns = Vec::with_capacity(names.len());
                for (idx, name) in names.iter().enumerate() {
                    let value: rusqlite::types::Value = row.get(idx)?;
                    columns.push(Column {
                        name: name.clone(),
                        value: value.into(),
                    });
                }
                let key_values: Vec<Value> =
                    key_idx.iter().map(|i| columns[*i].value.clone()).collect();
                if let Some(pos) = key_values.iter().position(|v| matches!(v, Value::Null)) {
                    return Err(null_key_error(&id, &key_columns[pos]));
                }
                let offset = Offset::new(key_columns.clone(), key_values)?;
                page.insert(PageRecord::new(offset, Record::new(columns)))?;
            }
            Ok(page)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| ReconcileError::storage(format!("connection to {} poisoned", self.id)))?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| ReconcileError::from(e))?;
            tracing::debug!("Closed {}", self.id);
        }
        Ok(())
    }
}

#[async_trait]
impl MasterTable for SqliteTable {
    async fn split(&self, cancel: &CancellationToken, split_num: usize) -> Result<Vec<PageParam>> {
        if split_num == 0 {
            return Err(ReconcileError::InvalidInput(
                "split count must be at least 1".to_string(),
            ));
        }

        let table = quote_ident(&self.id.name);
        let keys = self.order_by();
        let filter = match &self.filter {
            Some(filter) => format!(" WHERE ({})", filter),
            None => String::new(),
        };
        let key_columns = self.key_columns.clone();
        let null_keys = format!(
            "SELECT {} FROM {} WHERE ({}){} LIMIT 1",
            keys,
            table,
            self.null_key_predicate(),
            match &self.filter {
                Some(filter) => format!(" AND ({})", filter),
                None => String::new(),
            }
        );
        let id = self.id.clone();

        let boundaries = self
            .with_connection(cancel, move |conn| {
                let mut null_stmt = conn.prepare(&null_keys)?;
                let mut rows = null_stmt.query([])?;
                if let Some(row) = rows.next()? {
                    for (idx, key) in key_columns.iter().enumerate() {
                        if row.get::<_, rusqlite::types::Value>(idx)? == rusqlite::types::Value::Null {
                            return Err(null_key_error(&id, key));
                        }
                    }
                }
                drop(rows);
                drop(null_stmt);

                let count: i64 = conn.query_row(
                    &format!("SELECT COUNT(*) FROM {}{}", table, filter),
                    [],
                    |row| row.get(0),
                )?;
                let count = count as usize;
                let step = split_step(count, split_num);

                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM {}{} ORDER BY {} LIMIT 1 OFFSET ?1",
                    keys, table, filter, keys
                ))?;
                let mut boundaries = Vec::new();
                for k in 1..split_num {
                    let idx = k * step;
                    if idx >= count {
                        break;
                    }
                    let values = stmt.query_row([idx as i64], |row| {
                        (0..key_columns.len())
                            .map(|i| row.get::<_, rusqlite::types::Value>(i).map(Value::from))
                            .collect::<rusqlite::Result<Vec<_>>>()
                    })?;
                    boundaries.push(Offset::new(key_columns.clone(), values)?);
                }
                Ok(boundaries)
            })
            .await?;

        tracing::debug!(
            "Split {} into {} pages (requested {})",
            self.id,
            boundaries.len() + 1,
            split_num
        );

        Ok(plan_from_boundaries(boundaries, self.query_param()))
    }
}

impl SlaveTable for SqliteTable {
    fn transform_page(&self, start: Option<&Offset>, end: Option<&Offset>) -> Result<PageParam> {
        let relabel =
            |offset: &Offset| translate_offset(&self.id, &self.key_columns, &self.key_affinities, offset);
        Ok(PageParam::new(start.map(relabel).transpose()?, end.map(relabel).transpose()?)
            .with_query(self.query_param()))
    }
}

/// A SQLite database file exposed as a [`DbStorage`].
pub struct SqliteStorage {
    path: PathBuf,
    database: String,
    options: HashMap<String, SqliteTableOptions>,
}

impl SqliteStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let database = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "main".to_string());
        Self {
            path,
            database,
            options: HashMap::new(),
        }
    }

    /// Override the database name used in [`TableId`]s (defaults to the file stem).
    pub fn with_database_name(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_table_options(mut self, table: impl Into<String>, options: SqliteTableOptions) -> Self {
        self.options.insert(table.into(), options);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open_table(&self, cancel: &CancellationToken, name: &str) -> Result<SqliteTable> {
        let options = self.options.get(name).cloned().unwrap_or_default();
        cancel::run(
            cancel,
            SqliteTable::open(&self.path, TableId::new(&self.database, name), options),
        )
        .await
    }
}

#[async_trait]
impl DbStorage for SqliteStorage {
    fn database(&self) -> &str {
        &self.database
    }

    async fn all_tables(&self, cancel: &CancellationToken) -> Result<Vec<TableId>> {
        let path = self.path.clone();
        let database = self.database.clone();
        let listing = tokio::task::spawn_blocking(move || -> Result<Vec<TableId>> {
            let conn = open_read_only(&path)?;
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type='table' \
                 AND name NOT LIKE 'sqlite_%' \
                 ORDER BY name",
            )?;
            let tables = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(tables
                .into_iter()
                .map(|name| TableId::new(&database, name))
                .collect())
        });
        let tables = cancel::run(cancel, async { listing.await? }).await?;
        tracing::info!("Found {} tables in {}", tables.len(), self.path.display());
        Ok(tables)
    }

    async fn master_table(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Box<dyn MasterTable>> {
        Ok(Box::new(self.open_table(cancel, name).await?))
    }

    async fn slave_table(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Box<dyn SlaveTable>> {
        Ok(Box::new(self.open_table(cancel, name).await?))
    }
}

fn open_read_only(path: &Path) -> Result<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| ReconcileError::storage(format!("failed to open {}: {}", path.display(), e)))
}

/// One row of `PRAGMA table_info`.
struct DeclaredColumn {
    name: String,
    declared_type: String,
    /// 1-based position in the primary key, 0 when not part of it
    pk: i64,
}

/// Every column of `table`, in declaration order.
fn table_columns(conn: &Connection, table: &str) -> Result<Vec<DeclaredColumn>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(DeclaredColumn {
                name: row.get(1)?,
                declared_type: row.get(2)?,
                pk: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn null_key_error(table: &TableId, column: &str) -> ReconcileError {
    ReconcileError::SchemaMismatch(format!(
        "{} has a row with NULL in key column '{}'; NULL keys cannot be paginated",
        table, column
    ))
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}
