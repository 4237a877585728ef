// ABOUTME: SQLite-backed diff sink - one append-only row per differ
// ABOUTME: Autoincrement ids preserve write order; WAL with FULL sync makes each insert durable

use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{DifferStorage, FetchDiffer, OnDiffer, TableDiffer};
use crate::cancel;
use crate::compare::{Differ, DifferType};
use crate::error::{ReconcileError, Result};
use crate::table::TableId;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS differs (
    differ_id       INTEGER PRIMARY KEY AUTOINCREMENT,
    master_database TEXT NOT NULL,
    master_table    TEXT NOT NULL,
    slave_database  TEXT NOT NULL,
    slave_table     TEXT NOT NULL,
    differ_type     TEXT NOT NULL,
    record_key      TEXT NOT NULL,
    payload         TEXT NOT NULL,
    created_at      TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS differs_by_table ON differs(master_database, master_table);
"#;

const READ_BATCH: i64 = 512;

/// Differ sink stored in a SQLite database file.
pub struct SqliteDifferStorage {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteDifferStorage {
    /// Open (or create) the sink at `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = open_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let conn = Connection::open(&open_path)?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
            tracing::trace!("Differ storage journal mode: {}", mode);
            conn.pragma_update(None, "synchronous", "full")?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await??;

        tracing::debug!("Opened differ storage at {}", path.display());
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of stored differs.
    pub async fn count(&self) -> Result<u64> {
        self.blocking(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM differs", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    /// Stored differs grouped by type.
    pub async fn count_by_type(&self) -> Result<BTreeMap<DifferType, u64>> {
        self.blocking(|conn| {
            let mut stmt = conn
                .prepare("SELECT differ_type, COUNT(*) FROM differs GROUP BY differ_type")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(kind, count)| Ok((DifferType::parse(&kind)?, count as u64)))
                .collect()
        })
        .await
    }

    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| ReconcileError::storage("differ storage connection poisoned"))?;
            let conn = guard.as_ref().ok_or_else(|| {
                ReconcileError::storage(format!("differ storage {} is closed", path.display()))
            })?;
            work(conn)
        })
        .await?
    }
}

fn insert(conn: &Connection, item: &TableDiffer) -> Result<()> {
    let payload = serde_json::to_string(&item.differ)?;
    conn.execute(
        "INSERT INTO differs(master_database, master_table, slave_database, slave_table, differ_type, record_key, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            item.master_table.database,
            item.master_table.name,
            item.slave_table.database,
            item.slave_table.name,
            item.differ.kind().as_str(),
            item.differ.key(),
            payload,
        ],
    )?;
    Ok(())
}

fn fetch_batch(conn: &Connection, after: i64) -> Result<Vec<(i64, TableDiffer)>> {
    let mut stmt = conn.prepare(
        "SELECT differ_id, master_database, master_table, slave_database, slave_table, payload
         FROM differs
         WHERE differ_id > ?1
         ORDER BY differ_id ASC
         LIMIT ?2",
    )?;
    let mut rows = stmt.query(params![after, READ_BATCH])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let payload: String = row.get(5)?;
        let differ: Differ = serde_json::from_str(&payload)?;
        out.push((
            row.get(0)?,
            TableDiffer::new(
                TableId::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
                TableId::new(row.get::<_, String>(3)?, row.get::<_, String>(4)?),
                differ,
            ),
        ));
    }
    Ok(out)
}

#[async_trait]
impl DifferStorage for SqliteDifferStorage {
    async fn write(&self, cancel: &CancellationToken, fetch: &mut FetchDiffer<'_>) -> Result<u64> {
        let mut written = 0;
        loop {
            cancel::check(cancel)?;
            let Some(item) = fetch()? else {
                return Ok(written);
            };
            cancel::run(cancel, self.blocking(move |conn| insert(conn, &item))).await?;
            written += 1;
        }
    }

    async fn read(&self, cancel: &CancellationToken, on_differ: &mut OnDiffer<'_>) -> Result<u64> {
        let mut after = 0;
        let mut delivered = 0;
        loop {
            let batch =
                cancel::run(cancel, self.blocking(move |conn| fetch_batch(conn, after))).await?;
            if batch.is_empty() {
                return Ok(delivered);
            }
            for (id, item) in batch {
                cancel::check(cancel)?;
                on_differ(item)?;
                after = id;
                delivered += 1;
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let taken = tokio::task::spawn_blocking(move || -> Result<bool> {
            let mut guard = conn
                .lock()
                .map_err(|_| ReconcileError::storage("differ storage connection poisoned"))?;
            match guard.take() {
                Some(conn) => {
                    conn.close().map_err(|(_, e)| ReconcileError::from(e))?;
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await??;
        if taken {
            tracing::debug!("Closed differ storage at {}", self.path.display());
        }
        Ok(())
    }
}
