// ABOUTME: End-to-end reconciliation tests over real SQLite files
// ABOUTME: Covers the classic master/slave scenario, key renames, filters and ignored columns

use std::path::{Path, PathBuf};
use std::sync::Arc;

use database_reconciler::compare::{ColumnComparator, DifferType};
use database_reconciler::job::{Job, JobConfig};
use database_reconciler::record::Value;
use database_reconciler::storage::{DifferStorage, SqliteDifferStorage, TableDiffer};
use database_reconciler::table::{SqliteStorage, SqliteTableOptions};
use database_reconciler::task::TaskConfig;
use database_reconciler::tracker::FileTracker;
use rusqlite::Connection;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn create_db(path: &Path, ddl: &str) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(ddl).unwrap();
}

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    async fn differ_storage(&self) -> Arc<SqliteDifferStorage> {
        Arc::new(
            SqliteDifferStorage::open(self.path("differs.db"))
                .await
                .unwrap(),
        )
    }

    fn job(
        &self,
        master: SqliteStorage,
        slave: SqliteStorage,
        storage: Arc<SqliteDifferStorage>,
        comparator: ColumnComparator,
        split: usize,
    ) -> Job {
        Job::new(
            JobConfig {
                job_id: "test-job".to_string(),
                tables: Vec::new(),
                concurrency: 2,
                task: TaskConfig {
                    split_num: split,
                    progress_every: 1,
                },
            },
            Arc::new(master),
            Arc::new(slave),
            Arc::new(FileTracker::new(self.path("checkpoints"))),
            storage,
            Arc::new(comparator),
        )
    }
}

async fn stored(storage: &SqliteDifferStorage) -> Vec<TableDiffer> {
    let mut out = Vec::new();
    storage
        .read(&CancellationToken::new(), &mut |item| {
            out.push(item);
            Ok(())
        })
        .await
        .unwrap();
    out
}

#[tokio::test]
async fn test_scenario_over_sqlite() {
    let env = Env::new();
    create_db(
        &env.path("primary.db"),
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO users VALUES (1, 'a'), (2, 'b'), (3, 'c');",
    );
    create_db(
        &env.path("replica.db"),
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO users VALUES (2, 'b'), (3, 'x'), (4, 'd');",
    );

    let storage = env.differ_storage().await;
    let report = env
        .job(
            SqliteStorage::new(env.path("primary.db")),
            SqliteStorage::new(env.path("replica.db")),
            Arc::clone(&storage),
            ColumnComparator::new(),
            1,
        )
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    let summary = report.summaries().next().unwrap();
    assert_eq!(summary.count(DifferType::None), 1);

    let differs = stored(&storage).await;
    let kinds: Vec<DifferType> = differs.iter().map(|d| d.differ.kind()).collect();
    assert_eq!(
        kinds,
        vec![DifferType::OnlyMaster, DifferType::Value, DifferType::OnlySlave]
    );

    assert_eq!(differs[0].master_table.qualified_name(), "primary.users");
    assert_eq!(differs[0].slave_table.qualified_name(), "replica.users");
    assert_eq!(
        differs[0].differ.master_column().unwrap().get("id"),
        Some(&Value::Integer(1))
    );
    let value = &differs[1].differ;
    assert_eq!(
        value.master_column().unwrap().get("name"),
        Some(&Value::from("c"))
    );
    assert_eq!(
        value.slave_column().unwrap().get("name"),
        Some(&Value::from("x"))
    );
    assert!(value.master_column().unwrap().get("id").is_none());
    assert_eq!(
        differs[2].differ.slave_column().unwrap().get("name"),
        Some(&Value::from("d"))
    );
}

#[tokio::test]
async fn test_many_pages_many_tables() {
    let env = Env::new();
    let mut master = String::from(
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY, owner TEXT, balance REAL);
         CREATE TABLE events (region TEXT, seq INTEGER, payload TEXT, PRIMARY KEY (region, seq));",
    );
    let mut slave = master.clone();
    for id in 1..=200 {
        master.push_str(&format!(
            "INSERT INTO accounts VALUES ({}, 'owner{}', {}.5);",
            id, id, id
        ));
        if id == 17 || id == 150 {
            continue;
        }
        let balance = if id == 99 { 0.0 } else { id as f64 + 0.5 };
        slave.push_str(&format!(
            "INSERT INTO accounts VALUES ({}, 'owner{}', {});",
            id, id, balance
        ));
    }
    slave.push_str("INSERT INTO accounts VALUES (500, 'ghost', 1.0);");
    for region in ["eu", "us"] {
        for seq in 1..=30 {
            let row = format!("INSERT INTO events VALUES ('{}', {}, 'p{}');", region, seq, seq);
            master.push_str(&row);
            slave.push_str(&row);
        }
    }
    create_db(&env.path("primary.db"), &master);
    create_db(&env.path("replica.db"), &slave);

    let storage = env.differ_storage().await;
    let report = env
        .job(
            SqliteStorage::new(env.path("primary.db")),
            SqliteStorage::new(env.path("replica.db")),
            Arc::clone(&storage),
            ColumnComparator::new(),
            7,
        )
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_success());
    let tables: Vec<&str> = report.outcomes.iter().map(|o| o.table.as_str()).collect();
    assert_eq!(tables, vec!["accounts", "events"]);

    let accounts = &report.outcomes[0].result.as_ref().unwrap();
    assert_eq!(accounts.pages_planned, 7);
    assert_eq!(accounts.master_records, 200);
    assert_eq!(accounts.slave_records, 199);
    assert_eq!(accounts.count(DifferType::OnlyMaster), 2);
    assert_eq!(accounts.count(DifferType::OnlySlave), 1);
    assert_eq!(accounts.count(DifferType::Value), 1);

    let events = &report.outcomes[1].result.as_ref().unwrap();
    assert!(events.is_clean());
    assert_eq!(events.count(DifferType::None), 60);

    assert_eq!(storage.count().await.unwrap(), 4);
    let by_type = storage.count_by_type().await.unwrap();
    assert_eq!(by_type[&DifferType::OnlyMaster], 2);
}

#[tokio::test]
async fn test_renamed_slave_key_and_filters() {
    let env = Env::new();
    create_db(
        &env.path("primary.db"),
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, deleted INTEGER);
         INSERT INTO users VALUES (1, 'a', 0), (2, 'b', 1), (3, 'c', 0);",
    );
    create_db(
        &env.path("replica.db"),
        "CREATE TABLE users (user_id INTEGER PRIMARY KEY, name TEXT, deleted INTEGER);
         INSERT INTO users VALUES (1, 'a', 0), (3, 'c', 0);",
    );

    let live_only = SqliteTableOptions {
        key_columns: None,
        filter: Some("deleted = 0".to_string()),
    };
    let storage = env.differ_storage().await;
    let report = env
        .job(
            SqliteStorage::new(env.path("primary.db")).with_table_options("users", live_only.clone()),
            SqliteStorage::new(env.path("replica.db")).with_table_options("users", live_only),
            Arc::clone(&storage),
            ColumnComparator::new(),
            2,
        )
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(storage.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_ignored_columns() {
    let env = Env::new();
    create_db(
        &env.path("primary.db"),
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, synced_at TEXT);
         INSERT INTO users VALUES (1, 'a', '2024-01-01'), (2, 'b', '2024-01-01');",
    );
    create_db(
        &env.path("replica.db"),
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, synced_at TEXT);
         INSERT INTO users VALUES (1, 'a', '2024-02-01'), (2, 'B', '2024-02-01');",
    );

    let storage = env.differ_storage().await;
    env.job(
        SqliteStorage::new(env.path("primary.db")),
        SqliteStorage::new(env.path("replica.db")),
        Arc::clone(&storage),
        ColumnComparator::ignoring(["synced_at"]),
        1,
    )
    .run(&CancellationToken::new())
    .await
    .unwrap();

    let differs = stored(&storage).await;
    assert_eq!(differs.len(), 1);
    let differ = &differs[0].differ;
    assert_eq!(differ.kind(), DifferType::Value);
    assert_eq!(differ.master_column().unwrap().len(), 1);
    assert_eq!(
        differ.slave_column().unwrap().get("name"),
        Some(&Value::from("B"))
    );
}

#[tokio::test]
async fn test_schema_drift_fails_the_table() {
    let env = Env::new();
    create_db(
        &env.path("primary.db"),
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO users VALUES (1, 'a');",
    );
    create_db(
        &env.path("replica.db"),
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, extra TEXT);
         INSERT INTO users VALUES (1, 'a', NULL);",
    );

    let storage = env.differ_storage().await;
    let report = env
        .job(
            SqliteStorage::new(env.path("primary.db")),
            SqliteStorage::new(env.path("replica.db")),
            Arc::clone(&storage),
            ColumnComparator::new(),
            1,
        )
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let (table, err) = report.failures().next().unwrap();
    assert_eq!(table, "users");
    assert!(matches!(
        err,
        database_reconciler::ReconcileError::ColumnCountMismatch { master: 2, slave: 3 }
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_infinite_reals_are_stored_and_replayed() {
    let env = Env::new();
    create_db(
        &env.path("primary.db"),
        "CREATE TABLE readings (id INTEGER PRIMARY KEY, value REAL);
         INSERT INTO readings VALUES (1, 9e999), (2, 1.0), (3, -9e999);",
    );
    create_db(
        &env.path("replica.db"),
        "CREATE TABLE readings (id INTEGER PRIMARY KEY, value REAL);
         INSERT INTO readings VALUES (2, 1.0), (3, 0.0);",
    );

    let storage = env.differ_storage().await;
    let report = env
        .job(
            SqliteStorage::new(env.path("primary.db")),
            SqliteStorage::new(env.path("replica.db")),
            Arc::clone(&storage),
            ColumnComparator::new(),
            2,
        )
        .run(&CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());

    let differs = stored(&storage).await;
    assert_eq!(differs.len(), 2);
    assert_eq!(
        differs[0].differ.master_column().unwrap().get("value"),
        Some(&Value::Real(f64::INFINITY))
    );
    assert_eq!(differs[1].differ.kind(), DifferType::Value);
    assert_eq!(
        differs[1].differ.master_column().unwrap().get("value"),
        Some(&Value::Real(f64::NEG_INFINITY))
    );
}

#[tokio::test]
async fn test_null_primary_key_fails_instead_of_vanishing() {
    let env = Env::new();
    create_db(
        &env.path("primary.db"),
        "CREATE TABLE t (k TEXT PRIMARY KEY);
         INSERT INTO t VALUES (NULL), ('a'), ('b');",
    );
    create_db(
        &env.path("replica.db"),
        "CREATE TABLE t (k TEXT PRIMARY KEY);
         INSERT INTO t VALUES ('a'), ('b');",
    );

    for split in [1, 2] {
        let storage = env.differ_storage().await;
        let report = env
            .job(
                SqliteStorage::new(env.path("primary.db")),
                SqliteStorage::new(env.path("replica.db")),
                Arc::clone(&storage),
                ColumnComparator::new(),
                split,
            )
            .run(&CancellationToken::new())
            .await
            .unwrap();
        let (_, err) = report.failures().next().unwrap();
        assert!(
            matches!(err, database_reconciler::ReconcileError::SchemaMismatch(_)),
            "split {}: {}",
            split,
            err
        );
        assert_eq!(storage.count().await.unwrap(), 0);
    }
}

#[tokio::test]
async fn test_incompatible_slave_key_type_is_range_translation() {
    let env = Env::new();
    create_db(
        &env.path("primary.db"),
        "CREATE TABLE users (k INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO users VALUES (1, 'a'), (2, 'b'), (3, 'c');",
    );
    create_db(
        &env.path("replica.db"),
        "CREATE TABLE users (k TEXT PRIMARY KEY, name TEXT);
         INSERT INTO users VALUES ('1', 'a'), ('2', 'b'), ('3', 'c');",
    );

    let storage = env.differ_storage().await;
    let report = env
        .job(
            SqliteStorage::new(env.path("primary.db")),
            SqliteStorage::new(env.path("replica.db")),
            Arc::clone(&storage),
            ColumnComparator::new(),
            2,
        )
        .run(&CancellationToken::new())
        .await
        .unwrap();
    let (_, err) = report.failures().next().unwrap();
    assert!(matches!(
        err,
        database_reconciler::ReconcileError::RangeTranslation(_)
    ));
}
