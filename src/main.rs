// ABOUTME: CLI entry point for database-reconciler
// ABOUTME: Parses commands, composes backends from configuration and runs reconciliation jobs

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use database_reconciler::compare::{ColumnComparator, DifferType};
use database_reconciler::config::{Overrides, ReconcilerConfig};
use database_reconciler::job::{Job, JobConfig};
use database_reconciler::registry::Registries;
use database_reconciler::storage::TableDiffer;
use database_reconciler::table::TableId;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "database-reconciler")]
#[command(about = "Compare a master table set against its replica and record every difference", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct ConfigArgs {
    /// Path to a reconciler TOML configuration file
    #[arg(long = "config", env = "RECONCILER_CONFIG")]
    config_path: Option<PathBuf>,
    /// Master SQLite database (overrides [master].path)
    #[arg(long)]
    master: Option<PathBuf>,
    /// Slave SQLite database (overrides [slave].path)
    #[arg(long)]
    slave: Option<PathBuf>,
    /// Pages per table when no checkpoint exists
    #[arg(long)]
    split: Option<usize>,
    /// Tables reconciled in parallel
    #[arg(long)]
    concurrency: Option<usize>,
    /// Only these tables (comma-separated)
    #[arg(long, value_delimiter = ',')]
    tables: Option<Vec<String>>,
    /// Checkpoint directory (overrides [tracker].dir)
    #[arg(long = "state-dir")]
    state_dir: Option<PathBuf>,
    /// Diff database (overrides [differ].path)
    #[arg(long = "differ-db")]
    differ_db: Option<PathBuf>,
}

impl ConfigArgs {
    fn into_parts(self) -> (Option<PathBuf>, Overrides) {
        let overrides = Overrides {
            master: self.master,
            slave: self.slave,
            split: self.split,
            concurrency: self.concurrency,
            tables: self.tables,
            state_dir: self.state_dir,
            differ_db: self.differ_db,
        };
        (self.config_path, overrides)
    }

    /// Full configuration for reconciling, validated.
    fn resolve(self) -> anyhow::Result<ReconcilerConfig> {
        let (path, overrides) = self.into_parts();
        ReconcilerConfig::resolve(path.as_deref(), overrides)
    }

    /// Configuration for maintenance commands that only touch some sections.
    fn merge(self) -> anyhow::Result<ReconcilerConfig> {
        let (path, overrides) = self.into_parts();
        ReconcilerConfig::merge(path.as_deref(), overrides)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile master tables against the slave, resuming from checkpoints
    Run {
        #[command(flatten)]
        config: ConfigArgs,
        /// Ignore existing checkpoints and start every table from scratch
        #[arg(long)]
        no_resume: bool,
    },
    /// Print stored differences
    Report {
        #[command(flatten)]
        config: ConfigArgs,
        /// Print at most this many differences (the summary still counts all)
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Delete checkpoints so the next run starts over
    Reset {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// List the tables the master database exposes
    Tables {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; stopping after the current page");
            on_signal.cancel();
        }
    });

    let result = match cli.command {
        Commands::Run { config, no_resume } => run(config.resolve()?, no_resume, &cancel).await,
        Commands::Report { config, limit } => report(config.merge()?, limit, &cancel).await,
        Commands::Reset { config } => reset(config.merge()?, &cancel).await,
        Commands::Tables { config } => tables(config.merge()?, &cancel).await,
    };

    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}

async fn run(config: ReconcilerConfig, no_resume: bool, cancel: &CancellationToken) -> anyhow::Result<()> {
    let registries = Registries::with_builtin()?;
    let master = registries
        .open_database(&config.master)
        .await
        .context("Failed to open master database")?;
    let slave = registries
        .open_database(&config.slave)
        .await
        .context("Failed to open slave database")?;
    let tracker = registries
        .open_tracker(&config.tracker)
        .await
        .context("Failed to open checkpoint tracker")?;
    let storage = registries
        .open_differ_storage(&config.differ)
        .await
        .context("Failed to open differ storage")?;

    let job = Job::new(
        JobConfig {
            job_id: config.job_id(),
            tables: config.job.tables.clone(),
            concurrency: config.job.concurrency,
            task: config.job.task_config(),
        },
        Arc::clone(&master),
        slave,
        Arc::clone(&tracker),
        Arc::clone(&storage),
        Arc::new(ColumnComparator::ignoring(config.compare.ignore_columns.clone())),
    );

    if no_resume {
        for table in job.tables(cancel).await? {
            tracker
                .clear(cancel, &TableId::new(master.database(), table))
                .await?;
        }
    }

    let report = job.run(cancel).await;
    storage.close().await?;
    let report = report?;

    println!();
    println!("Job {}", report.job_id);
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(summary) => println!(
                "  ✓ {:<30} pages {:>4}  master {:>8}  slave {:>8}  only-master {:>6}  only-slave {:>6}  value {:>6}{}",
                outcome.table,
                summary.pages_processed,
                summary.master_records,
                summary.slave_records,
                summary.count(DifferType::OnlyMaster),
                summary.count(DifferType::OnlySlave),
                summary.count(DifferType::Value),
                if summary.resumed { "  (resumed)" } else { "" }
            ),
            Err(e) => println!("  ✗ {:<30} {}", outcome.table, e),
        }
    }

    let failed = report.failures().count();
    if failed > 0 {
        bail!(
            "{} of {} tables failed; re-run to resume from the last checkpoint",
            failed,
            report.outcomes.len()
        );
    }
    if report.is_clean() {
        println!("\nNo differences found.");
    }
    Ok(())
}

async fn report(config: ReconcilerConfig, limit: Option<usize>, cancel: &CancellationToken) -> anyhow::Result<()> {
    let wanted = &config.job.tables;

    let registries = Registries::with_builtin()?;
    let storage = registries
        .open_differ_storage(&config.differ)
        .await
        .context("Failed to open differ storage")?;

    let mut printed = 0usize;
    let mut counts: BTreeMap<(String, DifferType), u64> = BTreeMap::new();
    let mut on_differ = |item: TableDiffer| -> database_reconciler::Result<()> {
        if !wanted.is_empty() && !wanted.contains(&item.master_table.name) {
            return Ok(());
        }
        *counts
            .entry((item.master_table.qualified_name(), item.differ.kind()))
            .or_insert(0) += 1;
        if limit.map_or(true, |limit| printed < limit) {
            println!("{}", serde_json::to_string(&item)?);
            printed += 1;
        }
        Ok(())
    };
    let read = storage.read(cancel, &mut on_differ).await;
    storage.close().await?;
    read?;

    println!();
    if counts.is_empty() {
        println!("No differences stored.");
    }
    for ((table, kind), count) in &counts {
        println!("  {:<40} {:<12} {:>8}", table, kind.as_str(), count);
    }
    Ok(())
}

async fn reset(config: ReconcilerConfig, cancel: &CancellationToken) -> anyhow::Result<()> {
    let registries = Registries::with_builtin()?;
    let tracker = registries.open_tracker(&config.tracker).await?;

    let master = registries.open_database(&config.master).await?;

    let tables = if config.job.tables.is_empty() {
        master
            .all_tables(cancel)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect()
    } else {
        config.job.tables.clone()
    };

    for table in &tables {
        tracker
            .clear(cancel, &TableId::new(master.database(), table.as_str()))
            .await?;
    }
    println!("Cleared checkpoints for {} tables", tables.len());
    Ok(())
}

async fn tables(config: ReconcilerConfig, cancel: &CancellationToken) -> anyhow::Result<()> {
    let registries = Registries::with_builtin()?;
    let master = registries.open_database(&config.master).await?;
    for table in master.all_tables(cancel).await? {
        println!("{}", table);
    }
    Ok(())
}
