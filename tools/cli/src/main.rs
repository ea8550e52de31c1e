//! TableSync CLI - Command line interface for inspecting offline stores.
//!
//! This tool opens a SQLite-backed local store and shows its pending
//! operations and pull watermarks, or purges a table locally.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tablesync_common::{Comparison, Query};
use tablesync_storage::{LocalStore, SqliteStore};
use tablesync_sync::operations::LogRecord;
use tablesync_sync::schema::{self, operation_columns, pulltime_columns};
use tablesync_sync::{OperationLog, PurgeEngine, SerialTaskQueue, SyncConfig};

#[derive(Parser)]
#[command(name = "tablesync")]
#[command(about = "TableSync - Offline table store inspection")]
#[command(version)]
struct Cli {
    /// Path to the SQLite store.
    #[arg(short, long)]
    db: PathBuf,

    /// JSON file with sync configuration overrides.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tables in the store.
    Tables,

    /// List pending operations, oldest first.
    Pending {
        /// Only show operations on this table.
        #[arg(short, long)]
        table: Option<String>,
    },

    /// List incremental pull watermarks.
    Watermarks,

    /// Remove a table's local records and sync state.
    Purge {
        /// Table to purge.
        #[arg(short, long)]
        table: String,

        /// Discard pending operations instead of refusing.
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref()).await?;
    let store = Arc::new(
        SqliteStore::open(&cli.db)
            .with_context(|| format!("Failed to open store {}", cli.db.display()))?,
    );

    match cli.command {
        Commands::Tables => cmd_tables(&store).await,

        Commands::Pending { table } => cmd_pending(store, &config, table.as_deref()).await,

        Commands::Watermarks => cmd_watermarks(store, &config).await,

        Commands::Purge { table, force } => cmd_purge(store, &config, &table, force).await,
    }
}

/// Load the sync configuration, falling back to the defaults.
async fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    let config = match path {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str::<SyncConfig>(&raw).context("Invalid config file")?
        }
        None => SyncConfig::default(),
    };
    config.validate().context("Invalid sync configuration")?;
    Ok(config)
}

/// List tables.
async fn cmd_tables(store: &SqliteStore) -> Result<()> {
    let names = store.table_names().await.context("Failed to list tables")?;

    if names.is_empty() {
        println!("Store is empty.");
    } else {
        for name in names {
            println!("  {}", name);
        }
    }

    Ok(())
}

/// List pending operations.
async fn cmd_pending(
    store: Arc<SqliteStore>,
    config: &SyncConfig,
    table: Option<&str>,
) -> Result<()> {
    let log = OperationLog::new(store.clone(), config.operation_table.clone());
    log.initialize()
        .await
        .context("Failed to open operation log")?;

    let mut query = Query::new(log.table()).order_by(operation_columns::ID);
    if let Some(table) = table {
        query = query.filter(operation_columns::TABLE_NAME, Comparison::Eq, table);
    }

    let rows = store
        .read(&query)
        .await
        .context("Failed to read operation log")?
        .into_iter()
        .map(LogRecord::from_record)
        .collect::<tablesync_common::Result<Vec<_>>>()
        .context("Corrupt operation log")?;

    if rows.is_empty() {
        println!("No pending operations.");
        return Ok(());
    }

    println!("Pending operations ({}):", rows.len());
    for row in rows {
        let version = row.metadata.version.as_deref().unwrap_or("-");
        println!(
            "  #{:<6} {:<7} {}/{} (version {})",
            row.id, row.action, row.table_name, row.item_id, version
        );
    }

    Ok(())
}

/// List pull watermarks.
async fn cmd_watermarks(store: Arc<SqliteStore>, config: &SyncConfig) -> Result<()> {
    store
        .define_table(&schema::pulltime_table(&config.pulltime_table))
        .await
        .context("Failed to open watermark table")?;

    let rows = store
        .read(&Query::new(&config.pulltime_table).order_by(pulltime_columns::ID))
        .await
        .context("Failed to read watermarks")?;

    if rows.is_empty() {
        println!("No watermarks.");
        return Ok(());
    }

    for row in rows {
        let field = |name: &str| {
            row.get(name)
                .and_then(serde_json::Value::as_str)
                .unwrap_or("?")
                .to_string()
        };
        println!(
            "  {} [{}] {}",
            field(pulltime_columns::ID),
            field(pulltime_columns::TABLE_NAME),
            field(pulltime_columns::VALUE)
        );
    }

    Ok(())
}

/// Purge a table.
async fn cmd_purge(
    store: Arc<SqliteStore>,
    config: &SyncConfig,
    table: &str,
    force: bool,
) -> Result<()> {
    info!("Purging table {}", table);

    let log = OperationLog::new(store.clone(), config.operation_table.clone());
    log.initialize()
        .await
        .context("Failed to open operation log")?;
    store
        .define_table(&schema::pulltime_table(&config.pulltime_table))
        .await
        .context("Failed to open watermark table")?;

    let engine = PurgeEngine::new(store, Arc::new(SerialTaskQueue::new("store")), config);
    engine
        .purge(&Query::new(table), force)
        .await
        .with_context(|| format!("Failed to purge {}", table))?;

    println!("Table {} purged.", table);
    Ok(())
}
