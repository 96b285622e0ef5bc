use chrono::Utc;
use clap::Parser;
use engagement_ledger::application::Services;
use engagement_ledger::application::sweeper::Sweeper;
use engagement_ledger::config::EngineConfig;
use engagement_ledger::domain::ports::{EngagementStore, LedgerStore, Stores};
use engagement_ledger::infrastructure::clock::ManualClock;
use engagement_ledger::infrastructure::coverage::FlatCoverage;
use engagement_ledger::infrastructure::registry::ConnectionRegistry;
use engagement_ledger::interfaces::csv::operation_reader::OperationReader;
use engagement_ledger::interfaces::csv::snapshot_writer::SnapshotWriter;
use engagement_ledger::interfaces::replay;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input operations CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Run the timeout sweeper in the background every N seconds while replaying.
    #[arg(long)]
    sweep_interval_secs: Option<u64>,
}

#[cfg_attr(not(feature = "storage-rocksdb"), allow(unused_variables))]
fn open_stores(db_path: Option<PathBuf>, clock: &ManualClock) -> Result<Stores> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store = engagement_ledger::infrastructure::rocksdb::RocksDBStore::open(path)
                .into_diagnostic()?
                .with_clock(Arc::new(clock.clone()));
            Ok(store.stores())
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => {
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
            Ok(Stores::in_memory())
        }
        None => Ok(Stores::in_memory()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("engagement_ledger=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env().into_diagnostic()?;
    if let Some(secs) = cli.sweep_interval_secs {
        config.sweep_interval = Duration::from_secs(secs.max(1));
    }

    let clock = ManualClock::new(Utc::now());
    let stores = open_stores(cli.db_path, &clock)?;
    let services = Services::new(
        stores.clone(),
        Arc::new(ConnectionRegistry::new()),
        Arc::new(FlatCoverage::default()),
        Arc::new(clock.clone()),
        config.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = cli.sweep_interval_secs.map(|_| {
        Sweeper::new(services.engine.clone(), config.sweep_interval).spawn(shutdown_rx)
    });

    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = OperationReader::new(file);
    let mut line = 1;
    for record in reader.operations() {
        line += 1;
        match record {
            Ok(record) => {
                let op = record.op;
                if let Err(e) = replay::execute(&services, &clock, record).await {
                    error!(line, ?op, error = %e, "Operation failed");
                }
            }
            Err(e) => {
                error!(line, error = %e, "Unreadable operation");
            }
        }
    }

    if let Some(handle) = sweeper {
        let _ = shutdown_tx.send(true);
        handle.await.into_diagnostic()?;
    }

    let engagements = stores.engagements.get_all().await.into_diagnostic()?;
    let ledgers = stores.ledgers.get_all().await.into_diagnostic()?;
    info!(
        engagements = engagements.len(),
        accounts = ledgers.len(),
        "Replay finished"
    );

    let stdout = io::stdout();
    let mut writer = SnapshotWriter::new(stdout.lock());
    writer.write(&engagements, &ledgers).into_diagnostic()?;

    Ok(())
}
