use clap::Parser;
use escrow_ledger::application::marketplace::{Marketplace, Stores};
use escrow_ledger::config::Settings;
use escrow_ledger::infrastructure::in_memory::InMemoryPackageCatalog;
use escrow_ledger::interfaces::csv::command_reader::CommandReader;
use escrow_ledger::interfaces::csv::wallet_writer::WalletWriter;
use escrow_ledger::interfaces::replay::CommandReplayer;
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input commands CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// TOML settings file; `ESCROW__*` environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).into_diagnostic()?;
    let stores = open_stores(cli.db_path.as_deref()).into_diagnostic()?;

    let catalog = Arc::new(InMemoryPackageCatalog::new());
    let marketplace = Marketplace::new(stores, catalog.clone(), &settings);
    let mut replayer = CommandReplayer::new(marketplace, catalog);

    let file = File::open(&cli.input).into_diagnostic()?;
    for command in CommandReader::new(file).commands() {
        match command {
            Ok(command) => {
                if let Err(e) = replayer.apply(command).await {
                    eprintln!("Error processing command: {}", e);
                }
            }
            Err(e) => {
                eprintln!("Error reading command: {}", e);
            }
        }
    }

    let wallets = replayer.marketplace().ledger.wallets().await.into_diagnostic()?;
    let stdout = io::stdout();
    let mut writer = WalletWriter::new(stdout.lock());
    writer.write_wallets(wallets).into_diagnostic()?;

    Ok(())
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<&Path>) -> escrow_ledger::error::Result<Stores> {
    use escrow_ledger::infrastructure::rocksdb::RocksDbStore;

    match db_path {
        Some(path) => Ok(RocksDbStore::open(path)?.stores()),
        None => Ok(Stores::in_memory()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<&Path>) -> escrow_ledger::error::Result<Stores> {
    if let Some(path) = db_path {
        tracing::warn!(
            path = %path.display(),
            "--db-path given but built without the storage-rocksdb feature, falling back to in-memory storage"
        );
    }
    Ok(Stores::in_memory())
}
