use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use balanceblox::balance_store::{BalanceStore, MemoryBalanceStore};
use balanceblox::config::{init_global_settings, Settings, StoreBackend, DEFAULT_CONFIG_FILE};
use balanceblox::leveldb_store::LevelDbBalanceStore;
use balanceblox::ledger_writer::LedgerWriter;
use balanceblox::metrics;
use balanceblox::rocksdb_store::RocksDbBalanceStore;
use balanceblox::rpc::{RpcBlockSource, RpcClient, RpcUtxoProvider};
use balanceblox::sync::Indexer;
use balanceblox::telemetry::init_tracing;
use balanceblox::utxo::UtxoResolver;
use balanceblox::utxo_cache::CachedUtxoProvider;
use balanceblox::AddressExtractor;

#[derive(Parser, Debug)]
#[clap(name = "balanceblox")]
#[clap(about = "Per-address balance ledger built from confirmed blocks", long_about = None)]
struct Args {
    /// Configuration file; BALANCEBLOX_* environment variables override it
    #[clap(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Index blocks until interrupted
    Sync {
        /// Stop after applying this height
        #[clap(long)]
        until: Option<u32>,
    },
    /// Print the stored balance of an address
    Balance {
        address: String,
    },
}

fn open_store(settings: &Settings) -> Result<Arc<dyn BalanceStore>, Box<dyn std::error::Error>> {
    let data_dir = settings.data_dir();
    let store: Arc<dyn BalanceStore> = match settings.store.backend {
        StoreBackend::Rocksdb => Arc::new(RocksDbBalanceStore::open(&data_dir)?),
        StoreBackend::Leveldb => Arc::new(LevelDbBalanceStore::open(&data_dir)?),
        StoreBackend::Memory => {
            warn!("Using the in-memory store; balances are lost on exit");
            Arc::new(MemoryBalanceStore::new())
        }
    };
    Ok(store)
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown requested, finishing current block");
    token.cancel();
}

async fn run_sync(settings: &Settings, until: Option<u32>) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    metrics::init_metrics()?;
    if let Some(addr) = settings.metrics_addr() {
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr, token).await {
                error!(error = %e, "Metrics endpoint failed");
            }
        });
    }

    let client = Arc::new(RpcClient::new(
        settings.rpc.host.clone(),
        settings.rpc.user.clone(),
        settings.rpc.pass.clone(),
        settings.rpc_timeout(),
    )?);
    let source = Arc::new(RpcBlockSource::new(client.clone()));
    let cache = Arc::new(CachedUtxoProvider::new(
        Arc::new(RpcUtxoProvider::new(client)),
        settings.indexer.utxo_cache_size,
    ));

    let store = open_store(settings)?;
    let writer = LedgerWriter::new(store, settings.indexer.batch_width, settings.batch_timeout())?;
    let resolver = UtxoResolver::new(cache.clone(), settings.retry_policy());
    let extractor = AddressExtractor::new(settings.network());

    let indexer = Indexer::new(source, resolver, extractor, writer, settings.sync_options(until))
        .with_cache(cache);

    let result = indexer.run(shutdown.clone()).await;
    shutdown.cancel();

    match result {
        Ok(summary) => {
            info!(
                blocks_applied = summary.blocks_applied,
                last_height = ?summary.last_height,
                "Indexer stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(kind = e.kind(), error = %e, "Indexer halted");
            Err(e.into())
        }
    }
}

async fn show_balance(settings: &Settings, address: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(settings)?;
    let tip = store.tip().await?;
    match store.get(address).await? {
        Some(record) => println!(
            "{} {} (last changed at height {})",
            record.address, record.value, record.height
        ),
        None => println!("{} 0 (never seen)", address),
    }
    if let Some(tip) = tip {
        println!("ledger tip: {} {}", tip.height, tip.hash);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let settings = init_global_settings(Settings::load(&args.config)?)?;
    let _log_guard = init_tracing(settings.telemetry())?;

    info!(
        config = %args.config.display(),
        network = %settings.network,
        backend = ?settings.store.backend,
        "balanceblox starting"
    );

    match args.command {
        Command::Sync { until } => run_sync(settings, until).await,
        Command::Balance { address } => show_balance(settings, &address).await,
    }
}
