//! Treasury API server
//!
//! Loads configuration, opens the store, wires the engine components, spawns
//! the background loops, and serves the HTTP surface until ctrl-c.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use treasury_api::{create_router, AppState};
use treasury_engine::{
    ChainClient, CoinLockManager, EsploraChain, PayjoinNegotiationEngine, SigningRequestLedger,
    TransactionBroadcaster, TreasuryRebalancer, WalletBook,
};
use treasury_storage::TreasuryStore;
use treasury_types::TreasuryConfig;

#[derive(Debug, Parser)]
#[command(name = "treasury-server", about = "Custodial Bitcoin treasury backend")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, short, default_value = "treasury.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();

    info!("Starting treasury server");

    // Configuration problems are fatal; the process refuses to start.
    let config = TreasuryConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;

    let store = Arc::new(TreasuryStore::open(&config.store_path)?);
    info!("Store opened at {}", config.store_path);

    let wallets = Arc::new(WalletBook::from_config(&config)?);
    info!(
        "Configured {} wallets ({} hot) on {}",
        wallets.enabled().len(),
        wallets.hot().len(),
        config.network
    );

    let chain: Arc<dyn ChainClient> =
        Arc::new(EsploraChain::new(&config.esplora_url, Arc::clone(&wallets)));
    info!("Using Esplora indexer at {}", config.esplora_url);

    let locks = CoinLockManager::new(Arc::clone(&store));
    let ledger = Arc::new(SigningRequestLedger::new(
        Arc::clone(&store),
        Arc::clone(&chain),
    ));
    let broadcaster = Arc::new(TransactionBroadcaster::new(
        Arc::clone(&store),
        Arc::clone(&chain),
    ));
    let payjoin = Arc::new(PayjoinNegotiationEngine::new(
        Arc::clone(&store),
        Arc::clone(&chain),
        Arc::clone(&wallets),
        locks.clone(),
        Arc::clone(&ledger),
        Arc::clone(&broadcaster),
        config.payjoin.clone(),
    ));
    let rebalancer = Arc::new(TreasuryRebalancer::new(
        Arc::clone(&store),
        Arc::clone(&chain),
        Arc::clone(&wallets),
        locks.clone(),
        Arc::clone(&ledger),
        config.rebalance.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = vec![
        locks.spawn_sweeper(shutdown_rx.clone()),
        Arc::clone(&broadcaster).spawn(shutdown_rx.clone()),
        rebalancer.spawn(shutdown_rx.clone()),
    ];

    let state = AppState::new(payjoin, ledger);
    let app = create_router(state);

    let addr: SocketAddr = config.listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    info!("Shutting down background loops");
    shutdown_tx.send(true).ok();
    for handle in handles {
        handle.await.ok();
    }

    info!("Treasury server stopped");
    Ok(())
}
