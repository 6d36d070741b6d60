//! ckbridge Relayer - settles deposits and withdrawals between Chain A and Chain B
//!
//! Accepts bridge requests over HTTP and runs reconciliation workers that lock,
//! confirm and release funds on the two ledgers.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use ckbridge_relayer::api;
use ckbridge_relayer::config::{ChainAConfig, ChainBConfig, Settings, StoreConfig};
use ckbridge_relayer::ledger::{CanisterLedger, EvmLedger, LedgerAdapter, LedgerSet, MemoryLedger};
use ckbridge_relayer::metrics::MetricsServer;
use ckbridge_relayer::request::Chain;
use ckbridge_relayer::store::{MemoryStore, PgStore, RequestStore};
use ckbridge_relayer::{BridgeCoordinator, ReconciliationEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting ckbridge Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} worker(s), max {} attempts",
        settings.bridge.workers, settings.bridge.max_attempts
    );

    // Initialize request store
    let store: Arc<dyn RequestStore> = match &settings.store {
        StoreConfig::Postgres(database) => {
            let store = PgStore::new(database).await?;
            info!("Database connection established");

            store.run_migrations().await?;
            Arc::new(store)
        }
        StoreConfig::Memory => {
            warn!("Using in-memory request store - requests are lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Initialize ledger adapters
    let depth = settings.bridge.confirmation_depth;
    let mut simulated: Vec<(Arc<MemoryLedger>, Duration)> = Vec::new();

    let chain_a: Arc<dyn LedgerAdapter> = match &settings.chain_a {
        ChainAConfig::Evm(evm) => Arc::new(EvmLedger::new(evm, depth.chain_a)?),
        ChainAConfig::Simulated(sim) => {
            let ledger = Arc::new(MemoryLedger::new(Chain::A, depth.chain_a).with_faucet());
            simulated.push((ledger.clone(), Duration::from_millis(sim.block_interval_ms)));
            ledger
        }
    };
    let chain_b: Arc<dyn LedgerAdapter> = match &settings.chain_b {
        ChainBConfig::Canister(canister) => Arc::new(CanisterLedger::new(canister, depth.chain_b)?),
        ChainBConfig::Simulated(sim) => {
            let ledger = Arc::new(MemoryLedger::new(Chain::B, depth.chain_b).with_faucet());
            simulated.push((ledger.clone(), Duration::from_millis(sim.block_interval_ms)));
            ledger
        }
    };
    let ledgers = LedgerSet::new(chain_a, chain_b);
    info!("Ledger adapters initialized");

    let coordinator = Arc::new(BridgeCoordinator::new(
        store.clone(),
        settings.pricing,
        settings.bridge.max_attempts,
    ));

    // Initialize reconciliation workers
    let engines: Vec<Arc<ReconciliationEngine>> = (0..settings.bridge.workers)
        .map(|_| {
            Arc::new(ReconciliationEngine::new(
                store.clone(),
                ledgers.clone(),
                settings.pricing,
                settings.bridge.clone(),
            ))
        })
        .collect();

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let coordinator = coordinator.clone();
        let ledgers = ledgers.clone();
        async move {
            if let Err(e) = api::run_server(config, coordinator, ledgers).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start block production for simulated chains
    let block_handles: Vec<JoinHandle<()>> = simulated
        .iter()
        .map(|(ledger, interval)| tokio::spawn(ledger.clone().produce_blocks(*interval)))
        .collect();

    // Start reconciliation workers
    let engine_handles: Vec<JoinHandle<()>> = engines
        .iter()
        .enumerate()
        .map(|(worker, engine)| {
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.run().await {
                    error!("Reconciliation worker {} error: {}", worker, e);
                }
            })
        })
        .collect();

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(30)).await;
                if let Err(e) = store.health_check().await {
                    warn!("Store health check failed: {}", e);
                }
            }
        }
    });

    info!("ckbridge Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: let workers finish their current pass
    for engine in &engines {
        engine.stop().await;
    }
    for (ledger, _) in &simulated {
        ledger.stop().await;
    }
    let drained = tokio::time::timeout(
        settings.bridge.poll_interval() * 2 + Duration::from_secs(5),
        futures::future::join_all(engine_handles),
    )
    .await;
    if drained.is_err() {
        warn!("Reconciliation workers did not stop in time");
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    for handle in block_handles {
        handle.abort();
    }
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("ckbridge Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,ckbridge_relayer=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
