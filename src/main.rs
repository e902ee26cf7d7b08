//! tx-delivery daemon
//!
//! Accepts requests over HTTP, orders them by their declared dependencies and
//! delivers them to an EVM node, replacing stalled transactions until they
//! are confirmed.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use tx_delivery::api::{self, AppState};
use tx_delivery::chain::{ChainProvider, NodeClient};
use tx_delivery::config::{LogFormat, Settings, StorageBackend};
use tx_delivery::coordination::{DeliveryEngine, Sequencer};
use tx_delivery::metrics::MetricsServer;
use tx_delivery::storage::{MemoryStorage, MsgStorage, PostgresStorage};
use tx_delivery::tx::{
    Broadcaster, BroadcasterSettings, ManagerSettings, NonceAllocator, TransactionManager,
    WalletSigner,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(settings.logging.format);

    info!("Starting tx-delivery v{}", env!("CARGO_PKG_VERSION"));
    if settings.wallet.private_key_envs.is_empty() {
        warn!("No signing keys configured - every send will fail");
    }
    info!(
        rpc_urls = settings.node.rpc_urls.len(),
        backend = ?settings.storage.backend,
        "Loaded configuration"
    );

    // Node connection
    let provider = Arc::new(ChainProvider::new(&settings.node)?);
    let chain_id = match settings.node.chain_id {
        Some(chain_id) => chain_id,
        None => provider
            .chain_id()
            .await
            .context("Failed to fetch chain id from node")?,
    };
    info!(chain_id, "Node connection initialized");

    // Storage backend
    let (storage, postgres): (Arc<dyn MsgStorage>, Option<Arc<PostgresStorage>>) =
        match settings.storage.backend {
            StorageBackend::Memory => (Arc::new(MemoryStorage::new()) as Arc<dyn MsgStorage>, None),
            StorageBackend::Postgres => {
                let pg = Arc::new(PostgresStorage::new(&settings.storage).await?);
                pg.run_migrations().await?;
                info!("Database migrations complete");
                (pg.clone() as Arc<dyn MsgStorage>, Some(pg))
            }
        };

    // Transaction pipeline
    let nonces = Arc::new(NonceAllocator::new(provider.clone()));
    let manager = Arc::new(TransactionManager::new(
        provider.clone(),
        storage.clone(),
        nonces,
        ManagerSettings {
            chain_id: Some(chain_id),
            poll_interval: settings.engine.poll_interval(),
            fallback_gas_limit: settings.engine.fallback_gas_limit,
            max_gas_price: settings.engine.max_gas_price(),
        },
    ));

    for var in &settings.wallet.private_key_envs {
        let signer = WalletSigner::from_env(var)?;
        info!(address = ?signer.address(), "Registered signer");
        manager.register_signer(Arc::new(signer)).await;
    }

    let broadcaster = Arc::new(Broadcaster::new(
        manager,
        BroadcasterSettings {
            confirmations: settings.engine.confirmations,
            response_timeout: settings.engine.response_timeout(),
            receipt_timeout: settings.engine.receipt_timeout(),
            max_replacements: settings.engine.max_replacements,
        },
    ));
    let sequencer = Arc::new(Sequencer::new(
        storage.clone(),
        settings.engine.sequencer_buffer,
    ));
    let engine = Arc::new(DeliveryEngine::new(sequencer, broadcaster));
    info!("Delivery engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            engine: engine.clone(),
            storage: storage.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
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

    // Start dispatch loop
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Delivery engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let provider = provider.clone();
        let interval = settings.engine.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                if !provider.health_check().await {
                    warn!("Node health check failed");
                }

                if let Some(pg) = &postgres {
                    if let Err(e) = pg.health_check().await {
                        warn!("Database health check failed: {}", e);
                    }
                }
            }
        }
    });

    info!("tx-delivery is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;

    // Abort background tasks
    api_handle.abort();
    engine_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("tx-delivery stopped");
    Ok(())
}

fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tx_delivery=debug,sqlx=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .init(),
    }
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
            Ok(mut sig) => {
                sig.recv().await;
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
