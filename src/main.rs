//! Token Bridge Federator - relays bridge transfers between two chains
//!
//! The federator watches each chain's bridge for `Cross` events and, once an
//! event is deep enough, submits the matching `acceptTransfer` on the other
//! chain. Both directions run from one process on a fixed schedule.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod metrics;
mod notify;
mod state;
mod tx;

use chain::{ChainProvider, ChainWatcher};
use config::{FederatorConfig, Settings};
use coordination::{Federator, Scheduler};
use metrics::MetricsServer;
use notify::{Alert, Notifier};
use state::CheckpointStore;
use tx::RelayExecutor;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Token Bridge Federator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let forward = settings.forward()?;
    let reverse = settings.reverse()?;
    info!(
        "Loaded configuration for {} <-> {}",
        settings.mainchain.name, settings.sidechain.name
    );

    let rpc_timeout = forward.rpc_timeout;
    let mainchain = Arc::new(ChainProvider::new(&settings.mainchain, rpc_timeout)?);
    let sidechain = Arc::new(ChainProvider::new(&settings.sidechain, rpc_timeout)?);

    // Checkpoint backend
    let checkpoints = state::open(&settings.checkpoint).await?;
    info!("Checkpoint store ready");

    let notifier = notify::from_config(settings.telegram.as_ref(), &settings.federator.instance_id)?;

    let federators = vec![
        build_federator(
            &forward,
            mainchain.clone(),
            sidechain.clone(),
            checkpoints.clone(),
            notifier.clone(),
        )?,
        build_federator(
            &reverse,
            sidechain.clone(),
            mainchain.clone(),
            checkpoints.clone(),
            notifier.clone(),
        )?,
    ];

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(
            settings.metrics.port,
            vec![mainchain.clone(), sidechain.clone()],
        );
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    notifier
        .notify(&Alert::Started {
            directions: federators.iter().map(|f| f.direction().to_string()).collect(),
        })
        .await;

    // Start scheduler
    let scheduler = Arc::new(Scheduler::new(federators, settings.polling_interval()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.start(shutdown_rx));

    info!("Token Bridge Federator is running");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown: no new cycle starts, the running one completes
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_handle.await {
        error!("Scheduler task failed: {}", e);
    }

    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Token Bridge Federator stopped");
    Ok(())
}

/// Wire one direction: watcher on the source, executor on the destination
fn build_federator(
    config: &FederatorConfig,
    source: Arc<ChainProvider>,
    destination: Arc<ChainProvider>,
    checkpoints: Arc<dyn CheckpointStore>,
    notifier: Arc<dyn Notifier>,
) -> Result<Arc<Federator>> {
    let watcher = ChainWatcher::new(&config.source, source, config.block_page_size)?;
    let executor = RelayExecutor::new(config, destination)?;
    let federator = Federator::new(
        config,
        Arc::new(watcher),
        Arc::new(executor),
        checkpoints,
        notifier,
    )?;

    info!("Federator {} initialized", federator.direction());
    Ok(Arc::new(federator))
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,token_bridge_federator=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
