//! # EBB - Main Entry Point
//!
//! ## Initialization Sequence
//!
//! 1. **Tracing** - text or JSON logs, filtered by `RUST_LOG`
//! 2. **Configuration** - optional TOML file, then CLI flags, then validation
//! 3. **Clients** - the queue client (AWS SDK or plain HTTP) and the
//!    Kubernetes client
//! 4. **Bridge** - queue poller and controller, run until shutdown
//!
//! ## Error Handling
//!
//! Any failure before the bridge starts halts startup with exit code 1 and
//! no task spawned.
//!
//! ## Shutdown
//!
//! SIGTERM/SIGINT stop the poller and the event router, the work queue
//! drains, and every task is joined within 30s.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use ebb::{Bridge, Cli, KubeCluster, init_tracing};
use ebb_core::{ShutdownCoordinator, install_signal_handlers};
use ebb_queue::{HttpQueueClient, QueueClient, QueueClientKind, QueueConfig, SqsQueueClient};
use tracing::info;

/// Build the queue client the configuration asks for.
async fn connect_queue(config: &QueueConfig) -> Result<Arc<dyn QueueClient>> {
    Ok(match config.client {
        QueueClientKind::Aws => {
            let client = SqsQueueClient::from_config(config).await?;
            info!(queue_url = %client.queue_url(), "Using signed AWS SDK queue client");
            Arc::new(client)
        }
        QueueClientKind::Http => {
            let client = HttpQueueClient::from_config(config)?;
            info!(queue_url = %client.queue_url(), "Using unsigned HTTP queue client");
            Arc::new(client)
        }
    })
}

/// Main entry point for EBB.
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    init_tracing(cli.log_format)?;

    info!(version = env!("CARGO_PKG_VERSION"), "EBB starting...");

    let config = cli
        .resolve_config()
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let queue_client = connect_queue(&config.queue)
        .await
        .context("Failed to create queue client")?;
    let cluster = KubeCluster::try_default().await?;

    info!(
        startup_ms = start_time.elapsed().as_millis(),
        "EBB initialized"
    );

    let bridge = Bridge::new(config, queue_client, Arc::new(cluster))?;

    let coordinator = Arc::new(ShutdownCoordinator::new());
    let signals = install_signal_handlers(Arc::clone(&coordinator));

    let result = bridge.run(Arc::clone(&coordinator)).await;
    signals.abort();

    let stats = result?;
    info!(
        phase = ?coordinator.phase().await,
        succeeded = stats.succeeded,
        requeued = stats.requeued,
        failed = stats.failed,
        uptime_secs = start_time.elapsed().as_secs(),
        "EBB stopped"
    );
    Ok(())
}
