//! NoETL Worker binary.
//!
//! Leases jobs from the control plane and executes tool adapters.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use noetl_worker_pool::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,noetl_worker_pool=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    tracing::info!("Starting NoETL Worker");

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        worker = %config.name,
        tags = ?config.capability_tags,
        server_url = %config.server_url,
        "Worker configuration loaded"
    );

    let worker = Worker::new(config);

    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker error");
                return Err(e);
            }
        }
        _ = shutdown => {
            tracing::info!("Shutting down worker");
        }
    }

    tracing::info!("Worker stopped");
    Ok(())
}
