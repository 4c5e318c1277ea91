use std::sync::Arc;

use anyhow::Context;

use cadence_infra::WorkerConfig;
use cadence_worker::{Backends, LoggingMailer, Worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cadence_observability::init();

    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    let backends = Backends::connect(&config).await?;
    let worker = Worker::build(&config, backends, Arc::new(LoggingMailer))?;

    let running = worker.start();
    tracing::info!("worker running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested");
    if !running.shutdown().await {
        tracing::warn!("exiting before in-flight work finished");
    }
    Ok(())
}
