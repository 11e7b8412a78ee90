use std::sync::Arc;

use anyhow::Context;

use conductor_engine::Services;
use conductor_infra::OrchestratorConfig;
use conductor_worker::HttpGenerator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conductor_observability::init();

    let config = OrchestratorConfig::load().context("loading configuration")?;
    let backends = conductor_worker::backends(&config).await?;
    let services = Services::build(&config, backends, Arc::new(HttpGenerator::new()))
        .context("building services")?;

    tracing::info!(
        providers = services.registry.len(),
        queues = config.queues.len(),
        "conductor worker starting"
    );
    let handle = Arc::new(services.runner).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = handle.shutdown().await;
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        retried = stats.jobs_retried,
        "conductor worker stopped"
    );
    Ok(())
}
