use anyhow::Result;
use tracing::info;
use fedround_core::{clear_ready, init_metrics, init_tracing, load_config, mark_ready, set_config_version, shutdown_tracing, start_health_server};
use coordinator_service::FederationModule;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("coordinator")?;
    init_metrics()?;
    let cfg = load_config("coordinator").await?;
    cfg.validate()?;
    info!(?cfg, "config_loaded");
    if let Some(v) = &cfg.config_version { set_config_version(v.clone()); }
    start_health_server(cfg.health_port).await?;

    let federation = FederationModule::new(cfg).await?;
    mark_ready();
    let history = federation.run().await;
    clear_ready();
    let history = history?;
    federation.persist(&history)?;
    info!(rounds = history.len(), "coordinator_finished");
    federation.shutdown().await?;
    shutdown_tracing();
    Ok(())
}
