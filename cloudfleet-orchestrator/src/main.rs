use anyhow::Context;
use cloudfleet_orchestrator::settings::{EngineSettings, FleetConfig};
use cloudfleet_orchestrator::{reconcile_job, retention_job, routes, EngineContext};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = EngineSettings::from_env()?;
    let config = FleetConfig::from_env()?;
    let addr = settings.admin_addr.clone();
    let engine = Arc::new(EngineContext::from_config(settings, &config).context("loading fleet configuration")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile = tokio::spawn(reconcile_job::run(engine.clone(), shutdown_rx.clone()));
    let retention = tokio::spawn(retention_job::run(engine.clone(), shutdown_rx));

    let app = routes::router(engine);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!("🚀 cloudfleet orchestrator listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(reconcile, retention);
    Ok(())
}
