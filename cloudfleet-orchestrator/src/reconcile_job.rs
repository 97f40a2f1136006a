use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::engine::EngineContext;

/// Orphan sweep loop. Stops between sweeps once `shutdown` flips; a sweep in
/// progress is allowed to finish.
pub async fn run(engine: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    let period = engine.settings.orphan_sweep_interval.max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    tracing::info!("🧹 job-reconcile started (every {}s)", period.as_secs());

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        for (cloud, result) in engine.run_orphan_sweep().await {
            match result {
                Ok(report) if !report.reclaimed.is_empty() => tracing::info!(
                    "🧹 job-reconcile: cloud={} reclaimed {} orphan(s)",
                    cloud,
                    report.reclaimed.len()
                ),
                Ok(_) => {}
                Err(e) => tracing::error!("❌ job-reconcile error: cloud={} {}", cloud, e),
            }
        }
    }
    tracing::info!("🧹 job-reconcile stopped");
}
