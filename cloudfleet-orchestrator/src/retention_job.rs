use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::engine::EngineContext;

/// Retention loop: spot binding, dead workers, per-worker policies, minimum top-up.
pub async fn run(engine: Arc<EngineContext>, mut shutdown: watch::Receiver<bool>) {
    let period = engine.settings.retention_interval.max(Duration::from_secs(1));
    let mut interval = tokio::time::interval(period);
    tracing::info!("⏳ job-retention started (every {}s)", period.as_secs());

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        for report in engine.run_retention_sweep().await {
            let acted = report.actions.len() + report.removed.len() + report.topped_up.len();
            if acted > 0 {
                tracing::info!(
                    "⏳ job-retention: cloud={} actions={} removed={} topped_up={}",
                    report.cloud,
                    report.actions.len(),
                    report.removed.len(),
                    report.topped_up.len()
                );
            }
            for e in &report.errors {
                tracing::error!("❌ job-retention error: cloud={} {}", report.cloud, e);
            }
        }
    }
    tracing::info!("⏳ job-retention stopped");
}
