use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::orchestrator::{SyncOptions, SyncOrchestrator};

/// Cron-driven `run_all`, or `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<SyncOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = &config.sync_cron;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            info!("scheduled sync triggered");
            for (kind, result) in orchestrator.run_all(SyncOptions::default()).await {
                match result {
                    Ok(run) => info!(
                        %kind,
                        state = run.state.as_str(),
                        upserted = run.records_upserted,
                        errors = run.errors_total,
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(%kind, error = %err, "scheduled sync did not run"),
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use casesync_remote::StaticSource;
    use casesync_storage::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn disabled_scheduler_is_not_built() {
        let config = SyncConfig::from_lookup(|_| None);
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::new(StaticSource::new()),
            Arc::new(MemoryStore::new()),
        ));
        assert!(maybe_build_scheduler(&config, orchestrator).await.unwrap().is_none());
    }
}
