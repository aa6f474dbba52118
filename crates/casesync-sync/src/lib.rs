//! Custom-field normalization and schema evolution for practice-management records.
//!
//! A run per entity kind pulls pages from a [`RecordSource`], resolves every custom-field label
//! through the [`FieldCatalog`], coerces payloads, materializes new columns additively and
//! merges rows without touching local-owned columns.

use std::sync::Arc;

use anyhow::{Context, Result};
use casesync_core::{EntityKind, SyncRun};
use casesync_remote::{RecordSource, RemoteRecordClient};
use casesync_storage::{PgStore, SyncStore};

pub mod catalog;
pub mod coerce;
pub mod config;
pub mod merge;
pub mod orchestrator;
pub mod planner;
pub mod scheduler;

pub use catalog::{CatalogError, FieldCatalog, Resolution};
pub use coerce::{coerce, CoercionEngine, CoercionError, TypedValue};
pub use config::{FieldRules, SyncConfig};
pub use merge::{merge, MergeEngine, MergeError, MergeOutcome};
pub use orchestrator::{resume_point, ResumePoint, SyncError, SyncOptions, SyncOrchestrator};
pub use planner::{execute_plan, MigrationOutcome, MigrationPlan, SchemaPlanner};
pub use scheduler::maybe_build_scheduler;

pub const CRATE_NAME: &str = "casesync-sync";

pub fn remote_source(config: &SyncConfig) -> Result<Arc<dyn RecordSource>> {
    let client = RemoteRecordClient::new(config.remote_client_config(), config.credentials())
        .context("building remote record client")?;
    Ok(Arc::new(client))
}

pub async fn connect_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    Ok(Arc::new(store))
}

/// Orchestrator with the configured field rules and materialization threshold.
pub fn orchestrator_for(
    config: &SyncConfig,
    source: Arc<dyn RecordSource>,
    store: Arc<dyn SyncStore>,
) -> Result<SyncOrchestrator> {
    let rules = FieldRules::load(&config.field_rules_path)?;
    Ok(SyncOrchestrator::new(source, store)
        .with_coercion(CoercionEngine::new(rules))
        .with_planner(SchemaPlanner::new(config.materialize_threshold)))
}

/// Syncs `kind` (or every kind) against the configured remote API and database.
pub async fn run_sync_once_from_env(kind: Option<EntityKind>, options: SyncOptions) -> Result<Vec<SyncRun>> {
    let config = SyncConfig::from_env();
    let store = connect_store(&config).await?;
    let orchestrator = orchestrator_for(&config, remote_source(&config)?, store)?;

    let results = match kind {
        Some(kind) => vec![(kind, orchestrator.run(kind, options).await)],
        None => orchestrator.run_all(options).await,
    };
    results
        .into_iter()
        .map(|(kind, result)| result.with_context(|| format!("syncing {kind}")))
        .collect()
}
