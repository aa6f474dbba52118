//! Per-kind sync pipeline: `Idle -> Fetching -> Coercing -> (Evolving) -> Merging -> Idle`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use casesync_core::{
    EntityKind, ErrorClass, RecordError, RemoteEntity, RemoteRow, SqlValue, SyncRun, SyncState,
};
use casesync_remote::{Cursor, FetchError, PageRequest, RecordSource};
use casesync_storage::{StoreError, SyncStore};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use crate::catalog::{CatalogError, FieldCatalog};
use crate::coerce::{CoercionEngine, TypedValue};
use crate::merge::MergeEngine;
use crate::planner::{execute_plan, MigrationPlan, SchemaPlanner};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a {0} sync is already running")]
    AlreadyRunning(EntityKind),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    fn class(&self) -> ErrorClass {
        match self {
            SyncError::Fetch(_) => ErrorClass::Fetch,
            SyncError::Catalog(_) | SyncError::AlreadyRunning(_) => ErrorClass::Catalog,
            SyncError::Store(_) => ErrorClass::Merge,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Ignore the previous run and fetch the whole collection.
    pub full: bool,
}

/// Where a run starts and which pass it continues.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResumePoint {
    pub cursor: Option<Cursor>,
    pub updated_since: Option<DateTime<Utc>>,
    /// Start of the unfinished pass being continued; `None` starts a fresh pass.
    pub watermark: Option<DateTime<Utc>>,
}

/// The previous run's unfinished cursor, else an `updated_since` filter at the start of the
/// last exhausted pass. Runs that never finished (crashed, failed or cancelled) are continued
/// with their own filter so nothing they skipped is lost.
pub fn resume_point(previous: Option<&SyncRun>, full: bool) -> ResumePoint {
    let Some(previous) = previous.filter(|_| !full) else {
        return ResumePoint::default();
    };
    if previous.exhausted() {
        return ResumePoint {
            cursor: None,
            updated_since: Some(previous.chain_start()),
            watermark: None,
        };
    }
    ResumePoint {
        cursor: previous.resume_cursor.as_deref().and_then(Cursor::decode),
        updated_since: previous.updated_since,
        watermark: Some(previous.chain_start()),
    }
}

fn base_row(kind: EntityKind, entity: &RemoteEntity) -> RemoteRow {
    let client = entity.client.as_ref();
    let values = BTreeMap::from([
        ("name".to_string(), SqlValue::text(entity.name.as_deref())),
        ("status".to_string(), SqlValue::text(entity.status.as_deref())),
        (
            "client_ref_id".to_string(),
            SqlValue::text(client.map(|c| c.id.as_str())),
        ),
        (
            "client_ref_name".to_string(),
            SqlValue::text(client.and_then(|c| c.name.as_deref())),
        ),
        (
            "remote_created_at".to_string(),
            SqlValue::timestamp(entity.created_at),
        ),
        (
            "remote_updated_at".to_string(),
            SqlValue::timestamp(entity.updated_at),
        ),
    ]);
    RemoteRow {
        kind,
        remote_id: entity.remote_id.clone(),
        values,
    }
}

struct RunGuard<'a> {
    running: &'a Mutex<HashSet<EntityKind>>,
    kind: EntityKind,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.kind);
    }
}

pub struct SyncOrchestrator {
    source: Arc<dyn RecordSource>,
    store: Arc<dyn SyncStore>,
    coercion: CoercionEngine,
    planner: SchemaPlanner,
    merge: MergeEngine,
    cancel: watch::Receiver<bool>,
    running: Mutex<HashSet<EntityKind>>,
}

impl SyncOrchestrator {
    pub fn new(source: Arc<dyn RecordSource>, store: Arc<dyn SyncStore>) -> Self {
        let (_never_cancelled, cancel) = watch::channel(false);
        Self {
            source,
            store,
            coercion: CoercionEngine::default(),
            planner: SchemaPlanner::default(),
            merge: MergeEngine,
            cancel,
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_coercion(mut self, coercion: CoercionEngine) -> Self {
        self.coercion = coercion;
        self
    }

    pub fn with_planner(mut self, planner: SchemaPlanner) -> Self {
        self.planner = planner;
        self
    }

    /// Runs stop between pages once `cancel` reads `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> Arc<dyn SyncStore> {
        Arc::clone(&self.store)
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn claim(&self, kind: EntityKind) -> Result<RunGuard<'_>, SyncError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(kind) {
            return Err(SyncError::AlreadyRunning(kind));
        }
        Ok(RunGuard {
            running: &self.running,
            kind,
        })
    }

    /// Syncs every kind concurrently as independent pipelines.
    pub async fn run_all(&self, options: SyncOptions) -> Vec<(EntityKind, Result<SyncRun, SyncError>)> {
        let [matters, contacts, tasks] = EntityKind::ALL;
        let (m, c, t) = tokio::join!(
            self.run(matters, options),
            self.run(contacts, options),
            self.run(tasks, options),
        );
        vec![(matters, m), (contacts, c), (tasks, t)]
    }

    /// One pass over `kind`. Fatal problems come back as a `Failed` run; `Err` means the run
    /// could not start or its audit record could not be written.
    pub async fn run(&self, kind: EntityKind, options: SyncOptions) -> Result<SyncRun, SyncError> {
        let _guard = self.claim(kind)?;
        let run = SyncRun::start(kind, Utc::now());
        let span = info_span!("sync_run", kind = %kind, run_id = %run.id);
        self.drive(run, options).instrument(span).await
    }

    async fn drive(&self, mut run: SyncRun, options: SyncOptions) -> Result<SyncRun, SyncError> {
        let kind = run.kind;
        let previous = self.store.latest_run(kind).await?;
        let ResumePoint {
            mut cursor,
            updated_since,
            watermark,
        } = resume_point(previous.as_ref(), options.full);
        run.updated_since = updated_since;
        run.watermark = watermark;
        info!(
            resume = ?cursor,
            watermark = ?watermark,
            updated_since = ?updated_since,
            full = options.full,
            "sync started"
        );
        self.store.save_run(&run).await?;

        let mut catalog = match FieldCatalog::bootstrap(self.store.as_ref()).await {
            Ok(catalog) => catalog,
            Err(err) => return self.abort(run, err.into(), cursor).await,
        };

        loop {
            if self.cancelled() {
                run.cancelled = true;
                run.resume_cursor = Some(cursor.clone().unwrap_or(Cursor::Page(1)).encode());
                info!(resume = run.resume_cursor.as_deref(), "sync cancelled between pages");
                break;
            }

            run.state = SyncState::Fetching;
            let request = PageRequest {
                kind,
                cursor: cursor.clone(),
                updated_since,
            };
            let page = match self.source.fetch_page(&request).await {
                Ok(page) => page,
                Err(err) => return self.abort(run, err.into(), cursor).await,
            };

            if let Err(err) = self.process_page(&mut run, &mut catalog, page.records).await {
                return self.abort(run, err, cursor).await;
            }
            run.pages_processed += 1;
            cursor = page.next_cursor;
            run.resume_cursor = cursor.as_ref().map(Cursor::encode);
            self.store.save_run(&run).await?;

            if cursor.is_none() {
                break;
            }
        }

        run.complete(Utc::now());
        self.store.save_run(&run).await?;
        info!(
            pages = run.pages_processed,
            seen = run.records_seen,
            upserted = run.records_upserted,
            unchanged = run.records_unchanged,
            new_fields = run.new_fields_discovered,
            columns_materialized = run.columns_materialized,
            errors = run.errors_total,
            "sync finished"
        );
        Ok(run)
    }

    async fn abort(
        &self,
        mut run: SyncRun,
        err: SyncError,
        cursor: Option<Cursor>,
    ) -> Result<SyncRun, SyncError> {
        error!(error = %err, "sync failed");
        run.record_error(RecordError::new(err.class(), err.to_string()));
        run.resume_cursor = cursor.map(|c| c.encode());
        run.fail(err.to_string(), Utc::now());
        self.store.save_run(&run).await?;
        Ok(run)
    }

    async fn process_page(
        &self,
        run: &mut SyncRun,
        catalog: &mut FieldCatalog,
        records: Vec<RemoteEntity>,
    ) -> Result<(), SyncError> {
        let kind = run.kind;
        let now = Utc::now();
        let store = self.store.as_ref();

        run.state = SyncState::Coercing;
        run.records_seen += records.len() as u64;
        let mut rows = Vec::with_capacity(records.len());
        let mut observed = BTreeSet::new();

        for entity in &records {
            let mut row = base_row(kind, entity);
            for field in &entity.custom_fields {
                let resolution = match catalog
                    .resolve(store, &field.label, field.declared_type, now)
                    .await
                {
                    Ok(resolution) => resolution,
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        run.record_error(
                            RecordError::new(ErrorClass::Catalog, err.to_string())
                                .for_record(&entity.remote_id)
                                .for_field(&field.label),
                        );
                        continue;
                    }
                };
                if resolution.created {
                    run.new_fields_discovered += 1;
                }
                if resolution.type_conflict {
                    run.type_conflicts += 1;
                }
                catalog.record_usage(&field.label, field.has_payload(), now);
                observed.insert(field.label.clone());

                let entry = resolution.entry;
                let typed = match self.coercion.coerce(
                    &field.label,
                    field.raw_value.as_ref(),
                    entry.declared_type,
                ) {
                    Ok(typed) => typed,
                    Err(err) => {
                        warn!(
                            remote_id = %entity.remote_id,
                            label = %field.label,
                            error = %err,
                            "coercion failed; storing NULL"
                        );
                        run.record_error(
                            RecordError::new(ErrorClass::Coercion, err.to_string())
                                .for_record(&entity.remote_id)
                                .for_field(&field.label)
                                .for_column(&entry.local_column),
                        );
                        TypedValue::Null
                    }
                };
                row.values.extend(typed.into_columns(&entry));
            }
            rows.push(row);
        }
        catalog.flush(store).await?;

        let mut live = store.live_columns(kind).await?;
        let plan = self
            .planner
            .plan(kind, observed.iter().filter_map(|label| catalog.get(label)), &live);
        if !plan.is_empty() {
            run.state = SyncState::Evolving;
            let outcome = execute_plan(store, &plan).await;
            run.columns_materialized += outcome.columns_added() as u32;
            for failed in outcome.failed {
                run.record_error(
                    RecordError::new(ErrorClass::MigrationStatement, failed.message)
                        .for_field(failed.label)
                        .for_column(failed.statement.column()),
                );
            }
            live = store.live_columns(kind).await?;
        }

        run.state = SyncState::Merging;
        for mut row in rows {
            row.values.retain(|column, _| live.contains(column));
            match self.merge.apply(store, &row, now).await {
                Ok(outcome) if outcome.changed => run.records_upserted += 1,
                Ok(_) => run.records_unchanged += 1,
                Err(err) => {
                    warn!(remote_id = %row.remote_id, error = %err, "merge failed; record skipped");
                    run.record_error(
                        RecordError::new(ErrorClass::Merge, err.to_string()).for_record(&row.remote_id),
                    );
                }
            }
        }
        Ok(())
    }

    /// Statements the next run would apply if every cataloged field were observed for `kind`.
    pub async fn preview_plan(&self, kind: EntityKind) -> Result<MigrationPlan, SyncError> {
        let catalog = FieldCatalog::bootstrap(self.store.as_ref()).await?;
        let live = self.store.live_columns(kind).await?;
        Ok(self.planner.plan(kind, catalog.entries(), &live))
    }
}
