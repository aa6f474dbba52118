//! Axum JSON API for triggering syncs and inspecting the catalog and run history.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use casesync_core::{EntityKind, SyncRun};
use casesync_storage::{CatalogStore, RunStore};
use casesync_sync::{
    connect_store, maybe_build_scheduler, orchestrator_for, remote_source, SyncConfig, SyncError,
    SyncOptions, SyncOrchestrator,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "casesync-web";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    #[serde(default)]
    full: bool,
}

impl From<SyncQuery> for SyncOptions {
    fn from(query: SyncQuery) -> Self {
        SyncOptions { full: query.full }
    }
}

#[derive(Debug, Serialize)]
struct KindResult {
    kind: EntityKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<SyncRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct PlanView {
    kind: EntityKind,
    statements: Vec<PlanStatementView>,
}

#[derive(Debug, Serialize)]
struct PlanStatementView {
    label: String,
    sql: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sync", post(sync_all_handler))
        .route("/sync/{kind}", post(sync_kind_handler))
        .route("/runs/{kind}/latest", get(latest_run_handler))
        .route("/catalog", get(catalog_handler))
        .route("/plan/{kind}", get(plan_handler))
        .with_state(Arc::new(state))
}

/// Connects to Postgres, applies the base migrations, starts the cron job when enabled and
/// serves until ctrl-c.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("CASESYNC_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();
    let store = connect_store(&config).await?;
    store.migrate().await.context("applying base migrations")?;
    let orchestrator = Arc::new(orchestrator_for(&config, remote_source(&config)?, store)?);

    let scheduler = maybe_build_scheduler(&config, Arc::clone(&orchestrator)).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "casesync api listening");
    axum::serve(listener, app(AppState::new(orchestrator)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler did not shut down cleanly");
        }
    }
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn sync_all_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Response {
    let results = state.orchestrator.run_all(query.into()).await;
    let body: Vec<KindResult> = results
        .into_iter()
        .map(|(kind, result)| match result {
            Ok(run) => KindResult {
                kind,
                run: Some(run),
                error: None,
            },
            Err(err) => KindResult {
                kind,
                run: None,
                error: Some(err.to_string()),
            },
        })
        .collect();
    Json(body).into_response()
}

async fn sync_kind_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Query(query): Query<SyncQuery>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.orchestrator.run(kind, query.into()).await {
        Ok(run) => Json(run).into_response(),
        Err(err @ SyncError::AlreadyRunning(_)) => {
            (StatusCode::CONFLICT, Json(json!({ "error": err.to_string() }))).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn latest_run_handler(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.orchestrator.store().latest_run(kind).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no {kind} runs recorded") })),
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn catalog_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.store().load_catalog().await {
        Ok(mut entries) => {
            entries.sort_by(|a, b| a.label.cmp(&b.label));
            Json(entries).into_response()
        }
        Err(err) => server_error(err.into()),
    }
}

async fn plan_handler(State(state): State<Arc<AppState>>, Path(kind): Path<String>) -> Response {
    let kind = match parse_kind(&kind) {
        Ok(kind) => kind,
        Err(resp) => return resp,
    };
    match state.orchestrator.preview_plan(kind).await {
        Ok(plan) => Json(PlanView {
            kind,
            statements: plan
                .statements
                .iter()
                .map(|p| PlanStatementView {
                    label: p.label.clone(),
                    sql: p.statement.to_sql(),
                })
                .collect(),
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

fn parse_kind(raw: &str) -> Result<EntityKind, Response> {
    EntityKind::from_str(raw).map_err(|err| {
        (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response()
    })
}

fn server_error(err: anyhow::Error) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use casesync_core::{CustomFieldValue, DeclaredType, RawValue, RemoteEntity};
    use casesync_remote::{FetchError, PageRequest, RecordSource, RemotePage, StaticSource};
    use casesync_storage::MemoryStore;
    use http_body_util::BodyExt;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn matter_source() -> StaticSource {
        StaticSource::new().with_page(
            EntityKind::Matters,
            vec![RemoteEntity::new(EntityKind::Matters, "m-1").with_field(CustomFieldValue::new(
                "Rel Value",
                DeclaredType::Currency,
                RawValue::Text("$212,000".into()),
            ))],
        )
    }

    fn test_app(source: impl RecordSource + 'static) -> Router {
        let orchestrator = SyncOrchestrator::new(Arc::new(source), Arc::new(MemoryStore::new()));
        app(AppState::new(Arc::new(orchestrator)))
    }

    fn request(method: &str, uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let resp = test_app(StaticSource::new())
            .oneshot(request("GET", "/healthz"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn handler_smoke_sync_kind_then_inspect() {
        let app = test_app(matter_source());

        let resp = app.clone().oneshot(request("POST", "/sync/matters")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let run = json_body(resp).await;
        assert_eq!(run["state"], "idle");
        assert_eq!(run["records_upserted"], 1);
        assert_eq!(run["columns_materialized"], 1);

        let latest = app
            .clone()
            .oneshot(request("GET", "/runs/matters/latest"))
            .await
            .unwrap();
        assert_eq!(latest.status(), StatusCode::OK);
        assert_eq!(json_body(latest).await["id"], run["id"]);

        let catalog = app.clone().oneshot(request("GET", "/catalog")).await.unwrap();
        let entries = json_body(catalog).await;
        assert_eq!(entries[0]["label"], "Rel Value");
        assert_eq!(entries[0]["local_column"], "rel_value");

        let plan = app.oneshot(request("GET", "/plan/matters")).await.unwrap();
        assert_eq!(plan.status(), StatusCode::OK);
        assert_eq!(json_body(plan).await["statements"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn handler_smoke_sync_all_reports_every_kind() {
        let resp = test_app(matter_source())
            .oneshot(request("POST", "/sync?full=true"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        let kinds: Vec<_> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["kind"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, vec!["matters", "contacts", "tasks"]);
        assert_eq!(body[0]["run"]["records_seen"], 1);
    }

    #[tokio::test]
    async fn handler_smoke_unknown_kind_is_bad_request() {
        let resp = test_app(StaticSource::new())
            .oneshot(request("POST", "/sync/invoices"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn handler_smoke_missing_run_is_not_found() {
        let resp = test_app(StaticSource::new())
            .oneshot(request("GET", "/runs/tasks/latest"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    struct GatedSource {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl RecordSource for GatedSource {
        async fn fetch_page(&self, _request: &PageRequest) -> Result<RemotePage, FetchError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(RemotePage {
                records: Vec::new(),
                next_cursor: None,
                total: None,
            })
        }
    }

    #[tokio::test]
    async fn handler_smoke_overlapping_sync_conflicts() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let app = test_app(GatedSource {
            started: Arc::clone(&started),
            release: Arc::clone(&release),
        });

        let first = tokio::spawn(app.clone().oneshot(request("POST", "/sync/contacts")));
        started.notified().await;

        let second = app.oneshot(request("POST", "/sync/contacts")).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status(), StatusCode::OK);
    }
}
