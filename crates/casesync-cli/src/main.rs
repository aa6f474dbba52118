use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use casesync_core::{EntityKind, SyncState};
use casesync_remote::{FixtureSource, RecordSource};
use casesync_storage::CatalogStore;
use casesync_sync::{connect_store, orchestrator_for, remote_source, SyncConfig, SyncOptions};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "casesync")]
#[command(about = "Custom-field sync between the practice-management API and Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull remote records and merge them into the local tables.
    Sync {
        /// Only sync this kind (matters, contacts or tasks).
        #[arg(long)]
        kind: Option<EntityKind>,
        /// Ignore the previous run and fetch everything.
        #[arg(long)]
        full: bool,
        /// Read envelope pages from `<DIR>/<kind>/page-N.json` instead of the remote API.
        #[arg(long, value_name = "DIR")]
        fixtures: Option<PathBuf>,
    },
    /// Apply the base schema migrations.
    Migrate,
    /// Show the DDL the next run would apply for a kind.
    Plan {
        #[arg(long)]
        kind: EntityKind,
    },
    /// List the field catalog.
    Catalog,
    /// Run the HTTP API (and the cron scheduler when enabled).
    Serve,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("casesync=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        kind: None,
        full: false,
        fixtures: None,
    }) {
        Commands::Sync {
            kind,
            full,
            fixtures,
        } => return sync(kind, full, fixtures).await,
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            connect_store(&config)
                .await?
                .migrate()
                .await
                .context("applying base migrations")?;
            println!("migrations applied");
        }
        Commands::Plan { kind } => {
            let config = SyncConfig::from_env();
            let store = connect_store(&config).await?;
            let plan = orchestrator_for(&config, remote_source(&config)?, store)?
                .preview_plan(kind)
                .await
                .with_context(|| format!("planning {kind}"))?;
            if plan.is_empty() {
                println!("{kind}: schema is up to date");
            }
            for planned in &plan.statements {
                println!("{};  -- {}", planned.statement.to_sql(), planned.label);
            }
        }
        Commands::Catalog => {
            let config = SyncConfig::from_env();
            let store = connect_store(&config).await?;
            let mut entries = store.load_catalog().await.context("loading field catalog")?;
            entries.sort_by(|a, b| a.label.cmp(&b.label));
            for entry in entries {
                println!(
                    "{:<40} {:<10} {:<40} uses={} last_seen={}",
                    entry.label,
                    entry.declared_type.as_str(),
                    entry.local_column,
                    entry.usage_count,
                    entry.last_seen_at.to_rfc3339()
                );
            }
        }
        Commands::Serve => casesync_web::serve_from_env().await?,
    }

    Ok(ExitCode::SUCCESS)
}

async fn sync(kind: Option<EntityKind>, full: bool, fixtures: Option<PathBuf>) -> Result<ExitCode> {
    let config = SyncConfig::from_env();
    let store = connect_store(&config).await?;
    store.migrate().await.context("applying base migrations")?;

    let source: Arc<dyn RecordSource> = match fixtures {
        Some(dir) => {
            info!(dir = %dir.display(), "reading fixture pages");
            Arc::new(FixtureSource::new(dir, config.page_size))
        }
        None => remote_source(&config)?,
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current page");
            let _ = cancel_tx.send(true);
        }
    });

    let orchestrator = orchestrator_for(&config, source, store)?.with_cancellation(cancel_rx);
    let options = SyncOptions { full };
    let results = match kind {
        Some(kind) => vec![(kind, orchestrator.run(kind, options).await)],
        None => orchestrator.run_all(options).await,
    };

    let mut failed = false;
    for (kind, result) in results {
        match result {
            Ok(run) => {
                failed |= run.state == SyncState::Failed;
                println!(
                    "{kind}: state={} cancelled={} pages={} seen={} upserted={} unchanged={} new_fields={} columns={} errors={}",
                    run.state.as_str(),
                    run.cancelled,
                    run.pages_processed,
                    run.records_seen,
                    run.records_upserted,
                    run.records_unchanged,
                    run.new_fields_discovered,
                    run.columns_materialized,
                    run.errors_total
                );
                if let Some(fatal) = &run.fatal_error {
                    eprintln!("{kind}: {fatal}");
                }
                for err in &run.errors {
                    eprintln!("{kind}: {err}");
                }
            }
            Err(err) => {
                failed = true;
                eprintln!("{kind}: {err}");
            }
        }
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
