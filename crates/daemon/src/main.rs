use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tablevault_core::model::{BackupType, TriggerType};
use tablevault_daemon::config::{self, Config};
use tablevault_daemon::{build_router, AppState};
use tablevault_engine::{CreateBackupRequest, Engine, Scheduler};
use tablevault_notify::{LogNotifier, Notifier, WebhookNotifier};
use tablevault_storage::{
    BlobStore, FsBlobStore, MetadataStore, PostgresStore, SqliteStore, SqliteTableHandle,
    TableRegistry,
};
use tokio::sync::Mutex;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let (cfg, mode) = parse_args()?;

    let root = env::var("TABLEVAULT_ROOT")
        .ok()
        .or_else(|| cfg.storage.root.clone())
        .unwrap_or_else(|| "./data".to_owned());

    let listen = env::var("TABLEVAULT_LISTEN")
        .ok()
        .or_else(|| cfg.server.listen.clone())
        .unwrap_or_else(|| "127.0.0.1:8088".to_owned());

    let engine = Arc::new(build_engine(&cfg, PathBuf::from(&root)).await?);

    match mode.as_deref() {
        Some("run-once") => run_once(engine).await,
        _ => run_service(engine, &listen, &cfg).await,
    }
}

/// Parse CLI args, returning the loaded config and optional subcommand.
fn parse_args() -> Result<(Config, Option<String>)> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut mode: Option<String> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            other => {
                mode = Some(other.to_owned());
            }
        }
        i += 1;
    }

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, mode))
}

/// Wire the metadata store, blob store, and table catalog into an engine.
/// A configured `DATABASE_URL` selects Postgres for metadata, otherwise
/// SQLite lives under the storage root.
async fn build_engine(cfg: &Config, root: PathBuf) -> Result<Engine> {
    let database_url = env::var("DATABASE_URL")
        .ok()
        .or_else(|| cfg.storage.database_url.clone());

    std::fs::create_dir_all(&root)
        .with_context(|| format!("creating storage root {}", root.display()))?;

    let store: Arc<dyn MetadataStore> = match database_url.as_deref() {
        Some(url) => {
            info!("using postgres metadata store");
            Arc::new(PostgresStore::new(url).await?)
        }
        None => {
            info!(root = %root.display(), "using sqlite metadata store");
            Arc::new(SqliteStore::new(root.join("metadata.db"))?)
        }
    };
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(root.join("blobs"))?);

    let source_db = env::var("TABLEVAULT_SOURCE_DB")
        .ok()
        .or_else(|| cfg.source.database.clone());
    let mut registry = TableRegistry::new();
    if let Some(path) = source_db {
        let path = PathBuf::from(path);
        for table in &cfg.source.tables {
            let handle = SqliteTableHandle::new(path.clone(), table.clone())
                .with_context(|| format!("registering source table {table}"))?;
            registry.register(table.as_str(), Arc::new(handle));
        }
        info!(tables = registry.len(), "source table catalog registered");
    }

    Ok(Engine::new(store, blobs, Arc::new(registry)))
}

fn notifier(cfg: &Config) -> Arc<dyn Notifier> {
    let webhook_url = env::var("TABLEVAULT_WEBHOOK_URL")
        .ok()
        .or_else(|| cfg.notify.webhook_url.clone());
    match webhook_url {
        Some(url) => {
            info!("operator notifications via webhook");
            Arc::new(WebhookNotifier::new(url))
        }
        None => Arc::new(LogNotifier),
    }
}

/// One manual full backup, then exit. Suits cron-driven deployments that
/// do not want the resident daemon.
async fn run_once(engine: Arc<Engine>) -> Result<()> {
    let now = chrono::Utc::now();
    let backup = engine
        .create_backup(CreateBackupRequest {
            name: format!("manual_{}", now.format("%Y%m%d_%H%M%S")),
            description: Some("run-once backup".to_owned()),
            backup_type: BackupType::Full,
            trigger_type: TriggerType::Manual,
            created_by: "cli".to_owned(),
            tables: None,
        })
        .await?;
    info!(
        backup_id = %backup.id,
        status = backup.status.as_str(),
        tables = backup.table_count,
        "backup finished"
    );
    Ok(())
}

async fn run_service(engine: Arc<Engine>, listen: &str, cfg: &Config) -> Result<()> {
    let mut scheduler = Scheduler::new(engine.clone(), notifier(cfg));
    scheduler.start();

    let state = AppState {
        engine,
        scheduler: Arc::new(scheduler),
        rollback_gate: Arc::new(Mutex::new(None)),
        csrf_token: env::var("TABLEVAULT_CSRF_TOKEN")
            .ok()
            .or_else(|| cfg.security.csrf_token.clone()),
        api_token: env::var("TABLEVAULT_API_TOKEN")
            .ok()
            .or_else(|| cfg.security.api_token.clone()),
    };

    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid listen address: {listen}"))?;
    let app = build_router(state);

    info!(%addr, "starting daemon API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
