use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use mole_core::config::MoleConfig;
use mole_scheduler::{FiredJob, Reconciler, Scheduler};
use mole_store::{RunLedger, TaskRepository};
use mole_sync::{PostgresTransfer, ProcessRunner, SyncExecutor};
use mole_vault::CredentialVault;
use tracing::{info, warn};

mod app;
mod dispatch;
mod http;
#[cfg(test)]
mod test_support;

/// Scheduled database sync service.
#[derive(Parser, Debug)]
#[command(name = "mole-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to mole.toml (default: $MOLE_CONFIG, then ~/.mole/mole.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Override gateway.bind
    #[arg(long)]
    bind: Option<String>,

    /// Override gateway.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mole_gateway=info,mole_scheduler=info,mole_sync=info,mole_store=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    // load config: --config > MOLE_CONFIG env > ~/.mole/mole.toml
    let config_path = args.config.or_else(|| std::env::var("MOLE_CONFIG").ok());
    let mut config = MoleConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        MoleConfig::default()
    });
    if let Some(bind) = args.bind {
        config.gateway.bind = bind;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }
    if config.vault.uses_default_passphrase() {
        warn!("vault passphrase is the shipped default; set MOLE_ENCRYPTION_KEY to match the admin backend");
    }

    // control store, shared with the admin backend
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening control store");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    mole_store::db::init_db(&db)?;

    // repository and ledger each get their own connection
    let repo = Arc::new(TaskRepository::new(Arc::new(Mutex::new(
        rusqlite::Connection::open(db_path)?,
    ))));
    let ledger = Arc::new(RunLedger::new(Arc::new(Mutex::new(db))));

    let vault = Arc::new(CredentialVault::new(&config.vault.passphrase));
    let runner = Arc::new(ProcessRunner::new(Duration::from_secs(
        config.postgres.phase_timeout_secs,
    )));
    let postgres = Arc::new(PostgresTransfer::new(runner, config.postgres.clone()));
    let executor = Arc::new(SyncExecutor::new(
        Arc::clone(&repo),
        ledger,
        vault,
        postgres,
    ));

    // Fired-job channel: Scheduler clock → dispatcher
    let (fired_tx, fired_rx) = tokio::sync::mpsc::channel::<FiredJob>(256);
    let scheduler = Arc::new(Scheduler::new(
        fired_tx,
        Duration::from_millis(config.scheduler.tick_millis.max(1)),
    ));
    let reconciler = Arc::new(Reconciler::new(repo, Arc::clone(&scheduler)));

    let report = reconciler.install()?;
    info!(
        scheduled = report.added.len(),
        skipped = report.skipped.len(),
        "initial schedule loaded"
    );

    tokio::spawn(dispatch::run(fired_rx, Arc::clone(&executor), reconciler));
    let clock = scheduler.start();

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(config, Arc::clone(&scheduler), executor));
    let router = app::build_router(state);

    info!("Mole gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // stop firing; in-flight runs are not awaited
    scheduler.stop();
    let _ = clock.await;
    info!("Mole gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), "cannot create control store directory: {e}");
        }
    }
}
