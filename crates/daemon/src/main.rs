//! ldapsync daemon entry point.
//!
//! Loads configuration, opens the document store, builds the reconciliation
//! engine and runs the scheduler until a shutdown signal arrives.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ldapsync_core::config::AppConfig;
use ldapsync_core::db::Database;
use ldapsync_core::directory::LdapConnector;
use ldapsync_core::sync_engine::{SyncEngine, SyncSettings};

/// How long shutdown waits for an in-flight pass to reach a group boundary.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// ldapsync reconciliation daemon.
#[derive(Parser, Debug)]
#[command(
    name = "ldapsync-daemon",
    version,
    about = "Periodic directory group membership reconciliation"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Run one pass over every mapped group and exit.
    #[arg(long)]
    once: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::load_and_resolve(&args.config).context("failed to load configuration")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    info!("========================================");
    info!("  ldapsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Directory     : {}", config.ldap.url);
    info!("Base DN       : {}", config.ldap.base_dn);
    info!("Mapped groups : {}", config.groups.len());
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    let db_path = config.daemon.database_path();
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize().context("failed to initialize database schema")?;
    info!("Database initialized at {}", db_path.display());

    let settings = SyncSettings::from_config(&config).context("invalid reconciliation settings")?;
    let connector = LdapConnector::new(&config.ldap);
    let engine = Arc::new(SyncEngine::new(settings, db, Box::new(connector)));

    if args.once {
        let run_engine = Arc::clone(&engine);
        let report = tokio::task::spawn_blocking(move || run_engine.sync_all())
            .await
            .context("reconciliation task failed")??;
        info!(
            groups = report.groups.len(),
            failed = report.failed.len(),
            "single pass finished"
        );
        if !report.is_success() {
            anyhow::bail!("{} group(s) failed to reconcile", report.failed.len());
        }
        return Ok(());
    }

    let (trigger_tx, trigger_rx) = tokio::sync::mpsc::channel::<()>(4);
    let reload_handle = tokio::spawn(signals::forward_reload(trigger_tx));

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = shutdown.clone();
    let poll_interval = Duration::from_secs(config.daemon.poll_interval_secs);
    let mut sched = scheduler::Scheduler::new(engine.clone(), poll_interval, trigger_rx);
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    // Stop an in-flight pass at the next group boundary.
    engine.cancel_handle().store(true, Ordering::SeqCst);
    shutdown.notify_one();

    match tokio::time::timeout(SHUTDOWN_GRACE, scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!("scheduler did not stop within {}s, forcing shutdown", SHUTDOWN_GRACE.as_secs()),
    }
    reload_handle.abort();

    info!(uptime_secs = engine.uptime_secs(), "ldapsync daemon stopped.");
    Ok(())
}
