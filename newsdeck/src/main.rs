/*
newsdeck - single-binary main.rs
This binary runs the feed refresh scheduler and the cache warming loop in one process.
*/

use anyhow::Result;
use clap::Parser;
use common::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use common::init_db_pool;
use newsdeck::cache::FailoverCache;
use newsdeck::fetcher::FeedFetcher;
use newsdeck::notify::{LogNotifier, NotificationBatcher};
use newsdeck::scheduler::RefreshScheduler;
use newsdeck::storage;
use newsdeck::warmer::CacheWarmer;

#[derive(Parser, Debug)]
#[command(name = "newsdeck", about = "Newsdeck feed refresh worker")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run a single refresh cycle and exit
    #[arg(long)]
    once: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    // Load configuration with defaults
    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, overrides = ?override_path, "configuration loaded");

    // Initialize DB pool - resolve and log the absolute DB path before connecting
    let db_path_abs = match tokio::fs::canonicalize(&config.database.path).await {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => config.database.path.clone(),
    };
    info!(db_path = %db_path_abs, "resolved DB path");

    let db_pool = match init_db_pool(&db_path_abs).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, db_path = %db_path_abs, "failed to initialize database pool");
            return Err(e);
        }
    };
    let db_pool = Arc::new(db_pool);
    storage::ensure_schema(&db_pool).await?;

    // Cache: tries the distributed tier, downgrades to in-process on failure
    let cache = Arc::new(
        FailoverCache::connect(config.cache.redis_url.as_deref(), config.cache.default_ttl())
            .await,
    );

    let fetcher = Arc::new(FeedFetcher::new(
        config.politeness.fetch_timeout(),
        &config.politeness.user_agent(),
    )?);

    let batcher = Arc::new(NotificationBatcher::new());
    let scheduler = Arc::new(RefreshScheduler::new(
        db_pool.clone(),
        cache.clone(),
        fetcher.clone(),
        batcher,
        Arc::new(LogNotifier),
        config.scheduler.clone(),
        config.notifications.clone(),
    ));
    let warmer = Arc::new(CacheWarmer::new(
        cache.clone(),
        fetcher.clone(),
        config.warming.clone(),
    ));

    if args.once {
        info!("running a single refresh cycle (--once)");
        let refreshed = scheduler.run_cycle().await?;
        let warmed = warmer.run_cycle().await;
        info!(refreshed, warmed, "single cycle complete");
        return Ok(());
    }

    // Prepare a shutdown notifier for the warming loop
    let shutdown_notify = Arc::new(Notify::new());

    scheduler.start().await;
    let warmer_handle = warmer.start(shutdown_notify.clone());

    // Run until CTRL-C, then shut everything down with a bounded wait
    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    scheduler.stop().await;
    shutdown_notify.notify_waiters();
    match tokio::time::timeout(Duration::from_secs(10), warmer_handle).await {
        Ok(Ok(())) => info!("warming loop exited cleanly"),
        Ok(Err(e)) => error!(%e, "warming loop task failed"),
        Err(_) => info!("timed out waiting for warming loop; continuing shutdown"),
    }

    info!("shutdown complete");
    Ok(())
}
