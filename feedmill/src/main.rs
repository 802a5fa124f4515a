/*
feedmill - single-binary main.rs
Starts the Rocket HTTP server and runs the background scheduler inside the
same process.
*/

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use common::Config;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use feedmill::fetcher::{probe_fetch_slots, Fetcher};
use feedmill::ingest::Ingestor;
use feedmill::quota::QuotaGovernor;
use feedmill::ratelimit::{AiRateLimiter, DEFAULT_MIN_INTERVAL};
use feedmill::scheduler::Scheduler;
use feedmill::secrets::SecretBox;
use feedmill::server::{launch_rocket, AppState};
use feedmill::store::Store;
use feedmill::sync::SyncLayer;
use feedmill::translate::{spawn_worker_pool, TranslationOrchestrator};
use feedmill::usage::UsageTracker;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const TRANSLATION_WORKERS: usize = 4;

#[derive(Parser, Debug)]
#[command(name = "feedmill", about = "Feedmill single-binary server + scheduler")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable background scheduler (run server only)
    #[arg(long)]
    no_scheduler: bool,

    /// Run scheduler only (do not bind HTTP server)
    #[arg(long)]
    scheduler_only: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

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
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    // Portable mode: a sentinel file next to the binary pins the data dir.
    let data_dir = if Path::new("portable.flag").exists() {
        info!("portable mode: using ./data");
        "data".to_string()
    } else {
        config.data_dir()
    };

    let db_pool = common::init_db_pool(&config.database.path)
        .await
        .context("failed to initialize database pool")?;

    // Migrations run before the ready latch opens; every reader waits.
    let store = Store::new(db_pool);
    store.migrate().await.context("failed to run migrations")?;

    let secrets = SecretBox::open(&SecretBox::default_path(&data_dir))
        .context("failed to open secret key file")?;

    seed_env_users(&store, &config).await?;

    // Singletons: quota governor, usage tracker, AI rate limiter.
    let governor = QuotaGovernor::new(store.clone());
    let translate_cfg = config.translate();
    let tracker = UsageTracker::new(
        store.clone(),
        translate_cfg.ai_usage_hard_limit.unwrap_or(0),
    );
    let min_interval = translate_cfg
        .min_interval_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_MIN_INTERVAL);
    let limiter = AiRateLimiter::new(min_interval);

    let orchestrator = Arc::new(TranslationOrchestrator::new(
        store.clone(),
        tracker.clone(),
        limiter,
        governor.clone(),
        secrets.clone(),
        translate_cfg.free_endpoint.clone(),
        config.fetch().global_proxy.clone(),
    ));

    // Post-write hook channel: the ingestor emits, the worker pool consumes.
    let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
    spawn_worker_pool(orchestrator.clone(), store.clone(), jobs_rx, TRANSLATION_WORKERS);
    let ingestor = Ingestor::new(store.clone(), Some(jobs_tx));

    let fetch_cfg = config.fetch();
    let global_slots = probe_fetch_slots(&fetch_cfg).await;
    let fetcher = Fetcher::new(
        store.clone(),
        governor.clone(),
        ingestor.clone(),
        secrets.clone(),
        fetch_cfg,
        global_slots,
        config.scheduler().refresh_minutes(),
    );

    let sync = SyncLayer::new(store.clone(), secrets.clone());

    let shutdown_notify = Arc::new(Notify::new());
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut scheduler_handle = None;
    if !args.no_scheduler {
        info!("Spawning background scheduler task");
        let scheduler = Scheduler::new(
            store.clone(),
            fetcher.clone(),
            sync.clone(),
            ingestor.clone(),
            config.scheduler(),
        );
        let s_shutdown = shutdown_notify.clone();
        let s_cancel = cancel_rx.clone();
        scheduler_handle = Some(tokio::spawn(async move {
            scheduler.run(s_shutdown, s_cancel).await;
        }));
    } else {
        info!("Background scheduler disabled via CLI (--no-scheduler)");
    }

    if args.scheduler_only {
        info!("Starting in scheduler-only mode");
        tokio::signal::ctrl_c().await.ok();
        info!("ctrl-c received, notifying scheduler to shutdown");
        let _ = cancel_tx.send(true);
        shutdown_notify.notify_waiters();
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        return Ok(());
    }

    let state = AppState {
        started_at: Utc::now(),
        config: Arc::new(config),
        store,
        secrets,
        governor,
        tracker,
        orchestrator,
        fetcher,
        sync,
        cancel: cancel_rx,
    };

    info!("Launching Rocket HTTP server");
    if let Err(e) = launch_rocket(state).await {
        error!(%e, "Rocket server failed");
    }

    // When the server shuts down, cancel in-flight work and wait briefly
    // for the scheduler to wind down.
    info!("HTTP server stopped; notifying scheduler to shutdown");
    let _ = cancel_tx.send(true);
    shutdown_notify.notify_waiters();

    if let Some(handle) = scheduler_handle {
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => info!("scheduler exited cleanly"),
            Ok(Err(join_err)) => error!(%join_err, "scheduler task panicked"),
            Err(_) => info!("Timed out waiting for scheduler to exit; continuing shutdown"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Ensure the env-configured admin and template users exist and are active.
/// Runs every startup; existing users are left untouched.
async fn seed_env_users(store: &Store, config: &Config) -> Result<()> {
    for (role, user_var, email_var, password_var) in [
        ("admin", "ADMIN_USERNAME", "ADMIN_EMAIL", "ADMIN_PASSWORD"),
        ("template", "TEMPLATE_USERNAME", "TEMPLATE_EMAIL", "TEMPLATE_PASSWORD"),
    ] {
        let (Ok(username), Ok(password)) = (std::env::var(user_var), std::env::var(password_var))
        else {
            continue;
        };
        let email = std::env::var(email_var).ok();
        if store.user_by_username(&username).await.is_ok() {
            continue;
        }
        let password_hash = feedmill::server::auth::hash_password(&password)
            .map_err(|e| anyhow::anyhow!("failed to hash {} password: {}", role, e))?;
        match store
            .create_user(
                &username,
                email.as_deref(),
                &password_hash,
                role,
                "active",
                &config.quota_defaults(),
            )
            .await
        {
            Ok(id) => info!("seeded {} user '{}' (id {})", role, username, id),
            Err(e) => warn!("could not seed {} user '{}': {}", role, username, e),
        }
    }
    Ok(())
}
