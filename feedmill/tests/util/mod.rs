// Shared fixtures for the integration suites: a file-backed temp database,
// a temp secret key, and a fully-wired AppState for Rocket local clients.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use feedmill::fetcher::Fetcher;
use feedmill::ingest::Ingestor;
use feedmill::quota::QuotaGovernor;
use feedmill::ratelimit::AiRateLimiter;
use feedmill::secrets::SecretBox;
use feedmill::server::AppState;
use feedmill::store::Store;
use feedmill::sync::SyncLayer;
use feedmill::translate::TranslationOrchestrator;
use feedmill::usage::UsageTracker;

pub async fn test_store() -> Store {
    let db_path =
        std::env::temp_dir().join(format!("feedmill_it_{}.sqlite", uuid::Uuid::new_v4()));
    let pool = common::init_db_pool(&db_path.to_string_lossy())
        .await
        .expect("init pool");
    let store = Store::new(pool);
    store.migrate().await.expect("migrate");
    store
}

pub fn test_secrets() -> SecretBox {
    let key_path = std::env::temp_dir().join(format!("feedmill_key_{}", uuid::Uuid::new_v4()));
    SecretBox::open(&key_path).expect("open secret box")
}

pub async fn create_active_user(store: &Store, username: &str) -> i64 {
    let hash = feedmill::server::auth::hash_password("password").expect("hash");
    store
        .create_user(username, None, &hash, "user", "active", &Default::default())
        .await
        .expect("create user")
}

pub fn test_config() -> common::Config {
    toml::from_str(
        r#"
        [database]
        path = "unused.db"
        [translate]
        min_interval_ms = 10
    "#,
    )
    .expect("test config")
}

/// Build an orchestrator whose free endpoint points at a mock server.
pub fn orchestrator_with_free_endpoint(
    store: Store,
    secrets: SecretBox,
    free_endpoint: &str,
    hard_limit: i64,
) -> Arc<TranslationOrchestrator> {
    let tracker = UsageTracker::new(store.clone(), hard_limit);
    let limiter = AiRateLimiter::new(Duration::from_millis(10));
    let governor = QuotaGovernor::new(store.clone());
    Arc::new(TranslationOrchestrator::new(
        store,
        tracker,
        limiter,
        governor,
        secrets,
        Some(free_endpoint.to_string()),
        None,
    ))
}

/// Full state wiring for Rocket local-client tests. The free-translate
/// endpoint is routed to the given mock URL so no real network is touched.
pub async fn app_state(free_endpoint: &str) -> AppState {
    let store = test_store().await;
    let secrets = test_secrets();
    let config = Arc::new(test_config());

    let governor = QuotaGovernor::new(store.clone());
    let tracker = UsageTracker::new(store.clone(), 0);
    let limiter = AiRateLimiter::new(Duration::from_millis(10));
    let orchestrator = Arc::new(TranslationOrchestrator::new(
        store.clone(),
        tracker.clone(),
        limiter,
        governor.clone(),
        secrets.clone(),
        Some(free_endpoint.to_string()),
        None,
    ));

    let (jobs_tx, _jobs_rx) = mpsc::unbounded_channel();
    let ingestor = Ingestor::new(store.clone(), Some(jobs_tx));
    let fetcher = Fetcher::new(
        store.clone(),
        governor.clone(),
        ingestor,
        secrets.clone(),
        common::FetchConfig::default(),
        4,
        10,
    );
    let sync = SyncLayer::new(store.clone(), secrets.clone());
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    AppState {
        started_at: chrono::Utc::now(),
        config,
        store,
        secrets,
        governor,
        tracker,
        orchestrator,
        fetcher,
        sync,
        cancel: cancel_rx,
    }
}
