/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Feedmill.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default file with an override file
- Helpers to initialize the SQLite connection pool
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// HTTP server configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
    /// Port the JSON API listens on. Defaults to 1234.
    pub port: Option<u16>,
}

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/feedmill.db")
    pub path: String,
}

/// Data directory layout (attachments, secret key file, portable sentinel)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub dir: Option<String>,
}

impl DataConfig {
    /// Effective data directory: env override wins, then config, then "data".
    pub fn effective_dir(&self) -> String {
        std::env::var("FEEDMILL_DATA_DIR")
            .ok()
            .or_else(|| self.dir.clone())
            .unwrap_or_else(|| "data".to_string())
    }
}

/// Scheduler cadences, in minutes unless noted
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub refresh_minutes: Option<i64>,
    pub sync_outbound_minutes: Option<i64>,
    pub sync_inbound_minutes: Option<i64>,
    pub retention_sweep_minutes: Option<i64>,
    pub storage_sweep_minutes: Option<i64>,
    /// Items older than this are removed by the retention sweep unless
    /// favorited or on read-later.
    pub max_age_days: Option<i64>,
    /// Cap on stored content bodies, enforced by the storage sweep.
    pub max_cache_size_mb: Option<i64>,
}

impl SchedulerConfig {
    pub fn refresh_minutes(&self) -> i64 {
        self.refresh_minutes.unwrap_or(10)
    }
    pub fn sync_outbound_minutes(&self) -> i64 {
        self.sync_outbound_minutes.unwrap_or(5)
    }
    pub fn sync_inbound_minutes(&self) -> i64 {
        self.sync_inbound_minutes.unwrap_or(15)
    }
    pub fn retention_sweep_minutes(&self) -> i64 {
        self.retention_sweep_minutes.unwrap_or(60)
    }
    pub fn storage_sweep_minutes(&self) -> i64 {
        self.storage_sweep_minutes.unwrap_or(60)
    }
}

/// Fetching / politeness configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_seconds: Option<u64>,
    /// Root directory user scripts must resolve under.
    pub scripts_root: Option<String>,
    /// Small URL fetched at startup to size the global fetch semaphore.
    pub probe_url: Option<String>,
    pub probe_timeout_seconds: Option<u64>,
    /// Proxy used by sources whose proxy_mode is "global".
    pub global_proxy: Option<String>,
}

impl FetchConfig {
    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.unwrap_or(30)
    }
}

/// Translation / AI configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranslateConfig {
    /// Minimum interval between AI-provider releases, in milliseconds.
    pub min_interval_ms: Option<u64>,
    /// Endpoint of the free public translate service.
    pub free_endpoint: Option<String>,
    pub default_target_lang: Option<String>,
    /// System-wide hard cap on AI tokens per user (0 = unlimited).
    pub ai_usage_hard_limit: Option<i64>,
}

/// Default quotas applied to newly created users
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaDefaults {
    pub max_feeds: Option<i64>,
    pub max_articles: Option<i64>,
    pub max_ai_tokens: Option<i64>,
    pub max_storage_mb: Option<i64>,
    pub max_concurrent_ai: Option<i64>,
    pub max_concurrent_feed_fetch: Option<i64>,
    pub max_concurrent_db_query: Option<i64>,
    pub max_concurrent_media_cache: Option<i64>,
    pub max_concurrent_discovery: Option<i64>,
    pub max_concurrent_translation: Option<i64>,
}

/// Admin / maintenance config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub auto_migrate: Option<bool>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Option<ServerConfig>,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub data: Option<DataConfig>,
    pub scheduler: Option<SchedulerConfig>,
    pub fetch: Option<FetchConfig>,
    pub translate: Option<TranslateConfig>,
    pub quota_defaults: Option<QuotaDefaults>,
    pub admin: Option<AdminConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse default configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse override configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        self.scheduler.clone().unwrap_or_default()
    }

    pub fn fetch(&self) -> FetchConfig {
        self.fetch.clone().unwrap_or_default()
    }

    pub fn translate(&self) -> TranslateConfig {
        self.translate.clone().unwrap_or_default()
    }

    pub fn quota_defaults(&self) -> QuotaDefaults {
        self.quota_defaults.clone().unwrap_or_default()
    }

    pub fn data_dir(&self) -> String {
        self.data
            .as_ref()
            .map(|d| d.effective_dir())
            .unwrap_or_else(|| "data".to_string())
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory and DB file if necessary and returns a
/// configured `SqlitePool`. The design deliberately favors few long-lived
/// connections: readers do not block readers under WAL, and the single
/// writer is serialized by the engine.
/// - max_connections: 5, min_connections: 2
/// - WAL journal mode, busy timeout 8 s
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    // Try to create the DB file if it does not already exist. This gives a clearer error
    // earlier (filesystem permission or path issues) instead of only surfacing it via the
    // SQLite connection attempt.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(8));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .min_connections(2)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Convenience: sleep helper used by implementations (kept public for tests)
pub async fn sleep_millis(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
