/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Newsdeck.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader for a TOML config file with default/override merging
- Helpers to initialize an SQLite database pool
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/newsdeck.db")
    pub path: String,
}

/// Cache configuration section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheConfig {
    /// Redis connection URL; when absent or unreachable the cache runs on
    /// the in-process tier only.
    pub redis_url: Option<String>,
    pub default_ttl_seconds: Option<u64>,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_seconds.unwrap_or(300))
    }
}

/// Refresh scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    pub refresh_interval_seconds: Option<u64>,
    /// Pause between feeds within one cycle, to avoid hammering sources.
    pub feed_pause_ms: Option<u64>,
    /// Backoff after an unexpected error at the outer loop level.
    pub error_backoff_seconds: Option<u64>,
    /// How often the notification flush loop wakes up.
    pub flush_interval_seconds: Option<u64>,
}

impl SchedulerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds.unwrap_or(300))
    }

    pub fn feed_pause(&self) -> Duration {
        Duration::from_millis(self.feed_pause_ms.unwrap_or(1000))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds.unwrap_or(60))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds.unwrap_or(60))
    }
}

/// Cache warming configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WarmingConfig {
    pub interval_seconds: Option<u64>,
    /// Access count at which a feed qualifies as popular.
    pub popularity_threshold: Option<u64>,
    /// A feed's last access must fall within this window to qualify.
    pub recency_window_seconds: Option<u64>,
    /// Access stats idle longer than this are swept away.
    pub prune_after_seconds: Option<u64>,
}

impl WarmingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unwrap_or(300))
    }

    pub fn popularity_threshold(&self) -> u64 {
        self.popularity_threshold.unwrap_or(10)
    }

    pub fn recency_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recency_window_seconds.unwrap_or(1800) as i64)
    }

    pub fn prune_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.prune_after_seconds.unwrap_or(3600) as i64)
    }
}

/// Notification batching configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// Batched updates older than this are dropped even if never sent.
    pub retention_days: Option<i64>,
}

impl NotificationConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days.unwrap_or(7))
    }
}

/// Politeness / fetching configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolitenessConfig {
    pub fetch_timeout_seconds: Option<u64>,
    pub user_agent: Option<String>,
}

impl PolitenessConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds.unwrap_or(10))
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| format!("Newsdeck/{}", env!("CARGO_PKG_VERSION")))
    }
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub warming: WarmingConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub politeness: PolitenessConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .context("Failed to parse default configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .context("Failed to parse override configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
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
/// This function will create the parent directory if necessary, ensure the DB file exists
/// (attempting to create it if missing), and return a configured `SqlitePool`. Defaults are
/// conservative for resource-constrained platforms:
/// - max_connections: 5
/// - connection timeout default provided by `sqlx`
///
/// Example:
///   let pool = init_db_pool("data/newsdeck.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
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

    // Use a modest pool size for RPI and similar devices. Provide more context on connect errors.
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
