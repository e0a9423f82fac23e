// Configuration management for forge-index

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::{BackoffPolicy, DEFAULT_MAX_ATTEMPTS};
use crate::retry::RetryPolicy;

/// Default config file name looked up in the working directory
pub const CONFIG_FILE: &str = "forge-index.toml";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub search: SearchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlite,
    Postgres,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Postgres => "postgres",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: BackendKind,
    pub sqlite_path: PathBuf,
    pub postgres_url: Option<String>,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_max_attempts: i32,
    pub poll_interval_ms: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub max_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            sqlite_path: PathBuf::from("forge-index.db"),
            postgres_url: None,
            max_connections: 10,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval_ms: 1000,
            backoff_base_secs: backoff.base.as_secs(),
            backoff_max_secs: backoff.max.as_secs(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: crate::search::DEFAULT_LIMIT,
            max_limit: crate::search::MAX_LIMIT,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl QueueConfig {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(self.backoff_base_secs),
            max: Duration::from_secs(self.backoff_max_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SearchConfig {
    /// Requested limit, or the default when unset, capped at `max_limit`.
    pub fn limit(&self, requested: Option<usize>) -> usize {
        requested
            .filter(|&n| n > 0)
            .unwrap_or(self.default_limit)
            .min(self.max_limit)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else `forge-index.toml` in the working directory,
    /// else defaults. Environment overrides apply in every case.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            let config = Self::from_file(path)?;
            tracing::info!("Loaded configuration from {}", path.display());
            return Ok(config);
        }

        let default_path = Path::new(CONFIG_FILE);
        if default_path.exists() {
            let config = Self::from_file(default_path)?;
            tracing::info!("Loaded configuration from {}", default_path.display());
            return Ok(config);
        }

        tracing::debug!("No {} found, using default configuration", CONFIG_FILE);
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// `FORGE_INDEX_DATABASE_URL` selects PostgreSQL; `FORGE_INDEX_SQLITE_PATH`
    /// moves the SQLite file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("FORGE_INDEX_DATABASE_URL") {
            if !url.trim().is_empty() {
                self.database.backend = BackendKind::Postgres;
                self.database.postgres_url = Some(url);
            }
        }
        if let Ok(path) = std::env::var("FORGE_INDEX_SQLITE_PATH") {
            if !path.trim().is_empty() {
                self.database.sqlite_path = PathBuf::from(path);
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.backend == BackendKind::Postgres
            && self.database.postgres_url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(anyhow::anyhow!("postgres backend requires database.postgres_url"));
        }
        if self.database.backend == BackendKind::Sqlite
            && self.database.sqlite_path.as_os_str().is_empty()
        {
            return Err(anyhow::anyhow!("sqlite backend requires database.sqlite_path"));
        }
        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!("max_connections must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("retry.max_attempts must be greater than 0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(anyhow::anyhow!("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }

        if self.queue.default_max_attempts <= 0 {
            return Err(anyhow::anyhow!("queue.default_max_attempts must be greater than 0"));
        }
        if self.queue.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("queue.poll_interval_ms must be greater than 0"));
        }
        if self.queue.backoff_base_secs > self.queue.backoff_max_secs {
            return Err(anyhow::anyhow!("queue.backoff_base_secs must not exceed queue.backoff_max_secs"));
        }

        if self.search.default_limit == 0 {
            return Err(anyhow::anyhow!("search.default_limit must be greater than 0"));
        }
        if self.search.max_limit < self.search.default_limit {
            return Err(anyhow::anyhow!("search.max_limit must not be below search.default_limit"));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!("Invalid log level: {}", self.logging.level));
        }
        let valid_formats = ["compact", "pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!("Invalid log format: {}", self.logging.format));
        }

        Ok(())
    }
}
