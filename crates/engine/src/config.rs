use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sluice_pool::PoolConfig;
use thiserror::Error;

use crate::retry::{BackoffStrategy, RetryPolicy};

pub const CONFIG_PATH_ENV: &str = "SLUICE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "sluice.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Longest a sync caller waits for its job, 0 = no limit
    #[serde(default)]
    pub request_timeout_ms: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default)]
    pub webhook: WebhookConfig,
    /// Webhook targets per background route
    #[serde(default)]
    pub webhooks: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_webhook_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_webhook_concurrency")]
    pub concurrency: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_workers() -> usize {
    1
}

fn default_queue_capacity() -> usize {
    32
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_history_limit() -> usize {
    200
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

fn default_webhook_queue_capacity() -> usize {
    256
}

fn default_webhook_concurrency() -> usize {
    8
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            request_timeout_ms: 0,
            max_body_bytes: default_max_body_bytes(),
            history_limit: default_history_limit(),
            webhook: WebhookConfig::default(),
            webhooks: HashMap::new(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            timeout_ms: default_webhook_timeout_ms(),
            queue_capacity: default_webhook_queue_capacity(),
            concurrency: default_webhook_concurrency(),
        }
    }
}

impl WebhookConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: BackoffStrategy::Exponential {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_millis(self.backoff_max_ms),
            },
            attempt_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

impl ServeConfig {
    /// Defaults, then the config file, then `SLUICE_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(&|key: &str| std::env::var(key).ok())
    }

    pub fn load_with<F>(env_get: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match find_config_path_with(env_get)? {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_with(env_get)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str::<ServeConfig>(&contents).map_err(|source| {
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn apply_env_with<F>(&mut self, env_get: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = env_get("SLUICE_HOST") {
            self.host = host;
        }
        if let Some(port) = parse_env("SLUICE_PORT", env_get)? {
            self.port = port;
        }
        if let Some(workers) = parse_env("SLUICE_WORKERS", env_get)? {
            self.workers = workers;
        }
        if let Some(capacity) = parse_env("SLUICE_QUEUE_CAPACITY", env_get)? {
            self.queue_capacity = capacity;
        }
        if let Some(timeout) = parse_env("SLUICE_REQUEST_TIMEOUT_MS", env_get)? {
            self.request_timeout_ms = timeout;
        }
        if let Some(limit) = parse_env("SLUICE_MAX_BODY_BYTES", env_get)? {
            self.max_body_bytes = limit;
        }
        if let Some(attempts) = parse_env("SLUICE_WEBHOOK_MAX_ATTEMPTS", env_get)? {
            self.webhook.max_attempts = attempts;
        }
        if let Some(timeout) = parse_env("SLUICE_WEBHOOK_TIMEOUT_MS", env_get)? {
            self.webhook.timeout_ms = timeout;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }
        let admitted = self.queue_capacity.checked_add(self.workers);
        if admitted.is_none_or(|total| total > tokio::sync::Semaphore::MAX_PERMITS) {
            return Err(ConfigError::Invalid(format!(
                "queue_capacity + workers must not exceed {}",
                tokio::sync::Semaphore::MAX_PERMITS
            )));
        }
        if self.webhook.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "webhook.max_attempts must be at least 1".into(),
            ));
        }
        if self.webhook.queue_capacity == 0 || self.webhook.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "webhook queue_capacity and concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            num_workers: self.workers,
            queue_capacity: self.queue_capacity,
            history_limit: self.history_limit,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T, F>(key: &str, env_get: &F) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = env_get(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })
}

fn find_config_path_with<F>(env_get: &F) -> Result<Option<PathBuf>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = env_get(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if !path.exists() {
            return Err(ConfigError::Read {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("{} points at a missing file", CONFIG_PATH_ENV),
                ),
                path,
            });
        }
        return Ok(Some(path));
    }

    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    Ok(local.exists().then_some(local))
}
