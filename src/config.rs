use crate::scheduler::CacheBudget;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

const CACHE_SIZE_VAR: &str = "RANGECACHE_CACHE_SIZE";
const BLOCK_SIZE_VAR: &str = "RANGECACHE_BLOCK_SIZE";
const CONTINUE_THRESHOLD_VAR: &str = "RANGECACHE_CONTINUE_THRESHOLD";
const MAX_RETRIES_VAR: &str = "RANGECACHE_MAX_RETRIES";
const RETRY_DELAY_VAR: &str = "RANGECACHE_RETRY_DELAY_MS";

/// Configuration for a streaming range cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum bytes held in memory. `None` caches the whole file.
    /// Also the largest single read the cache accepts.
    pub cache_size_bytes: Option<u64>,
    /// Storage and eviction granularity (default: 1MB)
    pub block_size_bytes: u64,
    /// Distance a read may be ahead of the running connection before the
    /// connection is restarted at the read (default: 5MB)
    pub continue_downloading_threshold: u64,
    /// Consecutive failed connections before pending reads are failed
    pub max_retries: u32,
    /// First retry delay; doubles on every further failure
    pub retry_base_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            cache_size_bytes: Some(200 * 1024 * 1024), // 200MB
            block_size_bytes: 1024 * 1024,             // 1MB
            continue_downloading_threshold: 5_000_000,
            max_retries: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl CacheConfig {
    /// Configuration that keeps the entire file once downloaded
    pub fn unbounded() -> Self {
        CacheConfig {
            cache_size_bytes: None,
            ..Default::default()
        }
    }

    /// Load configuration from the environment
    ///
    /// In debug builds a `.env` file is loaded first when present.
    pub fn load() -> Result<Self, ConfigError> {
        #[cfg(debug_assertions)]
        {
            if dotenvy::dotenv().is_ok() {
                tracing::debug!("Config: loaded .env file");
            }
        }

        let config = Self::from_env()?;
        config.validate()?;
        info!(
            "Config: cache size {}, block size {} bytes",
            config
                .cache_size_bytes
                .map(|size| format!("{} bytes", size))
                .unwrap_or_else(|| "unbounded".to_string()),
            config.block_size_bytes
        );
        Ok(config)
    }

    /// Read overrides from `RANGECACHE_*` variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = CacheConfig::default();

        if let Ok(value) = std::env::var(CACHE_SIZE_VAR) {
            config.cache_size_bytes = if value.trim().eq_ignore_ascii_case("unbounded") {
                None
            } else {
                Some(parse_var(CACHE_SIZE_VAR, &value)?)
            };
        }
        if let Ok(value) = std::env::var(BLOCK_SIZE_VAR) {
            config.block_size_bytes = parse_var(BLOCK_SIZE_VAR, &value)?;
        }
        if let Ok(value) = std::env::var(CONTINUE_THRESHOLD_VAR) {
            config.continue_downloading_threshold = parse_var(CONTINUE_THRESHOLD_VAR, &value)?;
        }
        if let Ok(value) = std::env::var(MAX_RETRIES_VAR) {
            config.max_retries = parse_var(MAX_RETRIES_VAR, &value)?;
        }
        if let Ok(value) = std::env::var(RETRY_DELAY_VAR) {
            config.retry_base_delay_ms = parse_var(RETRY_DELAY_VAR, &value)?;
        }

        Ok(config)
    }

    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size_bytes == 0 {
            return Err(ConfigError::Invalid(
                "Block size cannot be zero".to_string(),
            ));
        }
        if self.cache_size_bytes == Some(0) {
            return Err(ConfigError::Invalid(
                "Cache size cannot be zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Scheduling limits for a file of `file_size` bytes
    pub fn budget(&self, file_size: u64) -> CacheBudget {
        CacheBudget {
            max_request_size: self.cache_size_bytes.unwrap_or(u64::MAX),
            file_size,
            continue_downloading_threshold: self.continue_downloading_threshold,
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        var,
        value: value.to_string(),
    })
}

/// Configuration for HTTP range fetching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds (default: 30)
    pub timeout_secs: u64,
    /// Connect timeout in seconds (default: 10)
    pub connect_timeout_secs: u64,
    pub user_agent: Option<String>,
    /// Sent as `Authorization: Bearer <token>`
    pub bearer_token: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: None,
            bearer_token: None,
        }
    }
}
