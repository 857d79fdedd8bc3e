//! Configuration loaded from `barvault.toml` with environment overrides.
//!
//! Every section has defaults, so an empty file (or no file) yields a
//! working configuration that caches under `./data_cache` and tries
//! Tushare, Eastmoney and Yahoo in that order.

use crate::provider::ProviderKind;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the Tushare API token.
pub const TUSHARE_TOKEN_ENV: &str = "TUSHARE_TOKEN";
/// Environment variable overriding `[cache].root`.
pub const CACHE_ROOT_ENV: &str = "BARVAULT_CACHE_ROOT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub providers: ProviderSettings,
    pub completeness: CompletenessConfig,
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string. Does not read the environment.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `TUSHARE_TOKEN` and `BARVAULT_CACHE_ROOT` when set.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(TUSHARE_TOKEN_ENV) {
            if !token.trim().is_empty() {
                self.providers.tushare.token = Some(token.trim().to_string());
            }
        }
        if let Ok(root) = std::env::var(CACHE_ROOT_ENV) {
            if !root.trim().is_empty() {
                self.cache.root = PathBuf::from(root);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.cache.evict_target_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "cache.evict_target_ratio must be in (0, 1], got {ratio}"
            )));
        }
        let tol = self.completeness.tolerance;
        if !(tol > 0.0 && tol <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "completeness.tolerance must be in (0, 1], got {tol}"
            )));
        }
        if self.providers.priority.is_empty() {
            return Err(ConfigError::Invalid(
                "providers.priority must name at least one provider".into(),
            ));
        }
        Ok(())
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub root: PathBuf,
    /// Size budget in MiB. `None` disables eviction.
    pub max_size_mb: Option<u64>,
    /// Time-to-live for `range_slice` entries. Permanent kinds never expire.
    pub ttl_days: Option<u64>,
    /// Eviction stops once the cache is at or below this fraction of the budget.
    pub evict_target_ratio: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data_cache"),
            max_size_mb: None,
            ttl_days: None,
            evict_target_ratio: 0.8,
        }
    }
}

impl CacheConfig {
    /// Default settings rooted at `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn max_bytes(&self) -> Option<u64> {
        self.max_size_mb.map(|mb| mb * 1024 * 1024)
    }

    pub fn ttl(&self) -> Option<chrono::Duration> {
        self.ttl_days.map(|d| chrono::Duration::days(d as i64))
    }
}

/// `[providers]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Failover order.
    pub priority: Vec<ProviderKind>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub breaker_cooldown_secs: u64,
    pub tushare: TushareSettings,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            priority: vec![ProviderKind::Tushare, ProviderKind::Eastmoney, ProviderKind::Yahoo],
            timeout_secs: 30,
            max_retries: 3,
            backoff_ms: 500,
            breaker_cooldown_secs: 30 * 60,
            tushare: TushareSettings::default(),
        }
    }
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TushareSettings {
    pub token: Option<String>,
    pub endpoint: String,
}

impl Default for TushareSettings {
    fn default() -> Self {
        Self {
            token: None,
            endpoint: "http://api.tushare.pro".into(),
        }
    }
}

/// `[completeness]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletenessConfig {
    /// Fraction of the expected count that counts as complete. 1.0 = exact.
    pub tolerance: f64,
    /// Consecutive incomplete re-fetches of a full history before it is
    /// accepted as best-effort.
    pub max_partial_retries: u32,
    /// First-fetch origin when no provider knows the listing date.
    pub history_origin: NaiveDate,
    /// Seconds a weekday-estimated calendar is reused before the calendar
    /// sources are asked again.
    pub calendar_estimate_ttl_secs: u64,
}

impl CompletenessConfig {
    pub fn calendar_estimate_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.calendar_estimate_ttl_secs)
    }
}

impl Default for CompletenessConfig {
    fn default() -> Self {
        Self {
            tolerance: 1.0,
            max_partial_retries: 3,
            history_origin: NaiveDate::from_ymd_opt(1990, 12, 19).unwrap_or_default(),
            calendar_estimate_ttl_secs: 600,
        }
    }
}
