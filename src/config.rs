//! Configuration loading.
//!
//! Configuration is loaded from a TOML file with the following resolution
//! order:
//! 1. explicit path (must exist)
//! 2. `<config dir>/keyward/config.toml` (user)
//! 3. built-in defaults
//!
//! Numeric tuning values are lenient: a value that is missing, non-numeric
//! or non-positive falls back to its default with a warning instead of
//! failing the load. Only unreadable or syntactically invalid files are
//! errors.
//!
//! ```toml
//! [rate_limit]
//! ttl_ms = 60000
//! max = 250
//! max_attempt = 3
//!
//! [credits]
//! daily_limit = 100
//! ledger_path = "/var/lib/keyward/ledger.json"
//!
//! [upload]
//! session_ttl_secs = 86400
//! max_files = 20
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::credits::{CreditConfig, default_ledger_path};
use crate::limiter::RateLimiterConfig;
use crate::upload::{LinkCacheConfig, RetryConfig, UploadConfig};
use crate::{KeywardError, Result};

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub credits: CreditSection,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// `[rate_limit]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitSection {
    /// Window length in milliseconds (default: 60000).
    #[serde(default, deserialize_with = "lenient_int")]
    pub ttl_ms: Option<i64>,
    /// Maximum tracked subjects (default: 250).
    #[serde(default, deserialize_with = "lenient_int")]
    pub max: Option<i64>,
    /// Admissions per subject per window (default: 3).
    #[serde(default, deserialize_with = "lenient_int")]
    pub max_attempt: Option<i64>,
}

/// `[credits]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreditSection {
    /// Limit passed to daily initialization.
    #[serde(default, deserialize_with = "lenient_int")]
    pub daily_limit: Option<i64>,
    /// Limit used when initialization gets an invalid value (default: 100).
    #[serde(default, deserialize_with = "lenient_int")]
    pub fallback_limit: Option<i64>,
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Fast counter key expiry in seconds (default: 172800).
    #[serde(default, deserialize_with = "lenient_int")]
    pub key_ttl_secs: Option<i64>,
    /// Durable ledger file (default: `<data dir>/keyward/ledger.json`).
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
}

/// `[upload]` table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadSection {
    #[serde(default, deserialize_with = "lenient_int")]
    pub session_ttl_secs: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub max_sessions: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub max_files: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub link_cache_ttl_secs: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub link_cache_max_entries: Option<i64>,
}

/// `[retry]` table, applied to link resolution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrySection {
    #[serde(default, deserialize_with = "lenient_int")]
    pub max_attempts: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub base_delay_ms: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub max_delay_ms: Option<i64>,
    #[serde(default)]
    pub jitter: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Int(i64),
    Float(f64),
    Other(serde::de::IgnoredAny),
}

/// Accept any value; keep it only if it is a finite number.
fn lenient_int<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match RawNumber::deserialize(deserializer)? {
        RawNumber::Int(n) => Some(n),
        RawNumber::Float(f) if f.is_finite() => Some(f as i64),
        RawNumber::Float(_) | RawNumber::Other(_) => {
            warn!("non-numeric configuration value, using default");
            None
        }
    })
}

/// Positive value of `field`, or `default`.
fn positive_or(value: Option<i64>, default: u64, field: &'static str) -> u64 {
    match value {
        Some(n) if n > 0 => n as u64,
        Some(n) => {
            warn!(field, value = n, default, "non-positive configuration value, using default");
            default
        }
        None => default,
    }
}

impl RateLimitSection {
    pub fn to_config(&self) -> RateLimiterConfig {
        RateLimiterConfig::from_raw(self.ttl_ms, self.max, self.max_attempt)
    }
}

impl CreditSection {
    pub fn to_config(&self) -> CreditConfig {
        let defaults = CreditConfig::default();
        let mut config = CreditConfig::new()
            .fallback_limit(positive_or(
                self.fallback_limit,
                defaults.fallback_limit as u64,
                "credits.fallback_limit",
            ) as i64)
            .key_ttl(Duration::from_secs(positive_or(
                self.key_ttl_secs,
                defaults.key_ttl.as_secs(),
                "credits.key_ttl_secs",
            )));
        if let Some(prefix) = self.key_prefix.as_deref().filter(|p| !p.is_empty()) {
            config = config.key_prefix(prefix);
        }
        config
    }

    /// Durable ledger location.
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger_path.clone().unwrap_or_else(default_ledger_path)
    }
}

impl UploadSection {
    pub fn to_config(&self) -> UploadConfig {
        let defaults = UploadConfig::default();
        UploadConfig::new()
            .session_ttl(Duration::from_secs(positive_or(
                self.session_ttl_secs,
                defaults.session_ttl.as_secs(),
                "upload.session_ttl_secs",
            )))
            .max_sessions(positive_or(
                self.max_sessions,
                defaults.max_sessions as u64,
                "upload.max_sessions",
            ) as usize)
            .max_files(positive_or(
                self.max_files,
                defaults.max_files as u64,
                "upload.max_files",
            ) as usize)
    }

    pub fn link_cache_config(&self) -> LinkCacheConfig {
        let defaults = LinkCacheConfig::default();
        LinkCacheConfig::new()
            .ttl(Duration::from_secs(positive_or(
                self.link_cache_ttl_secs,
                defaults.ttl.as_secs(),
                "upload.link_cache_ttl_secs",
            )))
            .max_entries(positive_or(
                self.link_cache_max_entries,
                defaults.max_entries,
                "upload.link_cache_max_entries",
            ))
    }
}

impl RetrySection {
    pub fn to_config(&self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig::new()
            .max_attempts(positive_or(
                self.max_attempts,
                u64::from(defaults.max_attempts),
                "retry.max_attempts",
            )
            .min(u64::from(u32::MAX)) as u32)
            .base_delay(Duration::from_millis(positive_or(
                self.base_delay_ms,
                defaults.base_delay.as_millis() as u64,
                "retry.base_delay_ms",
            )))
            .max_delay(Duration::from_millis(positive_or(
                self.max_delay_ms,
                defaults.max_delay.as_millis() as u64,
                "retry.max_delay_ms",
            )))
            .jitter(self.jitter.unwrap_or(defaults.jitter))
    }
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided; an error if missing)
    /// 2. `<config dir>/keyward/config.toml`
    /// 3. Defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let Some(path) = Self::resolve_config_path(explicit_path)? else {
            debug!("no config file found, using defaults");
            return Ok(Self::default());
        };
        let content = fs::read_to_string(&path).map_err(|e| {
            KeywardError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::from_toml_str(&content).map_err(|e| {
            KeywardError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| KeywardError::Configuration(e.to_string()))
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(KeywardError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(dir) = dirs::config_dir() {
            let user_config = dir.join("keyward").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        Ok(None)
    }
}
