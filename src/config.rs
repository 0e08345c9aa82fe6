/*!
 * Configuration types for Bulwark
 *
 * Durations are written as integer milliseconds so the TOML stays readable.
 * The `*Settings` types are plain data; each converts into the validated
 * runtime type of its primitive.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::error::{ResilienceError, Result};
use crate::lock::{Locker, DEFAULT_KEY_PREFIX};
use crate::rate_limiter::{
    DistributedLimiterConfig, DistributedTokenBucket, FailurePolicy, TokenBucketLimiter,
};
use crate::retry::RetryPolicy;
use bulwark_core_store::SharedStore;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceSettings {
    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub circuit_breaker: BreakerSettings,

    /// Optional because a limiter has no sensible default rate
    #[serde(default)]
    pub rate_limiter: Option<LimiterSettings>,

    #[serde(default)]
    pub lock: LockSettings,
}

/// Diagnostic output settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Time spent open before a probe is allowed
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    #[serde(default = "default_max_half_open_probes")]
    pub max_half_open_probes: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            max_half_open_probes: default_max_half_open_probes(),
        }
    }
}

impl BreakerSettings {
    /// Runtime config; rejects zero thresholds instead of silently raising them
    pub fn to_config(&self) -> Result<CircuitBreakerConfig> {
        for (name, value) in [
            ("failure_threshold", self.failure_threshold),
            ("success_threshold", self.success_threshold),
            ("max_half_open_probes", self.max_half_open_probes),
        ] {
            if value == 0 {
                return Err(ResilienceError::InvalidConfig(format!(
                    "circuit_breaker.{name} must be > 0"
                )));
            }
        }

        Ok(CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            max_half_open_probes: self.max_half_open_probes,
            on_state_change: None,
        })
    }

    /// Registry whose breakers all use these settings
    pub fn registry(&self) -> Result<CircuitBreakerRegistry> {
        Ok(CircuitBreakerRegistry::new(self.to_config()?))
    }
}

/// Token bucket settings
///
/// `failure_policy` has no default: a configuration that uses a store-backed
/// limiter must say whether an outage admits or rejects traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    pub capacity: f64,

    /// Tokens per second
    pub refill_rate: f64,

    pub failure_policy: FailurePolicy,

    /// Store key; required for the distributed limiter only
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default = "default_unavailable_retry_ms")]
    pub unavailable_retry_ms: u64,
}

impl LimiterSettings {
    /// In-process limiter
    pub fn local(&self) -> Result<TokenBucketLimiter> {
        TokenBucketLimiter::new(self.capacity, self.refill_rate)
    }

    /// Limiter sharing its bucket through `store`
    pub fn distributed(&self, store: Arc<dyn SharedStore>) -> Result<DistributedTokenBucket> {
        let key = self.key.clone().ok_or_else(|| {
            ResilienceError::InvalidConfig(
                "rate_limiter.key is required for a distributed limiter".to_string(),
            )
        })?;

        let mut config =
            DistributedLimiterConfig::new(key, self.capacity, self.refill_rate, self.failure_policy);
        config.unavailable_retry = Duration::from_millis(self.unavailable_retry_ms);
        DistributedTokenBucket::new(store, config)
    }
}

/// Distributed lock settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSettings {
    /// Lease length for locks created from these settings
    #[serde(default = "default_lock_ttl_ms")]
    pub ttl_ms: u64,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl_ms: default_lock_ttl_ms(),
            key_prefix: default_key_prefix(),
            retry: RetrySettings::default(),
        }
    }
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Locker over `store` with the configured prefix and retry policy
    pub fn locker(&self, store: Arc<dyn SharedStore>) -> Result<Locker> {
        if self.ttl_ms == 0 {
            return Err(ResilienceError::InvalidConfig(
                "lock.ttl_ms must be > 0".to_string(),
            ));
        }
        let policy = self.retry.to_policy();
        policy.validate()?;

        Ok(Locker::new(store)
            .with_key_prefix(self.key_prefix.clone())
            .with_retry_policy(policy))
    }
}

/// Retry policy as written in the configuration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

// Default value functions for serde
fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_ms() -> u64 {
    60_000
}

fn default_max_half_open_probes() -> u32 {
    1
}

fn default_unavailable_retry_ms() -> u64 {
    1_000
}

fn default_lock_ttl_ms() -> u64 {
    30_000
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl ResilienceSettings {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ResilienceError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| ResilienceError::Config(format!("Invalid configuration: {}", e)))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ResilienceError::Config(format!("Failed to serialize: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| {
            ResilienceError::Config(format!("Failed to write {}: {}", path.display(), e))
        })
    }
}
