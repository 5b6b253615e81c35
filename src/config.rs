//! Configuration for the sync core.
//!
//! # Example
//!
//! ```
//! use sync_core::SyncCoreConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncCoreConfig::default();
//! assert_eq!(config.batch_size, 100);
//! assert_eq!(config.sync_lock_ttl_ms, 60_000);
//!
//! // Shared lock store plus a tighter breaker
//! let config = SyncCoreConfig {
//!     redis_url: Some("redis://localhost:6379".into()),
//!     breaker_failure_threshold: 3,
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::resilience::circuit_breaker::CircuitConfig;
use crate::resilience::retry::RetryConfig;

/// Configuration for locking, circuit breaking and batch dispatch.
///
/// All fields have sensible defaults. Without `redis_url` the lock manager
/// runs on its process-local table only.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncCoreConfig {
    /// Redis connection string for the shared lock store (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Optional key prefix for namespacing lock keys in a shared Redis
    #[serde(default)]
    pub redis_prefix: Option<String>,

    /// Rows per dispatched batch (default: 100)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// TTL for generic locks taken through `with_lock`
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// TTL for the per-destination sync lock. Keep this well above the
    /// expected duration of a full sync.
    #[serde(default = "default_sync_lock_ttl_ms")]
    pub sync_lock_ttl_ms: u64,

    /// Lock acquisition attempts before giving up
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,
    #[serde(default = "default_lock_retry_jitter_ms")]
    pub lock_retry_jitter_ms: u64,

    /// How often the local fallback table is swept (0 = disabled)
    #[serde(default = "default_lock_sweep_interval_secs")]
    pub lock_sweep_interval_secs: u64,

    /// Dispatch attempts per batch (first try included)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Consecutive failures that trip the breaker
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// Time the breaker stays open before allowing a trial call
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,
}

fn default_batch_size() -> usize { 100 }
fn default_lock_ttl_ms() -> u64 { 30_000 }
fn default_sync_lock_ttl_ms() -> u64 { 60_000 }
fn default_lock_attempts() -> u32 { 3 }
fn default_lock_retry_delay_ms() -> u64 { 200 }
fn default_lock_retry_jitter_ms() -> u64 { 200 }
fn default_lock_sweep_interval_secs() -> u64 { 60 }
fn default_max_retries() -> usize { 3 }
fn default_base_delay_ms() -> u64 { 1_000 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_breaker_failure_threshold() -> u32 { 5 }
fn default_breaker_cooldown_ms() -> u64 { 30_000 }

impl Default for SyncCoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            redis_prefix: None,
            batch_size: default_batch_size(),
            lock_ttl_ms: default_lock_ttl_ms(),
            sync_lock_ttl_ms: default_sync_lock_ttl_ms(),
            lock_attempts: default_lock_attempts(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            lock_retry_jitter_ms: default_lock_retry_jitter_ms(),
            lock_sweep_interval_secs: default_lock_sweep_interval_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
        }
    }
}

/// A configuration value that can never work at runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid config: {field} {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: &'static str,
}

impl SyncCoreConfig {
    /// Reject values that would loop forever or never succeed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, bool); 6] = [
            ("batch_size", self.batch_size == 0),
            ("lock_ttl_ms", self.lock_ttl_ms == 0),
            ("sync_lock_ttl_ms", self.sync_lock_ttl_ms == 0),
            ("lock_attempts", self.lock_attempts == 0),
            ("max_retries", self.max_retries == 0),
            ("breaker_failure_threshold", self.breaker_failure_threshold == 0),
        ];
        match checks.iter().find(|(_, bad)| *bad) {
            Some((field, _)) => Err(ConfigError { field: *field, reason: "must be greater than zero" }),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    #[must_use]
    pub fn sync_lock_ttl(&self) -> Duration {
        Duration::from_millis(self.sync_lock_ttl_ms)
    }

    /// Retry policy used for each batch dispatch.
    #[must_use]
    pub fn batch_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: Some(self.max_retries),
            initial_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            factor: 2.0,
        }
    }

    /// Breaker settings for the bulk-append dependency.
    #[must_use]
    pub fn breaker(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.breaker_failure_threshold,
            cooldown: Duration::from_millis(self.breaker_cooldown_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SyncCoreConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.lock_ttl_ms, 30_000);
        assert_eq!(config.sync_lock_ttl_ms, 60_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 1_000);
        assert_eq!(config.lock_attempts, 3);
        assert_eq!(config.lock_retry_delay_ms, 200);
        assert_eq!(config.lock_retry_jitter_ms, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: SyncCoreConfig = serde_json::from_str(
            r#"{"redis_url": "redis://cache:6379", "batch_size": 250}"#,
        )
        .unwrap();

        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.breaker_failure_threshold, 5);
        assert_eq!(config.sync_lock_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zero_batch_size() {
        let config = SyncCoreConfig { batch_size: 0, ..Default::default() };
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "batch_size");
    }

    #[test]
    fn test_batch_retry_derives_from_config() {
        let config = SyncCoreConfig { base_delay_ms: 500, max_retries: 4, ..Default::default() };
        let retry = config.batch_retry();
        assert_eq!(retry.max_retries, Some(4));
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
    }
}
