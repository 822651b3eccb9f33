//! Configuration types
//!
//! Every config has a `Default`, a `from_env()` constructor reading
//! `TIERSTORE_*` variables (unset or unparsable values fall back to the
//! default), and a `validate()` check.

use std::str::FromStr;
use std::time::Duration;

use crate::constants::*;
use crate::error::{ConfigError, TierResult};

/// Read and parse an environment variable, falling back to `default`.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> crate::error::TierError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Retry policy for optimistic transactions.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_TXN_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_TXN_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_TXN_MAX_BACKOFF_MS),
            backoff_multiplier: DEFAULT_TXN_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryConfig {
    /// Create RetryConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TIERSTORE_TXN_MAX_ATTEMPTS` (default: 10)
    /// - `TIERSTORE_TXN_INITIAL_BACKOFF_MS` (default: 10)
    /// - `TIERSTORE_TXN_MAX_BACKOFF_MS` (default: 1000)
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_or("TIERSTORE_TXN_MAX_ATTEMPTS", DEFAULT_TXN_MAX_ATTEMPTS),
            initial_backoff: Duration::from_millis(env_or(
                "TIERSTORE_TXN_INITIAL_BACKOFF_MS",
                DEFAULT_TXN_INITIAL_BACKOFF_MS,
            )),
            max_backoff: Duration::from_millis(env_or(
                "TIERSTORE_TXN_MAX_BACKOFF_MS",
                DEFAULT_TXN_MAX_BACKOFF_MS,
            )),
            backoff_multiplier: DEFAULT_TXN_BACKOFF_MULTIPLIER,
        }
    }

    /// No backoff between attempts. Useful for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Backoff to wait after `attempt` (1-based) failed with a conflict.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let scaled = self.initial_backoff.as_secs_f64()
            * f64::from(self.backoff_multiplier).powi(exponent);
        Duration::from_secs_f64(scaled.min(self.max_backoff.as_secs_f64()))
    }

    pub fn validate(&self) -> TierResult<()> {
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", self.max_attempts, "must be at least 1"));
        }
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(invalid(
                "backoff_multiplier",
                self.backoff_multiplier,
                "must be a finite value >= 1.0",
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(invalid(
                "initial_backoff",
                format!("{:?}", self.initial_backoff),
                "must not exceed max_backoff",
            ));
        }
        Ok(())
    }
}

/// Memcache-style ceiling on relative expirations (30 days).
const MAX_RELATIVE_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Entity store configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Upper bound applied to every entity's cache TTL.
    pub max_cache_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }
}

impl StoreConfig {
    /// Create StoreConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TIERSTORE_MAX_CACHE_TTL_SECS` (default: 3600)
    pub fn from_env() -> Self {
        Self {
            max_cache_ttl: Duration::from_secs(env_or(
                "TIERSTORE_MAX_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
        }
    }

    /// Clamp an entity-provided TTL to the configured ceiling.
    pub fn effective_cache_ttl(&self, requested: Duration) -> Duration {
        requested.min(self.max_cache_ttl)
    }

    pub fn validate(&self) -> TierResult<()> {
        if self.max_cache_ttl > MAX_RELATIVE_CACHE_TTL {
            return Err(invalid(
                "max_cache_ttl",
                format!("{:?}", self.max_cache_ttl),
                "must not exceed 30 days",
            ));
        }
        Ok(())
    }
}

/// Garbage-collection sweep configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// Wall-clock time allowed for one sweep. Checked between batches.
    pub budget: Duration,
    /// Grace period past expiration before a row is eligible.
    pub leeway: Duration,
    /// Keys fetched and deleted per batch.
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(DEFAULT_SWEEP_BUDGET_SECS),
            leeway: Duration::from_secs(DEFAULT_SWEEP_LEEWAY_SECS),
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }
}

impl SweepConfig {
    /// Create SweepConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TIERSTORE_SWEEP_BUDGET_SECS` (default: 50)
    /// - `TIERSTORE_SWEEP_LEEWAY_SECS` (default: 86400)
    /// - `TIERSTORE_SWEEP_BATCH_SIZE` (default: 400)
    pub fn from_env() -> Self {
        Self {
            budget: Duration::from_secs(env_or(
                "TIERSTORE_SWEEP_BUDGET_SECS",
                DEFAULT_SWEEP_BUDGET_SECS,
            )),
            leeway: Duration::from_secs(env_or(
                "TIERSTORE_SWEEP_LEEWAY_SECS",
                DEFAULT_SWEEP_LEEWAY_SECS,
            )),
            batch_size: env_or("TIERSTORE_SWEEP_BATCH_SIZE", DEFAULT_SWEEP_BATCH_SIZE),
        }
    }

    pub fn validate(&self) -> TierResult<()> {
        if self.batch_size == 0 {
            return Err(invalid("batch_size", self.batch_size, "must be at least 1"));
        }
        if chrono::Duration::from_std(self.leeway).is_err() {
            return Err(invalid(
                "leeway",
                format!("{:?}", self.leeway),
                "out of range for timestamp arithmetic",
            ));
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(StoreConfig::default().validate().is_ok());
        assert!(SweepConfig::default().validate().is_ok());
    }

    #[test]
    fn test_sweep_defaults() {
        let config = SweepConfig::default();
        assert_eq!(config.budget, Duration::from_secs(50));
        assert_eq!(config.leeway, Duration::from_secs(24 * 3600));
        assert_eq!(config.batch_size, 400);
    }

    #[test]
    fn test_from_env_defaults() {
        // Without environment variables set, should use defaults
        let config = SweepConfig::from_env();
        assert_eq!(config.batch_size, DEFAULT_SWEEP_BATCH_SIZE);
        let store = StoreConfig::from_env();
        assert_eq!(store.max_cache_ttl, Duration::from_secs(DEFAULT_CACHE_TTL_SECS));
        let retry = RetryConfig::from_env();
        assert_eq!(retry.max_attempts, DEFAULT_TXN_MAX_ATTEMPTS);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let retry = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(retry.validate().is_err());

        let retry = RetryConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(retry.validate().is_err());

        let sweep = SweepConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(sweep.validate().is_err());

        let sweep = SweepConfig {
            leeway: Duration::MAX,
            ..Default::default()
        };
        assert!(sweep.validate().is_err());

        let store = StoreConfig {
            max_cache_ttl: Duration::from_secs(31 * 24 * 3600),
        };
        assert!(store.validate().is_err());
    }

    #[test]
    fn test_cache_ttl_is_clamped() {
        let store = StoreConfig::default();
        assert_eq!(store.effective_cache_ttl(Duration::MAX), Duration::from_secs(3600));
        assert_eq!(store.effective_cache_ttl(Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(store.effective_cache_ttl(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_for(1), Duration::from_millis(10));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(20));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(40));
        assert_eq!(retry.backoff_for(20), Duration::from_secs(1));
        assert_eq!(RetryConfig::immediate(3).backoff_for(5), Duration::ZERO);
    }
}
