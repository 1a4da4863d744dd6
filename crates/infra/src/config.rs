//! Relay configuration loaded from environment variables.

use std::time::Duration;

use crate::jobs::{RetryPolicy, WorkerPoolConfig};

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got '{value}'")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Core relay configuration.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub database_url: String,
    /// Worker slots (W).
    pub workers: usize,
    /// Maximum stored jobs, all statuses.
    pub max_outstanding: usize,
    pub max_retries: u32,
    /// Base delay before a requeued job may be claimed again; zero requeues immediately.
    pub retry_base_delay: Duration,
    /// How long `enqueue` waits for capacity before giving up.
    pub enqueue_wait: Duration,
    pub idle_wait: Duration,
    pub dispatch_interval: Duration,
    /// Default per-task timeout, overridable per task.
    pub task_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Terminal records older than this are swept.
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://docrelay.db".to_string(),
            workers: 4,
            max_outstanding: 100,
            max_retries: 3,
            retry_base_delay: Duration::ZERO,
            enqueue_wait: Duration::from_secs(30),
            idle_wait: Duration::from_millis(500),
            dispatch_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(30),
            retention: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

impl RelayConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                          | Default                |
    /// |----------------------------------|------------------------|
    /// | `DOCRELAY_DATABASE_URL`          | `sqlite://docrelay.db` |
    /// | `DOCRELAY_WORKERS`               | `4`                    |
    /// | `DOCRELAY_MAX_OUTSTANDING`       | `100`                  |
    /// | `DOCRELAY_MAX_RETRIES`           | `3`                    |
    /// | `DOCRELAY_RETRY_BASE_DELAY_MS`   | `0`                    |
    /// | `DOCRELAY_ENQUEUE_WAIT_SECS`     | `30`                   |
    /// | `DOCRELAY_IDLE_WAIT_MS`          | `500`                  |
    /// | `DOCRELAY_DISPATCH_INTERVAL_MS`  | `1000`                 |
    /// | `DOCRELAY_TASK_TIMEOUT_SECS`     | `120`                  |
    /// | `DOCRELAY_SHUTDOWN_GRACE_SECS`   | `30`                   |
    /// | `DOCRELAY_RETENTION_HOURS`       | `24`                   |
    /// | `DOCRELAY_CLEANUP_INTERVAL_SECS` | `3600`                 |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let num = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(key) {
                None => Ok(default),
                Some(raw) if raw.trim().is_empty() => Ok(default),
                Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    key,
                    value: raw,
                    expected: "a non-negative integer",
                }),
            }
        };
        let positive = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match num(key, default)? {
                0 => Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                    expected: "greater than zero",
                }),
                n => Ok(n),
            }
        };

        let retention_hours = positive("DOCRELAY_RETENTION_HOURS", 24)?;
        let retention_secs = retention_hours
            .checked_mul(3600)
            .ok_or_else(|| ConfigError::Invalid {
                key: "DOCRELAY_RETENTION_HOURS",
                value: retention_hours.to_string(),
                expected: "a number of hours that fits in a duration",
            })?;

        Ok(Self {
            database_url: lookup("DOCRELAY_DATABASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.database_url),
            workers: positive("DOCRELAY_WORKERS", defaults.workers as u64)? as usize,
            max_outstanding: positive("DOCRELAY_MAX_OUTSTANDING", defaults.max_outstanding as u64)?
                as usize,
            max_retries: u32::try_from(num("DOCRELAY_MAX_RETRIES", defaults.max_retries.into())?)
                .map_err(|_| ConfigError::Invalid {
                    key: "DOCRELAY_MAX_RETRIES",
                    value: lookup("DOCRELAY_MAX_RETRIES").unwrap_or_default(),
                    expected: "a 32-bit integer",
                })?,
            retry_base_delay: Duration::from_millis(num("DOCRELAY_RETRY_BASE_DELAY_MS", 0)?),
            enqueue_wait: Duration::from_secs(num("DOCRELAY_ENQUEUE_WAIT_SECS", 30)?),
            idle_wait: Duration::from_millis(positive("DOCRELAY_IDLE_WAIT_MS", 500)?),
            dispatch_interval: Duration::from_millis(positive(
                "DOCRELAY_DISPATCH_INTERVAL_MS",
                1000,
            )?),
            task_timeout: Duration::from_secs(positive("DOCRELAY_TASK_TIMEOUT_SECS", 120)?),
            shutdown_grace: Duration::from_secs(num("DOCRELAY_SHUTDOWN_GRACE_SECS", 30)?),
            retention: Duration::from_secs(retention_secs),
            cleanup_interval: Duration::from_secs(positive(
                "DOCRELAY_CLEANUP_INTERVAL_SECS",
                3600,
            )?),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        if self.retry_base_delay.is_zero() {
            RetryPolicy::immediate(self.max_retries)
        } else {
            RetryPolicy::exponential(
                self.max_retries,
                self.retry_base_delay,
                Duration::from_secs(300).max(self.retry_base_delay),
            )
        }
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_workers(self.workers)
            .with_idle_wait(self.idle_wait)
            .with_shutdown_grace(self.shutdown_grace)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(load(&[]).unwrap(), RelayConfig::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("DOCRELAY_DATABASE_URL", "sqlite::memory:"),
            ("DOCRELAY_WORKERS", "8"),
            ("DOCRELAY_MAX_RETRIES", "0"),
            ("DOCRELAY_RETRY_BASE_DELAY_MS", "250"),
            ("DOCRELAY_RETENTION_HOURS", "2"),
            ("DOCRELAY_ENQUEUE_WAIT_SECS", " 5 "),
        ])
        .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.workers, 8);
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.retention, Duration::from_secs(7200));
        assert_eq!(config.enqueue_wait, Duration::from_secs(5));

        let policy = config.retry_policy();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(250));
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = load(&[("DOCRELAY_WORKERS", "many")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "DOCRELAY_WORKERS must be a non-negative integer, got 'many'"
        );
        assert!(load(&[("DOCRELAY_WORKERS", "0")]).is_err());
        assert!(load(&[("DOCRELAY_MAX_RETRIES", "99999999999")]).is_err());
    }

    #[test]
    fn oversized_retention_is_an_error() {
        let err = load(&[("DOCRELAY_RETENTION_HOURS", "18446744073709551615")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: "DOCRELAY_RETENTION_HOURS", .. }
        ));
        assert!(load(&[("DOCRELAY_RETENTION_HOURS", "8760")]).is_ok());
    }

    #[test]
    fn zero_base_delay_requeues_immediately() {
        let policy = RelayConfig::default().retry_policy();
        assert_eq!(policy.delay_for_attempt(3), Duration::ZERO);
        assert_eq!(policy.max_retries, 3);
    }
}
