//! Runner configuration
//!
//! Retry policy, local directories and the container runtime used by the
//! in-process pipeline runner.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

/// Runner configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerConfig {
    /// Maximum number of times a retryable task failure will be retried.
    pub max_retries: u32,

    /// Base delay for exponential back-off between retries.
    pub retry_base_delay: Duration,

    /// Scoped task working directories are created under this root.
    pub work_root: PathBuf,

    /// Each bucket of the local object store is a directory under this root.
    pub object_root: PathBuf,

    /// Container CLI (`podman` or `docker`).
    pub container_runtime: String,
}

impl RunnerConfig {
    /// Creates configuration from environment variables
    ///
    /// Expected environment variables (all optional):
    /// - INGEST_MAX_RETRIES (default: 3)
    /// - INGEST_RETRY_BASE_DELAY_MS (default: 100)
    /// - INGEST_WORK_ROOT (default: ./work)
    /// - INGEST_OBJECT_ROOT (default: ./buckets)
    /// - INGEST_CONTAINER_RUNTIME (default: podman)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let max_retries = match lookup("INGEST_MAX_RETRIES") {
            Some(raw) => raw
                .parse::<u32>()
                .with_context(|| {
                    format!("INGEST_MAX_RETRIES must be a non-negative integer, got '{raw}'")
                })?,
            None => defaults.max_retries,
        };

        let retry_base_delay = match lookup("INGEST_RETRY_BASE_DELAY_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_millis)
                .with_context(|| {
                    format!("INGEST_RETRY_BASE_DELAY_MS must be milliseconds, got '{raw}'")
                })?,
            None => defaults.retry_base_delay,
        };

        Ok(Self {
            max_retries,
            retry_base_delay,
            work_root: lookup("INGEST_WORK_ROOT").map(PathBuf::from).unwrap_or(defaults.work_root),
            object_root: lookup("INGEST_OBJECT_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.object_root),
            container_runtime: lookup("INGEST_CONTAINER_RUNTIME")
                .unwrap_or(defaults.container_runtime),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.work_root.as_os_str().is_empty() {
            anyhow::bail!("work_root cannot be empty");
        }

        if self.object_root.as_os_str().is_empty() {
            anyhow::bail!("object_root cannot be empty");
        }

        if self.container_runtime.trim().is_empty() {
            anyhow::bail!("container_runtime cannot be empty");
        }

        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            work_root: PathBuf::from("./work"),
            object_root: PathBuf::from("./buckets"),
            container_runtime: "podman".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay, Duration::from_millis(100));
        assert_eq!(config.container_runtime, "podman");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = RunnerConfig::from_lookup(lookup(&[
            ("INGEST_MAX_RETRIES", "0"),
            ("INGEST_RETRY_BASE_DELAY_MS", "5"),
            ("INGEST_CONTAINER_RUNTIME", "docker"),
            ("INGEST_OBJECT_ROOT", "/srv/buckets"),
        ]))
        .unwrap();
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.retry_base_delay, Duration::from_millis(5));
        assert_eq!(config.container_runtime, "docker");
        assert_eq!(config.object_root, PathBuf::from("/srv/buckets"));
        assert_eq!(config.work_root, PathBuf::from("./work"));
    }

    #[test]
    fn test_unparsable_values_are_errors() {
        assert!(RunnerConfig::from_lookup(lookup(&[("INGEST_MAX_RETRIES", "many")])).is_err());
        let negative_delay = lookup(&[("INGEST_RETRY_BASE_DELAY_MS", "-1")]);
        assert!(RunnerConfig::from_lookup(negative_delay).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = RunnerConfig::default();
        config.container_runtime = " ".into();
        assert!(config.validate().is_err());

        config.container_runtime = "docker".into();
        config.work_root = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let config = RunnerConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(4), Duration::from_millis(800));
    }
}
