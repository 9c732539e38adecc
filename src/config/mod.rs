//! # Jobtree Configuration System
//!
//! Every section has working defaults, so an empty file (or no file at all) yields a
//! usable in-memory configuration.
//!
//! ```toml
//! [store]
//! backend = "fjall"
//! path = "/var/lib/jobtree"
//!
//! [orchestration]
//! step_retry_attempts = 3
//! ```
//!
//! ```rust,no_run
//! use jobtree_core::config::JobtreeConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = JobtreeConfig::load("config/jobtree.toml")?;
//! assert!(config.orchestration.step_retry_attempts >= 1);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use crate::events::EventBusConfig;
use crate::resilience::BackoffPolicy;
use crate::store::StoreRetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobtreeConfig {
    pub store: StoreConfig,
    pub events: EventsConfig,
    pub orchestration: OrchestrationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Fjall,
}

/// Durable job store settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Keyspace directory, required for the fjall backend
    pub path: Option<PathBuf>,
    /// fsync after every committed write
    pub sync_writes: bool,
    pub retry: StoreRetryPolicy,
}

/// Event bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Bound for each subscriber queue; unset means unbounded
    pub subscriber_queue_capacity: Option<usize>,
    pub stream_capacity: usize,
    /// Publish `job.log` for debug entries; they are stored either way
    pub publish_debug_logs: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        let bus = EventBusConfig::default();
        Self {
            subscriber_queue_capacity: bus.subscriber_queue_capacity,
            stream_capacity: bus.stream_capacity,
            publish_debug_logs: false,
        }
    }
}

impl EventsConfig {
    pub fn bus_config(&self) -> EventBusConfig {
        EventBusConfig {
            subscriber_queue_capacity: self.subscriber_queue_capacity,
            stream_capacity: self.stream_capacity,
        }
    }
}

/// Orchestrator and job manager tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Total dispatch attempts for steps with `on_error = "retry"`
    pub step_retry_attempts: u32,
    pub step_retry_backoff: BackoffPolicy,
    /// How often waiters re-read the store while waiting for a terminal status
    pub wait_poll_interval_ms: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            step_retry_attempts: 3,
            step_retry_backoff: BackoffPolicy {
                first: Duration::from_millis(100),
                max: Duration::from_secs(5),
                factor: 2.0,
                jitter: false,
            },
            wait_poll_interval_ms: 250,
        }
    }
}

impl OrchestrationConfig {
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; the environment default applies when unset
    pub level: Option<String>,
    pub json: bool,
}

impl JobtreeConfig {
    /// Load `path` (optional) layered under `JOBTREE__*` environment variables
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        loader::load_from_path(path.as_ref())
    }

    pub fn from_env() -> ConfigResult<Self> {
        loader::load_from_env()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.store.backend == StoreBackend::Fjall && self.store.path.is_none() {
            return Err(ConfigurationError::invalid(
                "store.path",
                "required when store.backend = \"fjall\"",
            ));
        }
        if self.store.retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid(
                "store.retry.max_attempts",
                "must be at least 1",
            ));
        }
        if self.orchestration.step_retry_attempts == 0 {
            return Err(ConfigurationError::invalid(
                "orchestration.step_retry_attempts",
                "must be at least 1",
            ));
        }
        if self.orchestration.wait_poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid(
                "orchestration.wait_poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.events.stream_capacity == 0 {
            return Err(ConfigurationError::invalid(
                "events.stream_capacity",
                "must be greater than zero",
            ));
        }
        for (field, backoff) in [
            ("store.retry.backoff", &self.store.retry.backoff),
            ("orchestration.step_retry_backoff", &self.orchestration.step_retry_backoff),
        ] {
            if !backoff.factor.is_finite() || backoff.factor < 1.0 {
                return Err(ConfigurationError::invalid(field, "factor must be >= 1.0"));
            }
            if backoff.first > backoff.max {
                return Err(ConfigurationError::invalid(field, "first_ms exceeds max_ms"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = JobtreeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_fjall_requires_path() {
        let mut config = JobtreeConfig::default();
        config.store.backend = StoreBackend::Fjall;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::Invalid { .. })
        ));
        config.store.path = Some(PathBuf::from("/tmp/jobtree"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml_file_with_partial_sections() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[orchestration]\nstep_retry_attempts = 5\n\n[orchestration.step_retry_backoff]\nfirst_ms = 10\n\n[logging]\njson = true"
        )
        .unwrap();

        let config = JobtreeConfig::load(file.path()).unwrap();
        assert_eq!(config.orchestration.step_retry_attempts, 5);
        assert!(!config.events.publish_debug_logs);
        assert_eq!(
            config.orchestration.step_retry_backoff.first,
            Duration::from_millis(10)
        );
        assert!(config.logging.json);
        assert_eq!(config.store, StoreConfig::default());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = JobtreeConfig::load("/nonexistent/jobtree.toml").unwrap();
        assert_eq!(config.orchestration, OrchestrationConfig::default());
    }

    #[test]
    fn test_rejects_zero_retry_attempts() {
        let mut config = JobtreeConfig::default();
        config.orchestration.step_retry_attempts = 0;
        assert!(config.validate().is_err());
    }
}
