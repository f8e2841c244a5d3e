//! Configuration management for the Hyperlane control plane.
//!
//! Sources are layered, later ones winning:
//! 1. Built-in defaults
//! 2. `config/hyperlane.{toml,yaml,json}` (or an explicit `--config` file)
//! 3. Environment variables prefixed `HYPERLANE__`, nested with `__`
//!    (e.g. `HYPERLANE__RECONCILER__INTERVAL_SECS=10`)
//!
//! A `.env` file in the working directory is loaded first.
//!
//! ```rust,ignore
//! let config = AppConfig::load(None)?;
//! let store = SqliteStateStore::open(&config.store.path, config.store.busy_timeout()).await?;
//! ```

pub mod error;

pub use error::{ConfigError, ConfigResult};

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use crate::agent::AgentEndpointConfig;
pub use crate::logging::LoggingConfig;
pub use crate::report::ReportConfig;
use crate::reconciler::ReconcilerConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    /// Hypervisor agent endpoint and client TLS material.
    #[serde(default)]
    pub agent: AgentEndpointConfig,
    #[serde(default)]
    pub reconciler: ReconcilerSettings,
    /// Report (push) endpoint.
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load and validate configuration.
    ///
    /// `path` replaces the default `config/hyperlane` lookup and must exist.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let config = Self::load_unchecked(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked(path: Option<&Path>) -> ConfigResult<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("config/hyperlane").required(false),
        };

        let config = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("HYPERLANE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Check value ranges. All problems are reported at once.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.store.path.as_os_str().is_empty() {
            errors.push(ConfigError::invalid(
                "store.path is empty",
                "Set HYPERLANE__STORE__PATH to the state database file, e.g. hyperlane.db",
            ));
        }
        if self.agent.endpoint.trim().is_empty() {
            errors.push(ConfigError::invalid(
                "agent.endpoint is empty",
                "Set HYPERLANE__AGENT__ENDPOINT, e.g. https://localhost:50051",
            ));
        }
        if self.reconciler.interval_secs == 0 {
            errors.push(ConfigError::invalid(
                "reconciler.interval_secs must be greater than 0",
                "Set HYPERLANE__RECONCILER__INTERVAL_SECS=5",
            ));
        }
        if self.reconciler.call_timeout_secs == 0 {
            errors.push(ConfigError::invalid(
                "reconciler.call_timeout_secs must be greater than 0",
                "Set HYPERLANE__RECONCILER__CALL_TIMEOUT_SECS=5",
            ));
        }
        if self.reconciler.max_concurrency == 0 {
            errors.push(ConfigError::invalid(
                "reconciler.max_concurrency must be at least 1",
                "Set HYPERLANE__RECONCILER__MAX_CONCURRENCY=4",
            ));
        }
        if self.report.enabled && self.report.listen_addr.trim().is_empty() {
            errors.push(ConfigError::invalid(
                "report.listen_addr is empty while the report endpoint is enabled",
                "Set HYPERLANE__REPORT__LISTEN_ADDR=0.0.0.0:50052 or HYPERLANE__REPORT__ENABLED=false",
            ));
        }

        ConfigError::from_list(errors)
    }
}

/// State store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// How long a writer waits for the database lock, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("hyperlane.db")
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Reconciler settings as they appear in configuration sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_stall_after_secs")]
    pub stall_after_secs: u64,
    #[serde(default)]
    pub refresh_from_agent: bool,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_call_timeout_secs() -> u64 {
    5
}

fn default_max_concurrency() -> usize {
    4
}

fn default_stall_after_secs() -> u64 {
    60
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            stall_after_secs: default_stall_after_secs(),
            refresh_from_agent: false,
        }
    }
}

impl ReconcilerSettings {
    pub fn to_reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: Duration::from_secs(self.interval_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            max_concurrency: self.max_concurrency,
            stall_after: Duration::from_secs(self.stall_after_secs),
            refresh_from_agent: self.refresh_from_agent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: [&str; 3] = [
        "HYPERLANE__RECONCILER__MAX_CONCURRENCY",
        "HYPERLANE__STORE__PATH",
        "HYPERLANE__REPORT__ENABLED",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.path, PathBuf::from("hyperlane.db"));
        assert_eq!(config.agent.endpoint, "https://localhost:50051");

        let reconciler = config.reconciler.to_reconciler_config();
        assert_eq!(reconciler.interval, Duration::from_secs(5));
        assert_eq!(reconciler.max_concurrency, 4);
        assert!(!reconciler.refresh_from_agent);
    }

    #[test]
    fn test_validate_collects_every_problem() {
        let mut config = AppConfig::default();
        config.reconciler.interval_secs = 0;
        config.reconciler.max_concurrency = 0;
        config.agent.endpoint = String::new();

        let err = config.validate().unwrap_err();
        let ConfigError::Multiple(errors) = err else {
            panic!("expected multiple errors");
        };
        assert_eq!(errors.len(), 3);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hyperlane.toml");
        std::fs::write(
            &path,
            "[store]\npath = \"/var/lib/hyperlane/state.db\"\n\n[reconciler]\nmax_concurrency = 2\ninterval_secs = 10\n",
        )
        .unwrap();

        std::env::set_var("HYPERLANE__RECONCILER__MAX_CONCURRENCY", "8");
        std::env::set_var("HYPERLANE__REPORT__ENABLED", "false");
        let config = AppConfig::load(Some(&path)).unwrap();
        clear_env();

        assert_eq!(config.store.path, PathBuf::from("/var/lib/hyperlane/state.db"));
        assert_eq!(config.reconciler.interval_secs, 10);
        assert_eq!(config.reconciler.max_concurrency, 8);
        assert!(!config.report.enabled);
        assert_eq!(config.reconciler.call_timeout_secs, 5);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_fails() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }

    #[test]
    #[serial]
    fn test_invalid_env_value_is_rejected() {
        clear_env();
        std::env::set_var("HYPERLANE__RECONCILER__MAX_CONCURRENCY", "0");
        let result = AppConfig::load(None);
        clear_env();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    }
}
