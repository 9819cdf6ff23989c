// src/utils/config.rs
//! Engine configuration
//!
//! Loaded from an optional file (any format the `config` crate recognises by
//! extension) layered under `SENTRA__`-prefixed environment variables, e.g.
//! `SENTRA__INTERRUPT__SEND_TIMEOUT_MS=250`. Every field has a default, so
//! an empty configuration is valid.

use crate::utils::errors::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SENTRA";

/// Deployment mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Deployment mode (production turns on trace auto-archive)
    pub mode: Mode,

    /// Interrupt controller settings
    pub interrupt: InterruptConfig,

    /// Batch scheduler settings
    pub batch: BatchConfig,

    /// Trace backend settings
    pub trace: TraceConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

/// Interrupt controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptConfig {
    /// Mailbox capacity (default: 10)
    pub queue_capacity: usize,

    /// How long `send_signal` waits on a full mailbox (default: 500ms)
    pub send_timeout_ms: u64,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            send_timeout_ms: 500,
        }
    }
}

impl InterruptConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Batch scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Progress queue capacity (default: 1000)
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
        }
    }
}

/// Trace backend settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TraceConfig {
    /// `local`, `store`, or empty (local)
    pub driver: String,

    /// Store id, required by the `store` driver
    pub store: Option<String>,

    /// Key prefix inside the store
    pub prefix: Option<String>,

    /// Directory used by the `local` driver
    pub path: Option<String>,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl EngineConfig {
    /// Load from an optional file plus `SENTRA__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Load using a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.mode == Mode::Production
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.interrupt.queue_capacity, 10);
        assert_eq!(config.interrupt.send_timeout(), Duration::from_millis(500));
        assert_eq!(config.batch.queue_capacity, 1000);
        assert!(!config.is_production());
        assert!(config.trace.driver.is_empty());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"mode": "production", "interrupt": {{"send_timeout_ms": 250}}, "trace": {{"driver": "store", "store": "traces"}}}}"#
        )
        .unwrap();

        let config =
            EngineConfig::load_with_prefix(Some(file.path()), "SENTRA_TEST_UNSET").unwrap();
        assert!(config.is_production());
        assert_eq!(config.interrupt.send_timeout_ms, 250);
        assert_eq!(config.interrupt.queue_capacity, 10);
        assert_eq!(config.trace.driver, "store");
        assert_eq!(config.trace.store.as_deref(), Some("traces"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = EngineConfig::load_with_prefix(Some(&path), "SENTRA_TEST_UNSET").unwrap();
        assert_eq!(config.batch.queue_capacity, 1000);
    }
}
