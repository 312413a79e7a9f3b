//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! for shmslot applications, and the tunable bounds of the attach protocol.
//!
//! # Usage
//!
//! ```rust,no_run
//! use shmslot_common::config::{ConfigLoader, SharedConfig, StoreOptions, ConfigError};
//! use serde::Deserialize;
//! use std::path::Path;
//!
//! #[derive(Debug, Deserialize)]
//! struct MyAppConfig {
//!     shared: SharedConfig,
//!     #[serde(default)]
//!     store: StoreOptions,
//! }
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = MyAppConfig::load(Path::new("config.toml"))?;
//!     config.store.validate()?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_READY_POLL_MS, DEFAULT_READY_TIMEOUT_MS,
    DEFAULT_RETRY_BACKOFF_MS,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields shared across shmslot applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "shmslot-ctl"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Tunable bounds of the attach-or-create protocol.
///
/// Every field has a compiled-in default; a TOML `[store]` table only needs
/// the keys it overrides.
///
/// ```toml
/// [store]
/// ready_timeout_ms = 500
/// huge_pages = false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Upper bound on waiting for a peer's readiness marker.
    pub ready_timeout_ms: u64,
    /// Sleep between readiness polls.
    pub ready_poll_ms: u64,
    /// Join/create rounds before reporting contention.
    pub max_attempts: u32,
    /// Sleep after losing the exclusive-creation race.
    pub retry_backoff_ms: u64,
    /// Ask for `MAP_HUGETLB` mappings (always falls back to ordinary pages).
    pub huge_pages: bool,
    /// Refuse to run unless the effective uid is root.
    pub require_root: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            ready_poll_ms: DEFAULT_READY_POLL_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            huge_pages: true,
            require_root: true,
        }
    }
}

impl StoreOptions {
    /// Readiness wait bound.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Readiness poll interval.
    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }

    /// Backoff after a lost creation race.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Builder-style override of the readiness timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder-style override of the root requirement.
    pub fn with_require_root(mut self, require_root: bool) -> Self {
        self.require_root = require_root;
        self
    }

    /// Builder-style override of the huge-page request.
    pub fn with_huge_pages(mut self, huge_pages: bool) -> Self {
        self.huge_pages = huge_pages;
        self
    }

    /// Validate the bounds.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `ready_timeout_ms`, `ready_poll_ms` or `max_attempts` is zero
    /// - `ready_poll_ms` exceeds `ready_timeout_ms`
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ready_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "ready_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.ready_poll_ms == 0 {
            return Err(ConfigError::ValidationError(
                "ready_poll_ms must be greater than zero".to_string(),
            ));
        }
        if self.ready_poll_ms > self.ready_timeout_ms {
            return Err(ConfigError::ValidationError(format!(
                "ready_poll_ms ({}) exceeds ready_timeout_ms ({})",
                self.ready_poll_ms, self.ready_timeout_ms
            )));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_attempts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Any serde-deserializable struct can be loaded.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_log_level_default() {
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_log_level_deserialization() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct TestWrapper {
            level: LogLevel,
        }

        for (raw, expected) in [
            ("trace", LogLevel::Trace),
            ("debug", LogLevel::Debug),
            ("info", LogLevel::Info),
            ("warn", LogLevel::Warn),
            ("error", LogLevel::Error),
        ] {
            let parsed: TestWrapper = toml::from_str(&format!("level = \"{raw}\"")).unwrap();
            assert_eq!(parsed.level, expected);
            assert_eq!(expected.as_directive(), raw);
        }
    }

    #[test]
    fn test_shared_config_validation_empty_service_name() {
        let config = SharedConfig {
            log_level: LogLevel::Info,
            service_name: "".to_string(),
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_store_options_defaults() {
        let options = StoreOptions::default();
        assert_eq!(options.ready_timeout(), Duration::from_secs(2));
        assert_eq!(options.ready_poll(), Duration::from_millis(1));
        assert_eq!(options.max_attempts, 3);
        assert_eq!(options.retry_backoff(), Duration::from_millis(10));
        assert!(options.huge_pages);
        assert!(options.require_root);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_store_options_rejects_unbounded_waits() {
        let mut options = StoreOptions::default();
        options.ready_timeout_ms = 0;
        assert!(options.validate().is_err());

        let mut options = StoreOptions::default();
        options.max_attempts = 0;
        assert!(options.validate().is_err());

        let mut options = StoreOptions::default();
        options.ready_poll_ms = 5_000;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_store_options_builders() {
        let options = StoreOptions::default()
            .with_ready_timeout(Duration::from_millis(150))
            .with_require_root(false)
            .with_huge_pages(false);
        assert_eq!(options.ready_timeout_ms, 150);
        assert!(!options.require_root);
        assert!(!options.huge_pages);
    }

    #[test]
    fn test_config_loader_file_not_found() {
        let result = StoreOptions::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound)));
    }

    #[test]
    fn test_config_loader_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "invalid toml {{{{").unwrap();

        let result = StoreOptions::load(file.path());
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_config_loader_partial_store_table() {
        #[derive(Debug, Deserialize)]
        struct TestConfig {
            shared: SharedConfig,
            #[serde(default)]
            store: StoreOptions,
        }

        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[shared]
log_level = "debug"
service_name = "test-service"

[store]
ready_timeout_ms = 250
require_root = false
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = TestConfig::load(file.path()).unwrap();
        assert_eq!(config.shared.log_level, LogLevel::Debug);
        assert_eq!(config.store.ready_timeout_ms, 250);
        assert!(!config.store.require_root);
        // untouched keys keep their defaults
        assert_eq!(config.store.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(config.store.huge_pages);
    }
}
