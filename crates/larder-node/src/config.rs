//! Node configuration.
//!
//! Layered from built-in defaults, then an optional YAML or TOML file, then
//! environment variables prefixed with `LARDER__` using `__` as the nesting
//! separator, e.g. `LARDER__STORAGE__CAPACITY__THRESHOLD=500`.

use crate::observability::LogFormat;
use anyhow::Context;
use larder_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::{Validate, ValidationError};

/// Configuration for the Larder node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LarderConfig {
    /// Storage tier settings.
    #[validate(nested)]
    pub storage: StorageConfig,
    /// Logging settings.
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[validate(custom(function = "validate_level"))]
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

fn validate_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("unknown_log_level")),
    }
}

impl LarderConfig {
    /// Loads the layered configuration. A given `path` must exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&LarderConfig::default())
                .context("failed to encode default configuration")?,
        );
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let loaded: LarderConfig = builder
            .add_source(
                config::Environment::with_prefix("LARDER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("failed to parse configuration")?;

        loaded
            .validate()
            .context("configuration failed validation")?;
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        LarderConfig::default().validate().unwrap();
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("larder.yaml");
        std::fs::write(
            &path,
            "storage:\n  capacity:\n    max_capacity: 60\n    threshold: 50\n  migration:\n    max_batch_size: 5\nlogging:\n  format: json\n",
        )
        .unwrap();

        let config = LarderConfig::load(Some(&path)).unwrap();

        assert_eq!(config.storage.capacity.threshold, 50);
        assert_eq!(config.storage.capacity.max_capacity, 60);
        assert_eq!(config.storage.migration.max_batch_size, 5);
        assert_eq!(config.storage.capacity.hysteresis, 0.8);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn inconsistent_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("larder.toml");
        std::fs::write(
            &path,
            "[storage.capacity]\nmax_capacity = 10\nthreshold = 20\n",
        )
        .unwrap();

        assert!(LarderConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LarderConfig::load(Some(&dir.path().join("absent.yaml"))).is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let mut config = LarderConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }
}
