//! Configuration loading and schema definitions for poolrun.
//!
//! This module provides types and functions for loading poolrun
//! configuration from TOML files or strings, plus [`ConfigError`], the error
//! raised for every problem that must stop a run before scheduling starts.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

use crate::registry::ExtensionPoint;

/// A configuration problem detected before any test is scheduled.
///
/// Every variant is fatal: no partial run happens.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A plugin identifier is not of the form `namespace.name`.
    #[error("malformed {point} identifier '{id}'")]
    MalformedIdentifier { point: ExtensionPoint, id: String },

    /// No plugin is registered under the identifier.
    #[error("unknown {point} '{id}'")]
    UnknownPlugin { point: ExtensionPoint, id: String },

    /// A plugin factory rejected its parameters.
    #[error("failed to instantiate {point} '{id}': {source}")]
    Plugin {
        point: ExtensionPoint,
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The pooling strategy could not place a device.
    #[error("no pool-partitioning strategy matched device {device}")]
    NoPoolMatched { device: String },

    /// Pooling produced no pools at all.
    #[error("no device pools: {0}")]
    NoPools(String),

    /// Two devices reported the same serial.
    #[error("duplicate device serial {0}")]
    DuplicateDevice(String),

    /// A test cannot run on any device of its pool.
    #[error("{test} has no device with a compatible backend in pool {pool}")]
    NoCompatibleDevice { pool: String, test: String },

    /// Any other invalid setting.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Checks settings that do not involve plugin resolution.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.backends.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one backend must be configured".to_string(),
            ));
        }
        if self.run.output_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "run.output_timeout_secs must be positive".to_string(),
            ));
        }
        if let PoolingConfig::Capability { buckets: 0, .. } = self.pooling {
            return Err(ConfigError::Invalid(
                "pooling.buckets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads poolrun configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or does
/// not match the schema.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads poolrun configuration from a TOML string.
///
/// # Example
///
/// ```
/// use poolrun::config::{load_config_str, PoolingConfig};
///
/// let config = load_config_str(r#"
///     [devices]
///     type = "builtin.static"
///     devices = [{ serial = "a" }]
///
///     [pooling]
///     strategy = "per-device"
///
///     [suite]
///     type = "inline"
/// "#)?;
///
/// assert_eq!(config.pooling, PoolingConfig::PerDevice);
/// assert_eq!(config.backends[0].kind, "builtin.dry-run");
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
