//! Configuration types and loading
//!
//! Configuration is resolved once at startup and passed into services; library
//! code never reads the environment while handling a call.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::{ValidationMode, DEFAULT_DELIMITER, DEFAULT_ROOT_DIR};

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    /// Holding area and committed directory layout
    pub storage: StorageConfig,

    /// Reconciliation behaviour
    pub reconcile: ReconcileConfig,

    /// Log output
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Fixed root of the holding area; committed directories live beneath it
    pub root_dir: PathBuf,
    /// Permission bits for directories created on first use (Unix only)
    pub dir_mode: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            dir_mode: 0o755,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    /// Default gating mode for claimed names
    pub validation: ValidationMode,
    /// Number of planned operations executed at once
    pub concurrency: usize,
    /// Separator for delimited claim strings
    pub delimiter: char,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            validation: ValidationMode::Ungated,
            concurrency: 1,
            delimiter: DEFAULT_DELIMITER,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Filter directive used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            default_filter: "info,attsync_attachments=debug".to_string(),
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup, starting from defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Storage
        if let Some(root) = lookup("ATTSYNC_ROOT_DIR") {
            if root.trim().is_empty() {
                return Err(ConfigError::invalid("ATTSYNC_ROOT_DIR", "must not be empty"));
            }
            config.storage.root_dir = PathBuf::from(root);
        }
        if let Some(mode) = lookup("ATTSYNC_DIR_MODE") {
            config.storage.dir_mode = u32::from_str_radix(mode.trim(), 8)
                .map_err(|e| ConfigError::invalid("ATTSYNC_DIR_MODE", e.to_string()))?;
        }

        // Reconcile
        if let Some(mode) = lookup("ATTSYNC_VALIDATE") {
            config.reconcile.validation = ValidationMode::parse(&mode).ok_or_else(|| {
                ConfigError::invalid(
                    "ATTSYNC_VALIDATE",
                    format!("unknown category '{}', expected none, image, video or document", mode),
                )
            })?;
        }
        if let Some(n) = lookup("ATTSYNC_CONCURRENCY") {
            let n: usize = n
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| {
                    ConfigError::invalid("ATTSYNC_CONCURRENCY", e.to_string())
                })?;
            if n == 0 {
                return Err(ConfigError::invalid("ATTSYNC_CONCURRENCY", "must be at least 1"));
            }
            config.reconcile.concurrency = n;
        }
        if let Some(delim) = lookup("ATTSYNC_DELIMITER") {
            let mut chars = delim.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c != '/' => config.reconcile.delimiter = c,
                _ => {
                    return Err(ConfigError::invalid(
                        "ATTSYNC_DELIMITER",
                        "must be a single character other than '/'",
                    ))
                }
            }
        }

        // Logging
        if let Some(format) = lookup("ATTSYNC_LOG_FORMAT") {
            config.logging.format = match format.trim().to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" | "" => LogFormat::Pretty,
                other => {
                    return Err(ConfigError::invalid(
                        "ATTSYNC_LOG_FORMAT",
                        format!("unknown format '{}'", other),
                    ))
                }
            };
        }

        Ok(config)
    }
}
