//! # attsync-core
//!
//! Core types, configuration, and utilities for attsync.
//!
//! This crate provides the building blocks shared by the other crates:
//! - Error severity (Fatal vs Recoverable)
//! - File categories and their extension allow-lists
//! - Configuration types and environment loading

pub mod config;
pub mod error;
pub mod types;

pub use config::{AppConfig, ConfigError, LogFormat, LoggingConfig, ReconcileConfig, StorageConfig};
pub use error::Severity;
pub use types::{FileCategory, ValidationMode, DEFAULT_DELIMITER, DEFAULT_ROOT_DIR};
