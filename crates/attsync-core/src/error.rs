//! Error severity shared across attsync crates
//!
//! Every failure raised while reconciling a directory is classified as either
//! fatal or recoverable. Only a fatal failure of the call itself (the target
//! directory cannot be created) surfaces to the caller as an error; everything
//! else is logged and absorbed.

use serde::{Deserialize, Serialize};

/// Severity of a failed file operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// The operation could not land its result
    Fatal,
    /// Logged and skipped; the rest of the batch is unaffected
    Recoverable,
}

impl Severity {
    /// Numeric code carried in log records (1 = fatal, 2 = recoverable)
    pub fn code(&self) -> u16 {
        match self {
            Severity::Fatal => 1,
            Severity::Recoverable => 2,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Severity::Fatal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Fatal => "fatal",
            Severity::Recoverable => "recoverable",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
