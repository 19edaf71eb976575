//! Common types used across attsync

use serde::{Deserialize, Serialize};

/// Root of the holding area when nothing else is configured
pub const DEFAULT_ROOT_DIR: &str = "assets";

/// Separator between entries of a delimited attachment list
pub const DEFAULT_DELIMITER: char = '|';

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpeg", "jpg", "svg", "ico", "webp", "gif"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "mov", "webm", "m4v"];
const DOCUMENT_EXTENSIONS: &[&str] = &["pdf", "csv", "html", "json"];

/// Attachment categories, each bound to an extension allow-list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Image,
    Video,
    Document,
}

impl FileCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Document => "document",
        }
    }

    /// Parse a category name, ignoring ASCII case
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "document" | "doc" => Some(Self::Document),
            _ => None,
        }
    }

    /// Allowed extensions, without the leading dot
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Image => IMAGE_EXTENSIONS,
            Self::Video => VIDEO_EXTENSIONS,
            Self::Document => DOCUMENT_EXTENSIONS,
        }
    }
}

impl std::fmt::Display for FileCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether claimed names must pass extension validation before being moved in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Every claimed name is accepted
    #[default]
    Ungated,
    /// Only names valid for the category are moved in
    Gated(FileCategory),
}

impl ValidationMode {
    /// Parse `none` (or empty) as ungated, any category name as gated
    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            return Some(Self::Ungated);
        }
        FileCategory::parse(trimmed).map(Self::Gated)
    }

    pub fn category(&self) -> Option<FileCategory> {
        match self {
            Self::Ungated => None,
            Self::Gated(category) => Some(*category),
        }
    }
}
