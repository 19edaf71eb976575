//! Extension validation and claim-string helpers

use std::path::Path;

use attsync_core::{FileCategory, ValidationMode};

use crate::model::join_delimited;

/// True iff `name` ends in `.<ext>` for one of the category's extensions.
///
/// Matching is case-sensitive: `photo.PNG` is not an image.
pub fn is_valid_extension(name: &str, category: FileCategory) -> bool {
    category.extensions().iter().any(|ext| {
        name.strip_suffix(ext)
            .map_or(false, |rest| rest.ends_with('.'))
    })
}

/// Whether a claimed name may be moved in under the given mode
pub fn admits(mode: ValidationMode, name: &str) -> bool {
    match mode {
        ValidationMode::Ungated => true,
        ValidationMode::Gated(category) => is_valid_extension(name, category),
    }
}

/// Keep only the names valid for `category`
pub fn filter_by_category<I, S>(names: I, category: FileCategory) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .filter(|n| is_valid_extension(n.as_ref(), category))
        .map(|n| n.as_ref().to_string())
        .collect()
}

/// Filter the entries of a delimited string.
///
/// Images and videos are filtered by extension; documents are accepted as
/// submitted.
pub fn filter_delimited(s: &str, category: FileCategory, delimiter: char) -> String {
    if s.is_empty() {
        return String::new();
    }
    if category == FileCategory::Document {
        return s.to_string();
    }

    join_delimited(&filter_by_category(s.split(delimiter), category), delimiter)
}

/// First entry of a delimited string, for single-attachment fields
pub fn first_entry(s: &str, delimiter: char) -> &str {
    s.split(delimiter).next().unwrap_or(s)
}

/// Full extension of the basename, including the leading dot.
///
/// Everything after the first dot counts: `report.tar.gz` gives `.tar.gz`.
pub fn extract_file_ext(s: &str) -> String {
    let base = Path::new(s)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    match base.split_once('.') {
        Some((_, ext)) => format!(".{}", ext),
        None => String::new(),
    }
}
