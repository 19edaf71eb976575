//! Attachment Model
//!
//! Claimed and committed attachment sets, and the operations that converge one
//! onto the other.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};

use serde::{Deserialize, Serialize};

/// Reduce a reference to its final path segment.
///
/// Returns `None` for references that do not name a file: empty input, a
/// trailing slash, or a `.`/`..` segment.
pub fn normalize_name(raw: &str) -> Option<&str> {
    let name = raw.rsplit('/').next().unwrap_or(raw);
    match name {
        "" | "." | ".." => None,
        _ => Some(name),
    }
}

/// Normalized set of names the client wants attached
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimSet {
    names: BTreeSet<String>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw references, dropping the ones that do not normalize
    pub fn from_refs<I, R>(refs: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: AsRef<str>,
    {
        let names = refs
            .into_iter()
            .filter_map(|r| normalize_name(r.as_ref()).map(str::to_string))
            .collect();
        Self { names }
    }

    /// Build from a delimited string such as `a.png|uploads/b.png`
    pub fn from_delimited(s: &str, delimiter: char) -> Self {
        Self::from_refs(s.split(delimiter))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Drop a name; true if it was claimed
    pub fn remove(&mut self, name: &str) -> bool {
        self.names.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Names physically present in a target directory when a call starts.
///
/// Names are kept as the filesystem reports them, so entries that are not
/// valid UTF-8 can still be deleted. Such a name never matches a claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedSet {
    names: BTreeSet<OsString>,
}

impl CommittedSet {
    pub fn from_names<I, N>(names: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<OsString>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(OsStr::new(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OsStr> {
        self.names.iter().map(OsString::as_os_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// What a target directory looked like before planning
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryState {
    /// The directory did not exist and has to be bootstrapped
    Absent,
    Present(CommittedSet),
}

impl DirectoryState {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Whether `name` is already committed
    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::Absent => false,
            Self::Present(committed) => committed.contains(name),
        }
    }
}

/// One unit of convergence work
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "name", rename_all = "snake_case")]
pub enum Operation {
    /// Move a file from the holding area into the target directory
    MoveIn(String),
    /// Delete a committed file the client no longer claims
    DeleteOut(OsString),
}

impl Operation {
    /// The file name, lossily converted when it is not UTF-8
    pub fn name(&self) -> Cow<'_, str> {
        match self {
            Self::MoveIn(name) => Cow::Borrowed(name.as_str()),
            Self::DeleteOut(name) => name.to_string_lossy(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MoveIn(_) => "move_in",
            Self::DeleteOut(_) => "delete_out",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.name())
    }
}

/// An attachment list in either of the two shapes callers submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Claim {
    /// Entries joined by a delimiter (`a.png|b.png`)
    Delimited(String),
    List(Vec<String>),
}

impl Claim {
    pub fn to_claim_set(&self, delimiter: char) -> ClaimSet {
        match self {
            Self::Delimited(s) => ClaimSet::from_delimited(s, delimiter),
            Self::List(items) => ClaimSet::from_refs(items),
        }
    }

    /// Render `files` in the same shape as this claim
    pub fn render_like(&self, files: Vec<String>, delimiter: char) -> Claim {
        match self {
            Self::Delimited(_) => Self::Delimited(join_delimited(&files, delimiter)),
            Self::List(_) => Self::List(files),
        }
    }
}

/// Join entries into a delimited string
pub fn join_delimited<S: AsRef<str>>(entries: &[S], delimiter: char) -> String {
    let mut out = String::new();
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            out.push(delimiter);
        }
        out.push_str(entry.as_ref());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("photo.png"), Some("photo.png"));
        assert_eq!(normalize_name("uploads/2024/img1.png"), Some("img1.png"));
        assert_eq!(normalize_name(""), None);
        assert_eq!(normalize_name("uploads/"), None);
        assert_eq!(normalize_name("a/.."), None);
        assert_eq!(normalize_name("."), None);
    }

    #[test]
    fn test_claim_set_collapses_duplicates() {
        let claims = ClaimSet::from_refs(["a.png", "x/a.png", "b.png", "", "dir/"]);
        assert_eq!(claims.len(), 2);
        assert!(claims.contains("a.png"));
        assert!(claims.contains("b.png"));
        assert_eq!(claims.iter().collect::<Vec<_>>(), vec!["a.png", "b.png"]);
    }

    #[test]
    fn test_claim_set_from_delimited() {
        let claims = ClaimSet::from_delimited("dir/a.png|b.png||", '|');
        assert_eq!(claims.iter().collect::<Vec<_>>(), vec!["a.png", "b.png"]);

        assert!(ClaimSet::from_delimited("", '|').is_empty());
    }

    #[test]
    fn test_claim_render_like() {
        let files = vec!["d/a.png".to_string(), "d/b.png".to_string()];

        let delimited = Claim::Delimited(String::new()).render_like(files.clone(), '|');
        assert_eq!(delimited, Claim::Delimited("d/a.png|d/b.png".to_string()));

        let list = Claim::List(vec![]).render_like(files.clone(), '|');
        assert_eq!(list, Claim::List(files));
    }

    #[test]
    fn test_operation_accessors() {
        let op = Operation::MoveIn("a.png".to_string());
        assert_eq!(op.name(), "a.png");
        assert_eq!(op.kind(), "move_in");
        assert_eq!(op.to_string(), "move_in a.png");
        assert_eq!(Operation::DeleteOut("b".into()).kind(), "delete_out");
    }

    #[test]
    fn test_committed_set_membership() {
        let committed = CommittedSet::from_names(["b.png", "a.png"]);
        assert!(committed.contains("a.png"));
        assert!(!committed.contains("c.png"));
        assert_eq!(committed.iter().collect::<Vec<_>>(), vec!["a.png", "b.png"]);

        let state = DirectoryState::Present(committed);
        assert!(state.contains("b.png"));
        assert!(!DirectoryState::Absent.contains("b.png"));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_committed_name() {
        use std::os::unix::ffi::OsStrExt;

        let raw = OsStr::from_bytes(b"bad\xff.png");
        let committed = CommittedSet::from_names([raw.to_os_string()]);
        assert_eq!(committed.len(), 1);
        assert!(!committed.contains("bad.png"));

        let op = Operation::DeleteOut(raw.to_os_string());
        assert_eq!(op.name(), "bad\u{FFFD}.png");
    }
}
