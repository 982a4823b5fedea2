//! Paths for addressing nodes within a snapshot
//!
//! Provides [`SnapshotPath`] for hierarchical addressing of files and
//! directories, starting at the snapshot root's own name.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Path within a snapshot tree
///
/// The first segment names the root node itself, so `website/css/main.css`
/// addresses `main.css` inside `css` inside the root directory `website`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotPath(Vec<String>);

impl SnapshotPath {
    /// Empty path
    #[inline]
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Number of segments
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if path is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Final segment, i.e. the file name
    #[inline]
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// Append a segment in place
    #[inline]
    pub fn push(&mut self, segment: impl Into<String>) {
        self.0.push(segment.into());
    }

    /// Remove the final segment in place
    #[inline]
    pub fn pop(&mut self) -> Option<String> {
        self.0.pop()
    }

    /// Iterator over segments from root to leaf
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Display for SnapshotPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl FromStr for SnapshotPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        if trimmed.starts_with('/') {
            return Err(PathError::Absolute(s.to_string()));
        }

        let segments: Vec<String> = trimmed
            .split('/')
            .map(|seg| match seg {
                "" => Err(PathError::EmptySegment),
                "." | ".." => Err(PathError::InvalidSegment(seg.to_string())),
                _ => Ok(seg.to_string()),
            })
            .collect::<Result<_, _>>()?;

        Ok(Self(segments))
    }
}

/// Errors related to snapshot paths
#[derive(Debug, thiserror::Error)]
pub enum PathError {
    /// Empty segment in path
    #[error("path contains empty segment")]
    EmptySegment,

    /// Segment that cannot name a node
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    /// Snapshot paths are always relative to the snapshot root
    #[error("snapshot path must be relative: {0}")]
    Absolute(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let path: SnapshotPath = "website/css/main.css".parse().unwrap();
        assert_eq!(path.iter().collect::<Vec<_>>(), vec!["website", "css", "main.css"]);
        assert_eq!(path.to_string(), "website/css/main.css");
        assert_eq!(path.file_name(), Some("main.css"));
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let path: SnapshotPath = "website/css/".parse().unwrap();
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn empty_string_is_root() {
        let path: SnapshotPath = "".parse().unwrap();
        assert!(path.is_empty());
        assert_eq!(path, SnapshotPath::root());
    }

    #[test]
    fn rejects_bad_segments() {
        assert!(matches!(
            "a//b".parse::<SnapshotPath>(),
            Err(PathError::EmptySegment)
        ));
        assert!(matches!(
            "a/../b".parse::<SnapshotPath>(),
            Err(PathError::InvalidSegment(_))
        ));
        assert!(matches!(
            "/etc/passwd".parse::<SnapshotPath>(),
            Err(PathError::Absolute(_))
        ));
    }

    #[test]
    fn push_and_pop() {
        let mut path = SnapshotPath::root();
        path.push("website");
        path.push("a");
        assert_eq!(path.to_string(), "website/a");
        assert_eq!(path.pop().as_deref(), Some("a"));
        assert_eq!(path.len(), 1);
        assert_eq!(path.file_name(), Some("website"));
    }
}
