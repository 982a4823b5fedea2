//! Error types for snapshot construction and disk I/O

use crate::attributes::Attribute;
use std::path::{Path, PathBuf};

/// Snapshot errors
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// Two children of one directory share a name
    #[error("duplicate entry '{entry}' in directory '{directory}'")]
    DuplicateEntry { directory: String, entry: String },

    /// Path does not address a node
    #[error("path not found: {0}")]
    PathNotFound(String),

    /// Snapshot root does not exist on disk
    #[error("snapshot root does not exist: {}", .0.display())]
    RootMissing(PathBuf),

    /// Attribute value cannot be applied
    #[error("invalid {attribute} value: {value}")]
    InvalidAttribute { attribute: Attribute, value: String },

    /// Malformed compact tree
    #[error("invalid compact tree: {0}")]
    Compact(String),

    /// Malformed tagged JSON
    #[error("invalid snapshot json: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem access failed
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SnapshotError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
