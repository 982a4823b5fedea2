//! Capturing snapshots from disk and writing them back
//!
//! [`snapshot_dir`] walks a real directory and records only the attributes a
//! task asked for. [`materialize`] seeds a directory from a snapshot.

use crate::attributes::{Attribute, AttributeSet};
use crate::node::FsNode;
use crate::SnapshotError;
use std::fs::{self, File, Metadata};
use std::io::Write;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

/// Outcome of [`materialize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeStatus {
    /// Snapshot written below the target root
    Written,
    /// Target root does not exist
    RootMissing,
    /// Snapshot had no entries below its root directory; only the root was created
    Empty,
    /// I/O failure while writing
    Io(String),
}

impl MaterializeStatus {
    /// Whether the snapshot is fully on disk
    #[inline]
    #[must_use]
    pub fn is_written(&self) -> bool {
        matches!(self, Self::Written | Self::Empty)
    }
}

/// Build a snapshot of the directory at `path`
///
/// The root node is named after the last component of `path`. Symbolic
/// links and special files are skipped.
///
/// # Errors
/// Returns [`SnapshotError::RootMissing`] if `path` does not exist, or an
/// I/O error for unreadable entries
pub fn snapshot_dir(path: &Path, attributes: &[Attribute]) -> Result<FsNode, SnapshotError> {
    if !path.exists() {
        return Err(SnapshotError::RootMissing(path.to_path_buf()));
    }
    let node = snapshot_entry(path, attributes)?;
    node.ok_or_else(|| SnapshotError::RootMissing(path.to_path_buf()))
}

fn snapshot_entry(path: &Path, attributes: &[Attribute]) -> Result<Option<FsNode>, SnapshotError> {
    let meta = fs::symlink_metadata(path).map_err(|e| SnapshotError::io(path, e))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());

    if meta.is_dir() {
        let mut children = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| SnapshotError::io(path, e))? {
            let entry = entry.map_err(|e| SnapshotError::io(path, e))?;
            if let Some(child) = snapshot_entry(&entry.path(), attributes)? {
                children.push(child);
            }
        }
        return FsNode::dir(name, children).map(Some);
    }

    if !meta.is_file() {
        tracing::debug!(path = %path.display(), "skipping non-regular entry");
        return Ok(None);
    }

    let mut set = AttributeSet::new();
    for &attr in attributes {
        set.insert(attr, read_attribute(path, &meta, attr)?);
    }
    Ok(Some(FsNode::file_with(name, set)))
}

fn read_attribute(
    path: &Path,
    meta: &Metadata,
    attr: Attribute,
) -> Result<Option<String>, SnapshotError> {
    let value = match attr {
        Attribute::User => meta.uid().to_string(),
        Attribute::Group => meta.gid().to_string(),
        Attribute::Size => meta.len().to_string(),
        Attribute::Mode => format!("{:o}", meta.mode() & 0o7777),
        Attribute::Atime => meta.atime().to_string(),
        Attribute::Mtime => meta.mtime().to_string(),
        Attribute::Ctime => meta.ctime().to_string(),
        Attribute::Content => {
            let bytes = fs::read(path).map_err(|e| SnapshotError::io(path, e))?;
            encode_content(bytes)
        }
    };
    Ok(Some(value))
}

/// Marks a `content` value holding hex-encoded bytes
pub const HEX_CONTENT_PREFIX: &str = "hex:";

/// `content` value for raw file bytes
///
/// UTF-8 text is kept as is. Other bytes, and text that itself starts with
/// [`HEX_CONTENT_PREFIX`], are hex-encoded behind the prefix so distinct
/// files never share a value.
#[must_use]
pub fn encode_content(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) if !text.starts_with(HEX_CONTENT_PREFIX) => text,
        Ok(text) => format!("{HEX_CONTENT_PREFIX}{}", hex::encode(text)),
        Err(e) => format!("{HEX_CONTENT_PREFIX}{}", hex::encode(e.into_bytes())),
    }
}

/// File bytes for a `content` value written by [`encode_content`]
///
/// # Errors
/// Returns error if a prefixed value is not valid hex
pub fn decode_content(value: &str) -> Result<Vec<u8>, SnapshotError> {
    match value.strip_prefix(HEX_CONTENT_PREFIX) {
        Some(encoded) => hex::decode(encoded).map_err(|_| SnapshotError::InvalidAttribute {
            attribute: Attribute::Content,
            value: value.to_string(),
        }),
        None => Ok(value.as_bytes().to_vec()),
    }
}

/// Write `node` below `target_root`
///
/// Files get their `content` bytes back; without content, a `size` attribute
/// produces a zero-filled file of that length. A `mode` attribute is applied
/// as permission bits. Ownership and timestamps are left to the runtime.
#[must_use]
pub fn materialize(node: &FsNode, target_root: &Path) -> MaterializeStatus {
    if !target_root.is_dir() {
        return MaterializeStatus::RootMissing;
    }
    if let Err(e) = write_node(node, target_root) {
        tracing::warn!(root = %target_root.display(), error = %e, "materialize failed");
        return MaterializeStatus::Io(e.to_string());
    }
    match node {
        FsNode::Directory(dir) if dir.children().is_empty() => MaterializeStatus::Empty,
        _ => MaterializeStatus::Written,
    }
}

fn write_node(node: &FsNode, parent: &Path) -> Result<(), SnapshotError> {
    let path = parent.join(node.name());
    match node {
        FsNode::Directory(dir) => {
            fs::create_dir_all(&path).map_err(|e| SnapshotError::io(&path, e))?;
            for child in dir.children() {
                write_node(child, &path)?;
            }
        }
        FsNode::File(file) => {
            let mut handle = File::create(&path).map_err(|e| SnapshotError::io(&path, e))?;
            if let Some(content) = file.attributes.get(Attribute::Content) {
                handle
                    .write_all(&decode_content(content)?)
                    .map_err(|e| SnapshotError::io(&path, e))?;
            } else if let Some(size) = file.attributes.get(Attribute::Size) {
                let len: u64 = size.parse().map_err(|_| SnapshotError::InvalidAttribute {
                    attribute: Attribute::Size,
                    value: size.to_string(),
                })?;
                handle.set_len(len).map_err(|e| SnapshotError::io(&path, e))?;
            }
            if let Some(mode) = file.attributes.get(Attribute::Mode) {
                let bits = u32::from_str_radix(mode, 8).map_err(|_| {
                    SnapshotError::InvalidAttribute {
                        attribute: Attribute::Mode,
                        value: mode.to_string(),
                    }
                })?;
                fs::set_permissions(&path, fs::Permissions::from_mode(bits))
                    .map_err(|e| SnapshotError::io(&path, e))?;
            }
        }
    }
    Ok(())
}
