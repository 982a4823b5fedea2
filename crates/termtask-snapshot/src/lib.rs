//! termtask snapshots
//!
//! In-memory filesystem trees used as both the observed state of a sandbox
//! and the goal state of a task.
//!
//! # Core Concepts
//!
//! - [`FsNode`]: file or directory node; directory children are kept sorted
//!   files-first, then by name
//! - [`AttributeSet`]: per-file attribute values, filtered to what a task declares
//! - [`SnapshotPath`]: slash-separated addressing starting at the root's name
//! - [`compact`]: the structure-only `{name: null | {..}}` JSON form
//! - [`snapshot_dir`] / [`materialize`]: disk capture and seeding
//!
//! # Example
//!
//! ```rust,ignore
//! use termtask_snapshot::{Attribute, FsNode};
//!
//! let tree = snapshot_dir(Path::new("/srv/home/website"), &[Attribute::Size])?;
//! println!("{} nodes", tree.node_count());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod attributes;
mod disk;
mod error;
mod node;
mod path;

pub mod compact;

pub use attributes::{Attribute, AttributeSet, UnknownAttribute};
pub use disk::{
    decode_content, encode_content, materialize, snapshot_dir, MaterializeStatus,
    HEX_CONTENT_PREFIX,
};
pub use error::SnapshotError;
pub use node::{DirNode, FileNode, FsNode, NodeKind};
pub use path::{PathError, SnapshotPath};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
