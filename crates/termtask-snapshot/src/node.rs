//! Filesystem snapshot tree
//!
//! [`FsNode`] is either a file carrying an [`AttributeSet`] or a directory
//! whose children are kept in canonical order: files first, then
//! directories, each group sorted by name.

use crate::attributes::{Attribute, AttributeSet};
use crate::path::SnapshotPath;
use crate::SnapshotError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Kind of a snapshot node
///
/// The derived order places files before directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

/// A node of a filesystem snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FsNode {
    /// Regular file
    File(FileNode),
    /// Directory with sorted children
    Directory(DirNode),
}

/// File leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    /// File name
    pub name: String,
    /// Captured attributes
    #[serde(default, skip_serializing_if = "AttributeSet::is_empty")]
    pub attributes: AttributeSet,
    /// Goal trees mark nodes a file-search task expects to be found
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub to_select: bool,
}

/// Directory with canonically ordered children
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DirNodeRepr")]
pub struct DirNode {
    name: String,
    children: Vec<FsNode>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    to_select: bool,
}

#[derive(Deserialize)]
struct DirNodeRepr {
    name: String,
    #[serde(default)]
    children: Vec<FsNode>,
    #[serde(default)]
    to_select: bool,
}

impl TryFrom<DirNodeRepr> for DirNode {
    type Error = SnapshotError;

    fn try_from(repr: DirNodeRepr) -> Result<Self, Self::Error> {
        let mut dir = DirNode::new(repr.name, repr.children)?;
        dir.to_select = repr.to_select;
        Ok(dir)
    }
}

impl DirNode {
    /// Create directory, sorting children canonically
    ///
    /// # Errors
    /// Returns error if two children share a name
    pub fn new(name: impl Into<String>, mut children: Vec<FsNode>) -> Result<Self, SnapshotError> {
        let name = name.into();
        let mut seen = HashSet::with_capacity(children.len());
        for child in &children {
            if !seen.insert(child.name()) {
                return Err(SnapshotError::DuplicateEntry {
                    directory: name,
                    entry: child.name().to_string(),
                });
            }
        }
        children.sort_by(FsNode::canonical_cmp);
        Ok(Self {
            name,
            children,
            to_select: false,
        })
    }

    /// Directory name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Children in canonical order
    #[inline]
    #[must_use]
    pub fn children(&self) -> &[FsNode] {
        &self.children
    }

    /// Whether a file-search task expects this directory to be found
    #[inline]
    #[must_use]
    pub fn to_select(&self) -> bool {
        self.to_select
    }

    /// Child by name
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&FsNode> {
        self.children.iter().find(|c| c.name() == name)
    }

    /// Insert a child, keeping canonical order
    ///
    /// # Errors
    /// Returns error if a child with the same name exists
    pub fn insert(&mut self, child: FsNode) -> Result<(), SnapshotError> {
        if self.child(child.name()).is_some() {
            return Err(SnapshotError::DuplicateEntry {
                directory: self.name.clone(),
                entry: child.name().to_string(),
            });
        }
        let pos = self
            .children
            .binary_search_by(|c| FsNode::canonical_cmp(c, &child))
            .unwrap_or_else(|p| p);
        self.children.insert(pos, child);
        Ok(())
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut FsNode> {
        self.children.iter_mut().find(|c| c.name() == name)
    }
}

impl FsNode {
    /// File without attributes
    #[inline]
    #[must_use]
    pub fn file(name: impl Into<String>) -> Self {
        Self::File(FileNode {
            name: name.into(),
            attributes: AttributeSet::new(),
            to_select: false,
        })
    }

    /// File with attributes
    #[inline]
    #[must_use]
    pub fn file_with(name: impl Into<String>, attributes: AttributeSet) -> Self {
        Self::File(FileNode {
            name: name.into(),
            attributes,
            to_select: false,
        })
    }

    /// Directory from children
    ///
    /// # Errors
    /// Returns error if two children share a name
    pub fn dir(name: impl Into<String>, children: Vec<FsNode>) -> Result<Self, SnapshotError> {
        DirNode::new(name, children).map(Self::Directory)
    }

    /// Directory without children
    #[inline]
    #[must_use]
    pub fn empty_dir(name: impl Into<String>) -> Self {
        Self::Directory(DirNode {
            name: name.into(),
            children: Vec::new(),
            to_select: false,
        })
    }

    /// Node name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::File(f) => &f.name,
            Self::Directory(d) => &d.name,
        }
    }

    /// Node kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::File(_) => NodeKind::File,
            Self::Directory(_) => NodeKind::Directory,
        }
    }

    /// Children (empty for files)
    #[inline]
    #[must_use]
    pub fn children(&self) -> &[FsNode] {
        match self {
            Self::File(_) => &[],
            Self::Directory(d) => &d.children,
        }
    }

    /// Attributes (files only)
    #[inline]
    #[must_use]
    pub fn attributes(&self) -> Option<&AttributeSet> {
        match self {
            Self::File(f) => Some(&f.attributes),
            Self::Directory(_) => None,
        }
    }

    /// Whether a file-search task expects this node to be found
    #[inline]
    #[must_use]
    pub fn to_select(&self) -> bool {
        match self {
            Self::File(f) => f.to_select,
            Self::Directory(d) => d.to_select,
        }
    }

    /// Builder-style `to_select` marker
    #[inline]
    #[must_use]
    pub fn selected_by_goal(mut self) -> Self {
        match &mut self {
            Self::File(f) => f.to_select = true,
            Self::Directory(d) => d.to_select = true,
        }
        self
    }

    /// Canonical sibling order: files before directories, then by name
    #[must_use]
    pub fn canonical_cmp(a: &FsNode, b: &FsNode) -> Ordering {
        (a.kind(), a.name()).cmp(&(b.kind(), b.name()))
    }

    /// Look up a node by path; the first segment must name this node
    #[must_use]
    pub fn find(&self, path: &SnapshotPath) -> Option<&FsNode> {
        let mut segments = path.iter();
        if segments.next()? != self.name() {
            return None;
        }
        let mut node = self;
        for segment in segments {
            node = match node {
                Self::Directory(d) => d.child(segment)?,
                Self::File(_) => return None,
            };
        }
        Some(node)
    }

    /// Mark the node at `path` as expected by a file-search task
    ///
    /// # Errors
    /// Returns error if the path does not exist
    pub fn mark_to_select(&mut self, path: &SnapshotPath) -> Result<(), SnapshotError> {
        let not_found = || SnapshotError::PathNotFound(path.to_string());
        let mut segments = path.iter();
        if segments.next() != Some(self.name()) {
            return Err(not_found());
        }
        let mut node = self;
        for segment in segments {
            node = match node {
                Self::Directory(d) => d.child_mut(segment).ok_or_else(not_found)?,
                Self::File(_) => return Err(not_found()),
            };
        }
        match node {
            Self::File(f) => f.to_select = true,
            Self::Directory(d) => d.to_select = true,
        }
        Ok(())
    }

    /// Copy of the tree with file attributes restricted to `keys`
    #[must_use]
    pub fn filter_attributes(&self, keys: &[Attribute]) -> FsNode {
        match self {
            Self::File(f) => Self::File(FileNode {
                name: f.name.clone(),
                attributes: f.attributes.filtered(keys),
                to_select: f.to_select,
            }),
            Self::Directory(d) => Self::Directory(DirNode {
                name: d.name.clone(),
                children: d.children.iter().map(|c| c.filter_attributes(keys)).collect(),
                to_select: d.to_select,
            }),
        }
    }

    /// Total number of nodes in the subtree, including this one
    #[must_use]
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(FsNode::node_count).sum::<usize>()
    }

    /// Parse the tagged JSON representation
    ///
    /// # Errors
    /// Returns error on malformed JSON, unknown node types or duplicate entries
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        serde_json::from_str(json).map_err(SnapshotError::from)
    }

    /// Parse a tree given in either the tagged or the compact JSON form
    ///
    /// A string `type` key at the top level selects the tagged form.
    ///
    /// # Errors
    /// Returns error if `value` is valid in neither form
    pub fn from_json_value(value: &serde_json::Value) -> Result<Self, SnapshotError> {
        if value.get("type").is_some_and(serde_json::Value::is_string) {
            Ok(serde_json::from_value(value.clone())?)
        } else {
            crate::compact::from_value(value)
        }
    }

    /// Render the tagged JSON representation
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        serde_json::to_string(self).map_err(SnapshotError::from)
    }
}
