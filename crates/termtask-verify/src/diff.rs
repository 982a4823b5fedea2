//! Structural tree diff
//!
//! [`diff`] merges two canonically ordered trees in lockstep and produces a
//! fresh [`DiffNode`] tree. Neither input is modified; every node of the
//! result carries [`DiffTags`] describing how it relates to the goal.

use crate::tags::{DiffTags, Tag};
use crate::DiffError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use termtask_snapshot::{AttributeSet, FsNode, NodeKind};

/// Separator used when an attribute value differs from the goal
pub const MISMATCH_SEPARATOR: &str = ":::";

/// Node of a diff result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffNode {
    /// Node name
    pub name: String,
    /// Annotations
    #[serde(default)]
    pub tags: DiffTags,
    /// File attributes or directory children
    #[serde(flatten)]
    pub body: DiffBody,
}

/// Kind-specific part of a [`DiffNode`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiffBody {
    /// File with its attributes; mismatched values read `current:::goal`
    File {
        #[serde(default)]
        attributes: AttributeSet,
    },
    /// Directory with children in canonical order
    Directory {
        #[serde(default)]
        children: Vec<DiffNode>,
    },
}

/// Leaf tallies over a diff tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub correct: usize,
    pub incorrect: usize,
    pub extra: usize,
    pub missing: usize,
}

impl DiffNode {
    /// Node kind
    #[inline]
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self.body {
            DiffBody::File { .. } => NodeKind::File,
            DiffBody::Directory { .. } => NodeKind::Directory,
        }
    }

    /// Children (empty for files)
    #[inline]
    #[must_use]
    pub fn children(&self) -> &[DiffNode] {
        match &self.body {
            DiffBody::File { .. } => &[],
            DiffBody::Directory { children } => children,
        }
    }

    /// Mutable children (empty for files)
    #[inline]
    pub fn children_mut(&mut self) -> &mut [DiffNode] {
        match &mut self.body {
            DiffBody::File { .. } => &mut [],
            DiffBody::Directory { children } => children,
        }
    }

    /// Attributes (files only)
    #[inline]
    #[must_use]
    pub fn attributes(&self) -> Option<&AttributeSet> {
        match &self.body {
            DiffBody::File { attributes } => Some(attributes),
            DiffBody::Directory { .. } => None,
        }
    }

    /// Child by name
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&DiffNode> {
        self.children().iter().find(|c| c.name == name)
    }

    /// Whether the whole tree matches the goal
    ///
    /// A directory root is complete when its error counters are all zero;
    /// a file root when it is tagged correct.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match self.body {
            DiffBody::File { .. } => self.tags.has(Tag::Correct) && !self.tags.has_error(),
            DiffBody::Directory { .. } => !self.tags.has_error(),
        }
    }

    /// Count leaves by outcome
    #[must_use]
    pub fn summary(&self) -> DiffSummary {
        let mut summary = DiffSummary::default();
        self.tally(&mut summary);
        summary
    }

    fn tally(&self, summary: &mut DiffSummary) {
        if self.tags.has(Tag::Missing) {
            summary.missing += 1;
            return;
        }
        if self.tags.has(Tag::Extra) {
            summary.extra += 1;
            return;
        }
        match &self.body {
            DiffBody::File { .. } if self.tags.has(Tag::Incorrect) => summary.incorrect += 1,
            DiffBody::File { .. } => summary.correct += 1,
            DiffBody::Directory { children } => {
                for child in children {
                    child.tally(summary);
                }
            }
        }
    }
}

/// Compare a current tree against a goal tree
///
/// # Errors
/// Returns [`DiffError::TypeMismatch`] when the roots differ in kind or name
pub fn diff(current: &FsNode, goal: &FsNode) -> Result<DiffNode, DiffError> {
    if current.kind() != goal.kind() || current.name() != goal.name() {
        return Err(DiffError::TypeMismatch {
            current: current.name().to_string(),
            current_kind: current.kind(),
            goal: goal.name().to_string(),
            goal_kind: goal.kind(),
        });
    }
    let result = diff_matched(current, goal);
    tracing::trace!(
        root = %result.name,
        errors = result.tags.error_count(),
        "tree diff complete"
    );
    Ok(result)
}

/// Diff two nodes already known to share kind and name
fn diff_matched(current: &FsNode, goal: &FsNode) -> DiffNode {
    let mut tags = DiffTags::new();
    if goal.to_select() {
        tags.set(Tag::ToSelect, 1);
    }

    let body = match (current, goal) {
        (FsNode::File(cur), FsNode::File(gol)) => {
            let (attributes, verdict) = attribute_diff(&cur.attributes, &gol.attributes);
            tags.set(verdict, 1);
            DiffBody::File { attributes }
        }
        _ => {
            let children = merge_children(current.children(), goal.children(), &mut tags);
            DiffBody::Directory { children }
        }
    };

    DiffNode {
        name: current.name().to_string(),
        tags,
        body,
    }
}

/// Merge-join two sorted child lists, updating the parent's counters
fn merge_children(current: &[FsNode], goal: &[FsNode], tags: &mut DiffTags) -> Vec<DiffNode> {
    let mut out = Vec::with_capacity(current.len().max(goal.len()));
    let (mut i, mut j) = (0, 0);

    while i < current.len() && j < goal.len() {
        match FsNode::canonical_cmp(&current[i], &goal[j]) {
            Ordering::Equal => {
                let child = diff_matched(&current[i], &goal[j]);
                if child.tags.has_error() {
                    tags.incr(Tag::ChIncorrect);
                }
                out.push(child);
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                out.push(mark(&current[i], Tag::Extra));
                tags.incr(Tag::ChExtra);
                i += 1;
            }
            Ordering::Greater => {
                out.push(mark(&goal[j], Tag::Missing));
                tags.incr(Tag::ChMissing);
                j += 1;
            }
        }
    }
    for node in &current[i..] {
        out.push(mark(node, Tag::Extra));
        tags.incr(Tag::ChExtra);
    }
    for node in &goal[j..] {
        out.push(mark(node, Tag::Missing));
        tags.incr(Tag::ChMissing);
    }
    out
}

/// Copy a subtree, tagging every node with `tag`
///
/// Goal-side `to_select` markers survive so that the selection pass can see
/// them, though nodes tagged missing are never judged.
#[must_use]
pub fn mark(node: &FsNode, tag: Tag) -> DiffNode {
    let mut tags = DiffTags::single(tag);
    if node.to_select() {
        tags.set(Tag::ToSelect, 1);
    }
    let body = match node {
        FsNode::File(f) => DiffBody::File {
            attributes: f.attributes.clone(),
        },
        FsNode::Directory(d) => DiffBody::Directory {
            children: d.children().iter().map(|c| mark(c, tag)).collect(),
        },
    };
    DiffNode {
        name: node.name().to_string(),
        tags,
        body,
    }
}

/// Compare attributes of one file
///
/// Every attribute present on the current side except timestamps is compared
/// against the goal; an absent goal value counts as unset. Mismatched values
/// are rewritten as `current:::goal`, with unset values rendered empty.
/// Returns the annotated attributes and [`Tag::Correct`] or [`Tag::Incorrect`].
#[must_use]
pub fn attribute_diff(current: &AttributeSet, goal: &AttributeSet) -> (AttributeSet, Tag) {
    let mut verdict = Tag::Correct;
    let annotated = current
        .iter()
        .map(|(key, value)| {
            if key.is_timestamp() {
                return (key, value.map(str::to_string));
            }
            let expected = goal.get(key);
            if value == expected {
                (key, value.map(str::to_string))
            } else {
                verdict = Tag::Incorrect;
                let rendered = format!(
                    "{}{MISMATCH_SEPARATOR}{}",
                    value.unwrap_or_default(),
                    expected.unwrap_or_default()
                );
                (key, Some(rendered))
            }
        })
        .collect();
    (annotated, verdict)
}
