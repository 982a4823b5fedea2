//! Selection annotation
//!
//! After a diff, the paths a participant printed are stamped onto the diff
//! tree. For file-search tasks each printed path is judged against the goal's
//! `to_select` markers, and expected nodes that were never printed are
//! flagged afterwards.

use crate::diff::DiffNode;
use crate::tags::Tag;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use termtask_snapshot::SnapshotPath;

/// How a task is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Terminal output is compared against expected lines
    Stdout,
    /// Participant must print the paths of specific files
    FileSearch,
    /// Filesystem must be brought into a goal state
    FilesystemChange,
}

impl TaskType {
    /// Whether printed paths are judged against `to_select` markers
    #[inline]
    #[must_use]
    pub fn judges_selection(self) -> bool {
        matches!(self, Self::FileSearch)
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::FileSearch => "file_search",
            Self::FilesystemChange => "filesystem_change",
        }
    }
}

impl Display for TaskType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized task type names
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task type: {0}")]
pub struct UnknownTaskType(pub String);

impl FromStr for TaskType {
    type Err = UnknownTaskType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "file_search" | "file-search" => Ok(Self::FileSearch),
            "filesystem_change" | "filesystem-change" => Ok(Self::FilesystemChange),
            other => Err(UnknownTaskType(other.to_string())),
        }
    }
}

/// Stamp observed paths onto a diff tree
///
/// Each path starts with the root's name. A walk that reaches a node tagged
/// missing, or a segment with no matching child, is abandoned. The terminal
/// node of a successful walk gets `selected`: 0 for a correct pick (or when
/// the task type does not judge selections) and 1 for a wrong pick, in which
/// case every ancestor's `ch_incorrect` is incremented. A node that already
/// carries a verdict keeps it.
///
/// For file-search tasks a final sweep stamps `selected = -1` on every node
/// expected by the goal but never reached, and increments `ch_incorrect` on
/// each of its ancestors. Nodes tagged missing are exempt.
pub fn annotate_selection(tree: &mut DiffNode, task_type: TaskType, observed: &[SnapshotPath]) {
    let judges = task_type.judges_selection();
    for path in observed {
        select_path(tree, judges, path);
    }
    if judges {
        let unmet = sweep_unselected(tree);
        if unmet > 0 {
            tracing::debug!(root = %tree.name, unmet, "expected selections not printed");
        }
    }
}

fn select_path(root: &mut DiffNode, judges: bool, path: &SnapshotPath) {
    let mut segments = path.iter();
    if segments.next() != Some(root.name.as_str()) || root.tags.has(Tag::Missing) {
        return;
    }

    // Resolve the walk read-only first so an abandoned walk leaves no trace
    let mut indices = Vec::with_capacity(path.len());
    let mut node: &DiffNode = root;
    for segment in segments {
        let Some(index) = node.children().iter().position(|c| c.name == segment) else {
            return;
        };
        node = &node.children()[index];
        if node.tags.has(Tag::Missing) {
            return;
        }
        indices.push(index);
    }
    if node.tags.has(Tag::Selected) {
        return;
    }
    let wrong = judges && !node.tags.has(Tag::ToSelect);

    let mut current = root;
    for index in indices {
        if wrong {
            current.tags.incr(Tag::ChIncorrect);
        }
        current = &mut current.children_mut()[index];
    }
    current.tags.set(Tag::Selected, i64::from(wrong));
}

/// Returns how many unmet selections lie in this subtree, this node included
fn sweep_unselected(node: &mut DiffNode) -> i64 {
    if node.tags.has(Tag::Missing) {
        return 0;
    }
    let mut unmet = 0;
    if node.tags.has(Tag::ToSelect) && !node.tags.has(Tag::Selected) {
        node.tags.set(Tag::Selected, -1);
        unmet += 1;
    }
    let mut below = 0;
    for child in node.children_mut() {
        below += sweep_unselected(child);
    }
    node.tags.add(Tag::ChIncorrect, below);
    unmet + below
}
