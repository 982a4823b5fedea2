//! Error types for verification

use termtask_snapshot::NodeKind;

/// Errors raised while diffing trees
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    /// Roots cannot be compared
    #[error("cannot compare {current_kind:?} '{current}' with {goal_kind:?} '{goal}'")]
    TypeMismatch {
        current: String,
        current_kind: NodeKind,
        goal: String,
        goal_kind: NodeKind,
    },
}
