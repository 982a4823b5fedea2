//! Status transition tables
//!
//! Every status change of a study or task session goes through
//! [`validate_study_transition`] / [`validate_task_transition`].

use crate::error::EngineError;
use crate::model::{StudyStatus, TaskStatus};

/// Statuses a study session may move to from `from`
#[must_use]
pub fn allowed_study_transitions(from: StudyStatus) -> Vec<StudyStatus> {
    use StudyStatus::*;
    match from {
        ReadingConsent => vec![ReadingInstructions, ClosedWithError],
        ReadingInstructions => vec![Training, Running, ClosedWithError],
        Training => vec![Running, Paused, Finished, ClosedWithError],
        Running => vec![Training, Paused, Finished, ClosedWithError],
        Paused => vec![Running, Training, Finished, ClosedWithError],
        Finished | ClosedWithError => vec![],
    }
}

/// Statuses a task session may move to from `from`
#[must_use]
pub fn allowed_task_transitions(from: TaskStatus) -> Vec<TaskStatus> {
    use TaskStatus::*;
    match from {
        Running => vec![Paused, TimeOut, Quit, Passed],
        Paused => vec![Running, Quit],
        TimeOut | Quit | Passed => vec![],
    }
}

/// Validate a study status change
///
/// # Errors
/// Returns [`EngineError::IllegalTransition`] if `to` is not reachable from `from`
pub fn validate_study_transition(from: StudyStatus, to: StudyStatus) -> Result<(), EngineError> {
    if allowed_study_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(EngineError::illegal(from, to))
    }
}

/// Validate a task status change
///
/// # Errors
/// Returns [`EngineError::IllegalTransition`] if `to` is not reachable from `from`
pub fn validate_task_transition(from: TaskStatus, to: TaskStatus) -> Result<(), EngineError> {
    if allowed_task_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(EngineError::illegal(from, to))
    }
}
