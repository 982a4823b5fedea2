//! Results returned by engine operations

use crate::model::{Stage, TaskSessionId, TaskStatus};
use crate::sandbox::SandboxHandle;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use termtask_verify::{DiffNode, StdoutDiff};

/// Result of checking a task session after a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub task_session: TaskSessionId,
    pub status: TaskStatus,
    pub completed: bool,
    pub filesystem_diff: Option<DiffNode>,
    pub stdout_diff: Option<StdoutDiff>,
}

/// Result of resetting a task session's sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetOutcome {
    /// New sandbox; `None` when the session timed out instead
    pub sandbox: Option<SandboxHandle>,
    /// Fresh sandbox compared with the goal, for filesystem tasks
    pub filesystem_diff: Option<DiffNode>,
    pub status: TaskStatus,
}

/// What follows after closing a task session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Advance {
    /// Next task session has started
    Next {
        task_session: TaskSessionId,
        training: bool,
        stage: Stage,
    },
    /// Study finished
    Complete(CompletionSummary),
}

/// Outcome counts of a finished study
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub num_passed: u32,
    pub num_quit: u32,
    pub num_timed_out: u32,
    pub num_total: u32,
}

/// Remaining time of a task session and its stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    pub status: TaskStatus,
    pub time_left: Duration,
    pub stage_time_left: Duration,
}

/// Per-stage statistics of a finished study
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub stage: Stage,
    pub active_time: Duration,
    pub attempted: u32,
    pub passed: u32,
    /// `passed / attempted`, zero when nothing was attempted
    pub completion_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stages: Vec<StageStats>,
}
