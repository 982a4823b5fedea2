//! Persisted session records
//!
//! A [`StudySession`] walks a participant through consent, instructions and
//! two stages of tasks. Each attempt at a task is a [`TaskSession`] bound to at
//! most one sandbox. [`ActionRecord`]s form the append-only audit trail.

use crate::sandbox::SandboxHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

/// Action recorded when the sandbox is reset
pub const ACTION_RESET: &str = "__reset__";
/// Action recorded when a task session is paused
pub const ACTION_PAUSE: &str = "__pause__";
/// Action recorded when a task session is resumed
pub const ACTION_RESUME: &str = "__resume__";

/// Task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u32);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Study session identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StudySessionId(String);

impl StudySessionId {
    /// Fresh random id
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing id
    ///
    /// # Errors
    /// Returns the input if it is empty or contains `/`
    pub fn parse(id: &str) -> Result<Self, String> {
        if id.is_empty() || id.contains('/') {
            return Err(id.to_string());
        }
        Ok(Self(id.to_string()))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StudySessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Task session identifier, `{study}/task-{seq}`
///
/// The study prefix ties every task session to the lock of its study.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TaskSessionId {
    study: StudySessionId,
    seq: u32,
}

impl TaskSessionId {
    #[must_use]
    pub fn new(study: StudySessionId, seq: u32) -> Self {
        Self { study, seq }
    }

    /// Owning study session
    #[inline]
    #[must_use]
    pub fn study(&self) -> &StudySessionId {
        &self.study
    }

    /// Position among the study's task sessions, starting at 1
    #[inline]
    #[must_use]
    pub fn seq(&self) -> u32 {
        self.seq
    }
}

impl Display for TaskSessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/task-{}", self.study, self.seq)
    }
}

impl FromStr for TaskSessionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (study, rest) = s.split_once('/').ok_or_else(|| s.to_string())?;
        let seq = rest
            .strip_prefix("task-")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| s.to_string())?;
        Ok(Self::new(StudySessionId::parse(study)?, seq))
    }
}

impl From<TaskSessionId> for String {
    fn from(id: TaskSessionId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for TaskSessionId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Order in which the two task blocks are presented
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockOrder {
    /// Block one forms stage I
    #[default]
    OneThenTwo,
    /// Block two forms stage I
    TwoThenOne,
}

/// Registered participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Access code, `first-last` in lowercase
    pub code: String,
    pub first_name: String,
    pub last_name: String,
    pub block_order: BlockOrder,
    pub registered_at: DateTime<Utc>,
}

impl Participant {
    /// Access code derived from a participant's names
    #[must_use]
    pub fn access_code(first: &str, last: &str) -> String {
        format!("{}-{}", first.trim(), last.trim()).to_lowercase()
    }
}

/// Coarse study phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Before the first task
    O,
    I,
    II,
    /// All tasks done
    III,
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::O => "O",
            Self::I => "I",
            Self::II => "II",
            Self::III => "III",
        };
        f.write_str(s)
    }
}

/// Study session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StudyStatus {
    ReadingConsent,
    ReadingInstructions,
    Training,
    Running,
    Paused,
    Finished,
    ClosedWithError,
}

impl StudyStatus {
    /// No further transitions possible
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::ClosedWithError)
    }

    /// Participant has not started any task yet
    #[inline]
    #[must_use]
    pub fn is_pre_task(self) -> bool {
        matches!(self, Self::ReadingConsent | Self::ReadingInstructions)
    }
}

impl Display for StudyStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ReadingConsent => "reading_consent",
            Self::ReadingInstructions => "reading_instructions",
            Self::Training => "training",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::ClosedWithError => "closed_with_error",
        };
        f.write_str(s)
    }
}

/// Task session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Paused,
    TimeOut,
    Quit,
    Passed,
}

impl TaskStatus {
    /// Running or paused
    #[inline]
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::TimeOut => "time_out",
            Self::Quit => "quit",
            Self::Passed => "passed",
        };
        f.write_str(s)
    }
}

/// Why the caller is closing the current task session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Passed,
    Quit,
    TimeOut,
}

impl From<CloseReason> for TaskStatus {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Passed => Self::Passed,
            CloseReason::Quit => Self::Quit,
            CloseReason::TimeOut => Self::TimeOut,
        }
    }
}

/// Outcome counts of the real (non-training) tasks of a study
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeTally {
    pub passed: u32,
    pub quit: u32,
    pub timed_out: u32,
}

impl OutcomeTally {
    pub(crate) fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Passed => self.passed += 1,
            TaskStatus::Quit => self.quit += 1,
            TaskStatus::TimeOut => self.timed_out += 1,
            TaskStatus::Running | TaskStatus::Paused => {}
        }
    }
}

/// A participant's pass through the study
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudySession {
    pub id: StudySessionId,
    pub participant: String,
    pub status: StudyStatus,
    /// Real tasks in presentation order, stage I first
    pub tasks: Vec<TaskId>,
    /// Number of tasks in stage I
    pub switch_point: u32,
    pub total_tasks: u32,
    pub num_tasks_completed: u32,
    /// Remaining time budget of the current stage
    pub half_stage_time_left: Duration,
    /// Stage whose budget `half_stage_time_left` tracks
    pub budget_stage: Option<Stage>,
    pub current_task_session: Option<TaskSessionId>,
    /// Task sessions created so far, training included
    pub task_seq: u32,
    pub outcomes: OutcomeTally,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl StudySession {
    /// Derived stage
    #[must_use]
    pub fn stage(&self) -> Stage {
        if self.status.is_pre_task() {
            Stage::O
        } else {
            self.progress_stage()
        }
    }

    /// Stage implied by the completion counters alone
    #[must_use]
    pub fn progress_stage(&self) -> Stage {
        if self.num_tasks_completed < self.switch_point {
            Stage::I
        } else if self.num_tasks_completed < self.total_tasks {
            Stage::II
        } else {
            Stage::III
        }
    }

    /// Id for the next task session
    pub(crate) fn next_task_session_id(&mut self) -> TaskSessionId {
        self.task_seq += 1;
        TaskSessionId::new(self.id.clone(), self.task_seq)
    }
}

/// One attempt at one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSession {
    pub id: TaskSessionId,
    pub task: TaskId,
    pub stage: Stage,
    pub training: bool,
    pub status: TaskStatus,
    pub sandbox: Option<SandboxHandle>,
    pub started_at: DateTime<Utc>,
    /// Start of the current running interval
    pub last_resume: DateTime<Utc>,
    /// Time granted at creation
    pub allotted: Duration,
    /// Remaining time as of `last_resume`
    pub time_left: Duration,
    /// Active time, fixed when the session closes
    pub time_spent: Option<Duration>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Outcome already folded into the study counters
    pub accounted: bool,
}

impl TaskSession {
    /// Remaining time at `now`
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.status {
            TaskStatus::Running => self.time_left.saturating_sub(elapsed(self.last_resume, now)),
            _ => self.time_left,
        }
    }

    /// Whether the allotted time has run out at `now`
    #[inline]
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && self.remaining(now).is_zero()
    }

    /// Active time at `now`
    ///
    /// Derived from the persisted `time_left` and `last_resume` rather than
    /// replayed from the action history. Pause and resume markers are still
    /// recorded there with the same timestamps, so both agree.
    #[must_use]
    pub fn active_time(&self, now: DateTime<Utc>) -> Duration {
        self.time_spent
            .unwrap_or_else(|| self.allotted.saturating_sub(self.remaining(now)))
    }
}

/// Non-negative wall-clock time between two instants
#[must_use]
pub fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

/// Audit trail entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub task_session: TaskSessionId,
    pub action: String,
    pub timestamp: DateTime<Utc>,
}
