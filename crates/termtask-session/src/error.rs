//! Error types for the session engine
//!
//! Verification mismatches are never errors; they come back as diff data.
//! Everything here is either a usage error, a configuration error, or an
//! infrastructure fault. Infrastructure faults close the owning study
//! session before they are returned.

use crate::model::{StudySessionId, TaskId, TaskStatus};
use std::path::PathBuf;
use termtask_snapshot::SnapshotError;
use termtask_verify::{DiffError, UnknownTaskType};

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Sandbox, store or snapshot fault
    #[error("infrastructure fault: {0}")]
    Infrastructure(#[from] InfrastructureError),

    /// Lock could not be acquired
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Roots of a diff cannot be compared
    #[error("diff failed: {0}")]
    Diff(#[from] DiffError),

    /// State machine violation
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// Task id not present in the catalog
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// Task catalog could not be loaded
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Operation requires an open task session
    #[error("task session {id} is not active (status {status})")]
    NotActive { id: String, status: TaskStatus },

    /// Operation does not apply to the study in its current status
    #[error("study session {id} cannot {operation} while {status}")]
    InvalidStudyState {
        id: StudySessionId,
        operation: &'static str,
        status: String,
    },

    /// Malformed session identifier
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),

    /// Participant lookup failed
    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    /// Participant already registered
    #[error("participant already registered: {0}")]
    DuplicateParticipant(String),
}

impl EngineError {
    /// Whether this error forces the study session to `closed_with_error`
    #[inline]
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Infrastructure(_))
    }

    /// Persisted record that should exist but does not
    #[must_use]
    pub fn missing_record(kind: &'static str, id: impl Into<String>) -> Self {
        Self::Infrastructure(InfrastructureError::MissingRecord {
            kind,
            id: id.into(),
        })
    }

    /// Transition error from any displayable states
    #[must_use]
    pub fn illegal(from: impl ToString, to: impl ToString) -> Self {
        Self::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Infrastructure(e.into())
    }
}

impl From<SandboxError> for EngineError {
    fn from(e: SandboxError) -> Self {
        Self::Infrastructure(e.into())
    }
}

impl From<SnapshotError> for EngineError {
    fn from(e: SnapshotError) -> Self {
        Self::Infrastructure(e.into())
    }
}

/// Faults outside the engine's control
#[derive(Debug, thiserror::Error)]
pub enum InfrastructureError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("sandbox: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Persisted row vanished or was never written
    #[error("{kind} {id} does not exist")]
    MissingRecord { kind: &'static str, id: String },

    /// Task session has no sandbox bound while running
    #[error("task session {0} has no sandbox")]
    MissingSandbox(String),

    /// Persisted records disagree with each other
    #[error("task session {id} is {status}, expected running or paused")]
    Inconsistent { id: String, status: TaskStatus },
}

/// Key-value store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Value could not be encoded or decoded
    #[error("serialization failed for '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Appending to a key that holds a non-list value
    #[error("key '{0}' does not hold a list")]
    NotAList(String),

    /// Backend unavailable
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Sandbox runtime errors
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Handle is not live
    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// Sandbox could not be created
    #[error("sandbox creation failed: {0}")]
    CreationFailed(String),

    /// Snapshot could not be captured
    #[error("snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Runtime unreachable
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lock acquisition errors
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Lock not acquired within the configured bound
    #[error("timed out after {waited_ms}ms waiting for lock on {key}")]
    Timeout { key: String, waited_ms: u64 },

    /// Guard passed to an operation does not cover its study
    #[error("operation on {needed} requires its lock, caller holds {held}")]
    NotHeld { held: String, needed: String },
}

/// Task catalog loading errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON task file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid YAML task file {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Goal tree malformed
    #[error("task {task}: invalid filesystem: {source}")]
    Tree {
        task: TaskId,
        #[source]
        source: SnapshotError,
    },

    /// Task file names a type the engine cannot judge
    #[error("task file {path}: {source}")]
    UnknownTaskType {
        path: PathBuf,
        #[source]
        source: UnknownTaskType,
    },

    /// Task file does not follow the `task<ID>` naming
    #[error("task file {0} is not named task<ID>")]
    BadFileName(PathBuf),

    /// Two tasks share an id
    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    /// Task type requires a goal that is not defined
    #[error("task {task} has no {what}")]
    MissingGoal { task: TaskId, what: &'static str },

    /// Stdout file names a task that does not exist
    #[error("orphan stdout file for task {0}")]
    OrphanStdout(TaskId),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
