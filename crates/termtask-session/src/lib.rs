//! termtask sessions
//!
//! Runs participants through a study: consent, instructions, then two stages
//! of timed tasks, each opened by an optional training task. Every task
//! attempt owns at most one sandbox, and all mutations of a study happen
//! under that study's lock.
//!
//! # Core Concepts
//!
//! - [`Engine`]: evaluate, reset, advance, pause and resume operations
//! - [`StudySession`] / [`TaskSession`]: persisted lifecycle records
//! - [`state_machine`]: legal status transitions
//! - [`SessionLocks`]: exclusive per-study locks
//! - [`KeyValueStore`] / [`SandboxRuntime`]: infrastructure seams
//! - [`TaskCatalog`] / [`StudyPlan`]: task definitions and their ordering
//!
//! # Example
//!
//! ```rust,ignore
//! use termtask_session::{CloseReason, Engine, EngineConfig, MemoryStore};
//!
//! let engine = Engine::new(config, catalog, Arc::new(MemoryStore::new()), runtime)?;
//! let study = engine.create_study_session(&participant.code).await?;
//! engine.sign_consent(&study.id).await?;
//! engine.finish_instructions(&study.id).await?;
//! let result = engine.evaluate(&task_session, &observed).await?;
//! if !result.completed {
//!     engine.advance(&study.id, CloseReason::Quit).await?;
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod clock;
mod config;
mod engine;
mod error;
mod lock;
mod model;
mod outcome;
mod sandbox;
mod store;
mod task;

pub mod state_machine;

pub use clock::{Clock, SystemClock};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{
    CatalogError, ConfigError, EngineError, InfrastructureError, LockError, SandboxError,
    StoreError,
};
pub use lock::{SessionGuard, SessionLocks};
pub use model::{
    elapsed, ActionRecord, BlockOrder, CloseReason, OutcomeTally, Participant, Stage,
    StudySession, StudySessionId, StudyStatus, TaskId, TaskSession, TaskSessionId, TaskStatus,
    ACTION_PAUSE, ACTION_RESET, ACTION_RESUME,
};
pub use outcome::{
    Advance, CompletionSummary, Evaluation, ResetOutcome, StageReport, StageStats, Timing,
};
pub use sandbox::{LocalSandboxRuntime, SandboxHandle, SandboxRuntime};
pub use store::{KeyValueStore, MemoryStore, Repository};
pub use task::{StudyPlan, Task, TaskCatalog, DEFAULT_GOAL_WORKING_DIR};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
