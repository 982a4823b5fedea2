//! termtask verification
//!
//! Decides whether a participant has completed a task, by comparing either
//! filesystem trees or terminal output against a goal.
//!
//! # Core Concepts
//!
//! - [`diff()`]: lockstep merge of a current and a goal tree into a tagged
//!   [`DiffNode`] tree
//! - [`annotate_selection`]: stamps printed paths onto a diff tree and judges
//!   them for file-search tasks
//! - [`diff_stdout`]: line comparison under a per-task [`ComparisonPolicy`]
//! - [`PathResolver`] / [`ObservedOutput`]: turning terminal text into paths
//!
//! # Example
//!
//! ```rust,ignore
//! use termtask_verify::{annotate_selection, diff, TaskType};
//!
//! let mut result = diff(&current, &goal)?;
//! annotate_selection(&mut result, TaskType::FileSearch, &observed.paths(&resolver));
//! assert!(result.is_complete());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod diff;
mod error;
mod selection;
mod shell;
mod stdout;
mod tags;

pub use diff::{attribute_diff, diff, mark, DiffBody, DiffNode, DiffSummary, MISMATCH_SEPARATOR};
pub use error::DiffError;
pub use selection::{annotate_selection, TaskType, UnknownTaskType};
pub use shell::{ObservedOutput, PathResolver, DEFAULT_PROMPT_SEPARATOR};
pub use stdout::{
    diff_stdout, ComparisonPolicy, LineContext, LineTag, OutputTag, StdoutDiff, StdoutLine,
};
pub use tags::{DiffTags, Tag};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
