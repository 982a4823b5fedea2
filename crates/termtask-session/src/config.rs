//! Engine configuration
//!
//! Plain serde struct with defaults, loadable from TOML:
//!
//! ```toml
//! home_dir = "/home/participant"
//! stage_duration_secs = 1800
//! lock_timeout_ms = 5000
//! tasks_dir = "/srv/termtask/tasks"
//!
//! [plan]
//! block_one = [1, 2, 3]
//! block_two = [4, 5, 6]
//! training = [100, 101]
//! ```

use crate::error::ConfigError;
use crate::task::StudyPlan;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use termtask_verify::DEFAULT_PROMPT_SEPARATOR;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Absolute home directory of the sandbox user
    pub home_dir: String,
    /// Time budget of each task stage in seconds
    pub stage_duration_secs: u64,
    /// Task duration in seconds when a task file omits it
    pub default_task_duration_secs: u64,
    /// Bound on lock acquisition; `None` waits indefinitely
    pub lock_timeout_ms: Option<u64>,
    /// Prompt terminator in raw transcripts
    pub prompt_separator: String,
    /// Directory holding task definition files
    pub tasks_dir: Option<PathBuf>,
    /// Explicit task blocks; derived from the catalog when absent
    pub plan: Option<StudyPlan>,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With home directory
    #[inline]
    #[must_use]
    pub fn with_home_dir(mut self, home: impl Into<String>) -> Self {
        self.home_dir = home.into();
        self
    }

    /// With stage budget
    #[inline]
    #[must_use]
    pub fn with_stage_duration(mut self, duration: Duration) -> Self {
        self.stage_duration_secs = duration.as_secs();
        self
    }

    /// With default task duration
    #[inline]
    #[must_use]
    pub fn with_default_task_duration(mut self, duration: Duration) -> Self {
        self.default_task_duration_secs = duration.as_secs();
        self
    }

    /// With lock acquisition bound
    #[inline]
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// With explicit plan
    #[inline]
    #[must_use]
    pub fn with_plan(mut self, plan: StudyPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    /// With task definition directory
    #[inline]
    #[must_use]
    pub fn with_tasks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tasks_dir = Some(dir.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn stage_duration(&self) -> Duration {
        Duration::from_secs(self.stage_duration_secs)
    }

    #[inline]
    #[must_use]
    pub fn default_task_duration(&self) -> Duration {
        Duration::from_secs(self.default_task_duration_secs)
    }

    #[inline]
    #[must_use]
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns error on malformed TOML or invalid values
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is invalid
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check value constraints
    ///
    /// # Errors
    /// Returns the first invalid field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.home_dir.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "home_dir",
                reason: format!("'{}' is not absolute", self.home_dir),
            });
        }
        if self.stage_duration_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "stage_duration_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.prompt_separator.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "prompt_separator",
                reason: "must contain a non-space character".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            home_dir: "/home/participant".to_string(),
            stage_duration_secs: 1800,
            default_task_duration_secs: 300,
            lock_timeout_ms: None,
            prompt_separator: DEFAULT_PROMPT_SEPARATOR.to_string(),
            tasks_dir: None,
            plan: None,
        }
    }
}
