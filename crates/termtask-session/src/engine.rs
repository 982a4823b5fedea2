//! Session engine
//!
//! [`Engine`] is the entry point used by the transport layer. Every mutating
//! operation takes the study's lock, re-reads the persisted records, applies
//! its logic and writes back before the lock is released. Task sessions share
//! their study's lock because their ids carry the study id as a prefix.
//!
//! Callers that need several operations to run back to back take the lock
//! with [`Engine::lock`] and pass the guard to the `*_locked` variants. The
//! lock of a study that finished or closed with error is retired on release.
//!
//! Timeouts are detected lazily: `evaluate`, `reset`, `advance`, `pause` and
//! `refresh` compare the remaining time against the clock and close expired
//! task sessions as `time_out`.
//!
//! An infrastructure fault inside an operation closes the owning study with
//! `closed_with_error` (under the same lock) before the error is returned.

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, InfrastructureError, LockError, SandboxError};
use crate::lock::{SessionGuard, SessionLocks};
use crate::model::{
    ActionRecord, BlockOrder, CloseReason, Participant, Stage, StudySession, StudySessionId,
    StudyStatus, TaskSession, TaskSessionId, TaskStatus, ACTION_PAUSE, ACTION_RESET, ACTION_RESUME,
};
use crate::outcome::{
    Advance, CompletionSummary, Evaluation, ResetOutcome, StageReport, StageStats, Timing,
};
use crate::sandbox::{SandboxHandle, SandboxRuntime};
use crate::state_machine::{validate_study_transition, validate_task_transition};
use crate::store::{KeyValueStore, Repository};
use crate::task::{StudyPlan, Task, TaskCatalog};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use termtask_verify::{
    annotate_selection, diff, diff_stdout, DiffNode, LineContext, ObservedOutput, PathResolver,
    StdoutDiff, TaskType,
};

/// Verification and lifecycle engine
pub struct Engine {
    config: EngineConfig,
    catalog: Arc<TaskCatalog>,
    plan: StudyPlan,
    repo: Repository,
    runtime: Arc<dyn SandboxRuntime>,
    locks: SessionLocks,
    clock: Arc<dyn Clock>,
    resolver: PathResolver,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("tasks", &self.catalog.len())
            .field("plan", &self.plan)
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine
    ///
    /// # Errors
    /// Returns error if the configuration is invalid or the study plan names
    /// tasks missing from `catalog`
    pub fn new(
        config: EngineConfig,
        catalog: TaskCatalog,
        store: Arc<dyn KeyValueStore>,
        runtime: Arc<dyn SandboxRuntime>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let plan = config
            .plan
            .clone()
            .unwrap_or_else(|| StudyPlan::from_catalog(&catalog));
        plan.validate(&catalog)?;

        tracing::info!(
            tasks = catalog.len(),
            block_one = plan.block_one.len(),
            block_two = plan.block_two.len(),
            training = plan.training.len(),
            "engine ready"
        );

        Ok(Self {
            resolver: PathResolver::new(config.home_dir.clone()),
            locks: SessionLocks::new().with_timeout(config.lock_timeout()),
            config,
            catalog: Arc::new(catalog),
            plan,
            repo: Repository::new(store),
            runtime,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replace the time source
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn catalog(&self) -> &TaskCatalog {
        &self.catalog
    }

    #[inline]
    #[must_use]
    pub fn plan(&self) -> &StudyPlan {
        &self.plan
    }

    #[inline]
    #[must_use]
    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    #[inline]
    #[must_use]
    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    // --- Locking ---

    /// Acquire the lock guarding a study session and its task sessions
    ///
    /// `session_id` may name either a study session or a task session.
    ///
    /// # Errors
    /// Returns error on a malformed id or lock timeout
    pub async fn lock(&self, session_id: &str) -> Result<SessionGuard, EngineError> {
        let study = study_of(session_id)?;
        Ok(self.locks.lock(study.as_str()).await?)
    }

    /// Release a lock taken with [`lock`](Self::lock)
    pub fn unlock(&self, guard: SessionGuard) {
        self.locks.unlock(guard);
    }

    // --- Participants and study sessions ---

    /// Register a participant
    ///
    /// # Errors
    /// Returns error if the access code is taken or the store fails
    pub async fn register_participant(
        &self,
        first_name: &str,
        last_name: &str,
        block_order: BlockOrder,
    ) -> Result<Participant, EngineError> {
        let code = Participant::access_code(first_name, last_name);
        let _guard = self.locks.lock(&format!("participant/{code}")).await?;
        if self.repo.participant(&code).await?.is_some() {
            return Err(EngineError::DuplicateParticipant(code));
        }
        let participant = Participant {
            code,
            first_name: first_name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            block_order,
            registered_at: self.clock.now(),
        };
        self.repo.put_participant(&participant).await?;
        tracing::info!(participant = %participant.code, "participant registered");
        Ok(participant)
    }

    /// Start a study session for a registered participant
    ///
    /// # Errors
    /// Returns error if the participant is unknown or the store fails
    pub async fn create_study_session(&self, participant: &str) -> Result<StudySession, EngineError> {
        let participant = self
            .repo
            .participant(participant)
            .await?
            .ok_or_else(|| EngineError::UnknownParticipant(participant.to_string()))?;
        let (tasks, switch_point) = self.plan.sequence(participant.block_order);
        let now = self.clock.now();

        let study = StudySession {
            id: StudySessionId::generate(),
            participant: participant.code,
            status: StudyStatus::ReadingConsent,
            total_tasks: u32::try_from(tasks.len()).unwrap_or(u32::MAX),
            tasks,
            switch_point,
            num_tasks_completed: 0,
            half_stage_time_left: self.config.stage_duration(),
            budget_stage: None,
            current_task_session: None,
            task_seq: 0,
            outcomes: crate::model::OutcomeTally::default(),
            created_at: now,
            closed_at: None,
        };
        self.repo.put_study(&study).await?;
        tracing::info!(
            study = %study.id,
            participant = %study.participant,
            switch_point,
            total = study.total_tasks,
            "study session created"
        );
        Ok(study)
    }

    /// Participant accepted the consent form
    ///
    /// # Errors
    /// Returns error unless the study is reading consent
    pub async fn sign_consent(&self, id: &StudySessionId) -> Result<StudySession, EngineError> {
        let guard = self.locks.lock(id.as_str()).await?;
        self.sign_consent_locked(&guard, id).await
    }

    /// [`sign_consent`](Self::sign_consent) under a lock the caller holds
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] if `guard` does not cover `id`, otherwise
    /// as [`sign_consent`](Self::sign_consent)
    pub async fn sign_consent_locked(
        &self,
        guard: &SessionGuard,
        id: &StudySessionId,
    ) -> Result<StudySession, EngineError> {
        self.check_guard(guard, id)?;
        let result = async {
            let mut study = self.load_study(id).await?;
            if study.status != StudyStatus::ReadingConsent {
                return Err(invalid_state(&study, "sign consent"));
            }
            set_study_status(&mut study, StudyStatus::ReadingInstructions)?;
            self.repo.put_study(&study).await?;
            Ok(study)
        }
        .await;
        self.settle(guard, id, result).await
    }

    /// Participant finished the instructions; starts the first task session
    ///
    /// # Errors
    /// Returns error unless the study is reading instructions
    pub async fn finish_instructions(&self, id: &StudySessionId) -> Result<Advance, EngineError> {
        let guard = self.locks.lock(id.as_str()).await?;
        self.finish_instructions_locked(&guard, id).await
    }

    /// [`finish_instructions`](Self::finish_instructions) under a lock the caller holds
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] if `guard` does not cover `id`, otherwise
    /// as [`finish_instructions`](Self::finish_instructions)
    pub async fn finish_instructions_locked(
        &self,
        guard: &SessionGuard,
        id: &StudySessionId,
    ) -> Result<Advance, EngineError> {
        self.check_guard(guard, id)?;
        let result = async {
            let mut study = self.load_study(id).await?;
            if study.status != StudyStatus::ReadingInstructions {
                return Err(invalid_state(&study, "finish instructions"));
            }
            let outcome = self.start_next(&mut study, self.clock.now()).await?;
            self.repo.put_study(&study).await?;
            Ok(outcome)
        }
        .await;
        self.settle_advance(guard, id, result).await
    }

    /// Close the current task session (if still open) and start the next one
    ///
    /// An expired session closes as `time_out` regardless of `reason`. A
    /// session already closed by [`evaluate`](Self::evaluate) or
    /// [`refresh`](Self::refresh) is counted once and `reason` is ignored.
    ///
    /// # Errors
    /// Returns error if the study is not in a task stage, on illegal
    /// transitions, or on infrastructure faults
    pub async fn advance(
        &self,
        id: &StudySessionId,
        reason: CloseReason,
    ) -> Result<Advance, EngineError> {
        let guard = self.locks.lock(id.as_str()).await?;
        self.advance_locked(&guard, id, reason).await
    }

    /// [`advance`](Self::advance) under a lock the caller holds
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] if `guard` does not cover `id`, otherwise
    /// as [`advance`](Self::advance)
    pub async fn advance_locked(
        &self,
        guard: &SessionGuard,
        id: &StudySessionId,
        reason: CloseReason,
    ) -> Result<Advance, EngineError> {
        self.check_guard(guard, id)?;
        let result = self.advance_inner(id, reason).await;
        self.settle_advance(guard, id, result).await
    }

    async fn advance_inner(
        &self,
        id: &StudySessionId,
        reason: CloseReason,
    ) -> Result<Advance, EngineError> {
        let now = self.clock.now();
        let mut study = self.load_study(id).await?;
        if !matches!(
            study.status,
            StudyStatus::Training | StudyStatus::Running | StudyStatus::Paused
        ) {
            return Err(invalid_state(&study, "advance"));
        }

        if let Some(current) = study.current_task_session.clone() {
            let mut ts = self.load_task_session(&current).await?;
            if ts.status.is_open() {
                let status = if ts.is_expired(now) {
                    TaskStatus::TimeOut
                } else {
                    reason.into()
                };
                self.close_task(&mut ts, status, now).await?;
            }
            account(&mut study, &mut ts);
            self.repo.put_task_session(&ts).await?;
        }

        let outcome = self.start_next(&mut study, now).await?;
        self.repo.put_study(&study).await?;
        Ok(outcome)
    }

    /// Create the next task session, or finish the study
    async fn start_next(
        &self,
        study: &mut StudySession,
        now: DateTime<Utc>,
    ) -> Result<Advance, EngineError> {
        let stage = study.progress_stage();
        if stage == Stage::III {
            set_study_status(study, StudyStatus::Finished)?;
            study.current_task_session = None;
            study.closed_at = Some(now);
            let summary = CompletionSummary {
                num_passed: study.outcomes.passed,
                num_quit: study.outcomes.quit,
                num_timed_out: study.outcomes.timed_out,
                num_total: study.total_tasks,
            };
            tracing::info!(study = %study.id, passed = summary.num_passed, "study finished");
            return Ok(Advance::Complete(summary));
        }

        let entering_stage = study.budget_stage != Some(stage);
        let training_task = if entering_stage {
            self.plan.training_for(stage)
        } else {
            None
        };
        let (task_id, training) = match training_task {
            Some(task) => (task, true),
            None => {
                let slot = study.num_tasks_completed as usize;
                let task = study
                    .tasks
                    .get(slot)
                    .copied()
                    .ok_or_else(|| EngineError::missing_record("task slot", format!("{}#{slot}", study.id)))?;
                (task, false)
            }
        };
        let target = if training {
            StudyStatus::Training
        } else {
            StudyStatus::Running
        };
        if study.status != target {
            validate_study_transition(study.status, target)?;
        }
        let task = self.task(task_id)?;

        if entering_stage {
            study.budget_stage = Some(stage);
            study.half_stage_time_left = self.config.stage_duration();
            tracing::info!(study = %study.id, %stage, "stage started");
        }

        let id = study.next_task_session_id();
        let allotted = task.duration.min(study.half_stage_time_left);
        let handle = self.runtime.create_sandbox(&id, &task.seed()).await?;
        let ts = TaskSession {
            id,
            task: task_id,
            stage,
            training,
            status: TaskStatus::Running,
            sandbox: Some(handle.clone()),
            started_at: now,
            last_resume: now,
            allotted,
            time_left: allotted,
            time_spent: None,
            ended_at: None,
            accounted: false,
        };
        if let Err(e) = self.repo.put_task_session(&ts).await {
            self.discard(&handle).await;
            return Err(e.into());
        }

        set_study_status(study, target)?;
        study.current_task_session = Some(ts.id.clone());
        tracing::info!(
            study = %study.id,
            task_session = %ts.id,
            task = %task_id,
            training,
            allotted_secs = allotted.as_secs(),
            "task session started"
        );
        Ok(Advance::Next {
            task_session: ts.id,
            training,
            stage,
        })
    }

    // --- Task sessions ---

    /// Check a task session against its goal after a command
    ///
    /// Filesystem goals are compared with a fresh sandbox snapshot and the
    /// paths printed in `observed` are judged for file-search tasks. Stdout
    /// tasks compare `observed` with the goal output under the task's policy.
    /// A completed session is closed as `passed` and its sandbox destroyed.
    ///
    /// # Errors
    /// Returns error if the session is not running, or on infrastructure faults
    pub async fn evaluate(
        &self,
        id: &TaskSessionId,
        observed: &ObservedOutput,
    ) -> Result<Evaluation, EngineError> {
        let guard = self.locks.lock(id.study().as_str()).await?;
        self.evaluate_locked(&guard, id, observed).await
    }

    /// [`evaluate`](Self::evaluate) under a lock the caller holds
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] if `guard` does not cover the session's
    /// study, otherwise as [`evaluate`](Self::evaluate)
    pub async fn evaluate_locked(
        &self,
        guard: &SessionGuard,
        id: &TaskSessionId,
        observed: &ObservedOutput,
    ) -> Result<Evaluation, EngineError> {
        self.check_guard(guard, id.study())?;
        let result = self.evaluate_inner(id, observed).await;
        self.settle(guard, id.study(), result).await
    }

    /// [`evaluate`](Self::evaluate) using the sandbox's own transcript
    ///
    /// # Errors
    /// See [`evaluate`](Self::evaluate)
    pub async fn evaluate_transcript(&self, id: &TaskSessionId) -> Result<Evaluation, EngineError> {
        let guard = self.locks.lock(id.study().as_str()).await?;
        self.evaluate_transcript_locked(&guard, id).await
    }

    /// [`evaluate_transcript`](Self::evaluate_transcript) under a lock the caller holds
    ///
    /// # Errors
    /// See [`evaluate_locked`](Self::evaluate_locked)
    pub async fn evaluate_transcript_locked(
        &self,
        guard: &SessionGuard,
        id: &TaskSessionId,
    ) -> Result<Evaluation, EngineError> {
        self.check_guard(guard, id.study())?;
        let result = async {
            let ts = self.load_task_session(id).await?;
            if ts.status != TaskStatus::Running {
                return Err(not_active(&ts));
            }
            let handle = bound_sandbox(&ts)?;
            let text = self.runtime.current_stdout(&handle).await?;
            let observed = ObservedOutput::from_transcript(&text, &self.config.prompt_separator);
            self.evaluate_inner(id, &observed).await
        }
        .await;
        self.settle(guard, id.study(), result).await
    }

    async fn evaluate_inner(
        &self,
        id: &TaskSessionId,
        observed: &ObservedOutput,
    ) -> Result<Evaluation, EngineError> {
        let now = self.clock.now();
        let study = self.load_study(id.study()).await?;
        if study.status.is_terminal() {
            return Err(invalid_state(&study, "evaluate"));
        }
        let mut ts = self.load_task_session(id).await?;
        // Commands sent to a closed or paused session are not recorded
        if ts.status != TaskStatus::Running {
            return Err(not_active(&ts));
        }
        let action = observed
            .command
            .clone()
            .unwrap_or_else(|| observed.lines.join("\n"));
        self.record(id, action, now).await?;

        if ts.is_expired(now) {
            self.close_task(&mut ts, TaskStatus::TimeOut, now).await?;
            self.repo.put_task_session(&ts).await?;
            return Ok(Evaluation {
                task_session: ts.id,
                status: TaskStatus::TimeOut,
                completed: false,
                filesystem_diff: None,
                stdout_diff: None,
            });
        }

        let task = self.task(ts.task)?;
        let handle = bound_sandbox(&ts)?;
        let (filesystem_diff, stdout_diff) = self.judge(task, &handle, observed).await?;
        let completed = match task.task_type {
            TaskType::Stdout => stdout_diff.as_ref().is_some_and(StdoutDiff::is_correct),
            TaskType::FileSearch | TaskType::FilesystemChange => {
                filesystem_diff.as_ref().is_some_and(DiffNode::is_complete)
            }
        };

        if completed {
            self.close_task(&mut ts, TaskStatus::Passed, now).await?;
        }
        self.repo.put_task_session(&ts).await?;

        if let Some(fs) = &filesystem_diff {
            let summary = fs.summary();
            tracing::debug!(
                task_session = %id,
                correct = summary.correct,
                incorrect = summary.incorrect,
                extra = summary.extra,
                missing = summary.missing,
                "filesystem diff"
            );
        }
        Ok(Evaluation {
            task_session: ts.id,
            status: ts.status,
            completed,
            filesystem_diff,
            stdout_diff,
        })
    }

    async fn judge(
        &self,
        task: &Task,
        handle: &SandboxHandle,
        observed: &ObservedOutput,
    ) -> Result<(Option<DiffNode>, Option<StdoutDiff>), EngineError> {
        let filesystem_diff = match &task.goal_filesystem {
            Some(goal) => {
                let current = self.runtime.snapshot(handle, &task.attributes).await?;
                let mut result = diff(&current, goal)?;
                annotate_selection(&mut result, task.task_type, &observed.paths(&self.resolver));
                Some(result)
            }
            None => None,
        };

        let stdout_diff = match (task.task_type, &task.goal_stdout) {
            (TaskType::Stdout, Some(goal)) => {
                let policy = self
                    .catalog
                    .policy(task.id)
                    .ok_or(EngineError::UnknownTask(task.id))?;
                let ctx = LineContext {
                    resolver: &self.resolver,
                    actual_cwd: observed.cwd.as_deref(),
                    goal_cwd: Some(&task.goal_working_dir),
                };
                Some(diff_stdout(&observed.lines, goal, policy, &ctx))
            }
            _ => None,
        };
        Ok((filesystem_diff, stdout_diff))
    }

    /// Replace a running task session's sandbox with a fresh one
    ///
    /// The old sandbox is destroyed and its binding persisted as released
    /// before the new one is created.
    ///
    /// # Errors
    /// Returns error if the session is not running, or on infrastructure faults
    pub async fn reset(&self, id: &TaskSessionId) -> Result<ResetOutcome, EngineError> {
        let guard = self.locks.lock(id.study().as_str()).await?;
        self.reset_locked(&guard, id).await
    }

    /// [`reset`](Self::reset) under a lock the caller holds
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] if `guard` does not cover the session's
    /// study, otherwise as [`reset`](Self::reset)
    pub async fn reset_locked(
        &self,
        guard: &SessionGuard,
        id: &TaskSessionId,
    ) -> Result<ResetOutcome, EngineError> {
        self.check_guard(guard, id.study())?;
        let result = self.reset_inner(id).await;
        self.settle(guard, id.study(), result).await
    }

    async fn reset_inner(&self, id: &TaskSessionId) -> Result<ResetOutcome, EngineError> {
        let now = self.clock.now();
        let mut ts = self.load_task_session(id).await?;
        if ts.status != TaskStatus::Running {
            return Err(not_active(&ts));
        }
        if ts.is_expired(now) {
            self.close_task(&mut ts, TaskStatus::TimeOut, now).await?;
            self.repo.put_task_session(&ts).await?;
            return Ok(ResetOutcome {
                sandbox: None,
                filesystem_diff: None,
                status: TaskStatus::TimeOut,
            });
        }
        self.record(id, ACTION_RESET.to_string(), now).await?;

        let task = self.task(ts.task)?;
        self.release_sandbox(&mut ts).await?;
        self.repo.put_task_session(&ts).await?;

        let handle = self.bind_new_sandbox(&mut ts, task).await?;
        let filesystem_diff = match &task.goal_filesystem {
            Some(goal) => {
                let current = self.runtime.snapshot(&handle, &task.attributes).await?;
                Some(diff(&current, goal)?)
            }
            None => None,
        };
        tracing::info!(task_session = %id, sandbox = %handle, "task session reset");
        Ok(ResetOutcome {
            sandbox: Some(handle),
            filesystem_diff,
            status: ts.status,
        })
    }

    /// Remaining time of a task session and its stage
    ///
    /// Closes the session as `time_out` if its time has run out.
    ///
    /// # Errors
    /// Returns error on infrastructure faults
    pub async fn refresh(&self, id: &TaskSessionId) -> Result<Timing, EngineError> {
        let guard = self.locks.lock(id.study().as_str()).await?;
        self.refresh_locked(&guard, id).await
    }

    /// [`refresh`](Self::refresh) under a lock the caller holds
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] if `guard` does not cover the session's
    /// study, otherwise as [`refresh`](Self::refresh)
    pub async fn refresh_locked(
        &self,
        guard: &SessionGuard,
        id: &TaskSessionId,
    ) -> Result<Timing, EngineError> {
        self.check_guard(guard, id.study())?;
        let result = async {
            let now = self.clock.now();
            let study = self.load_study(id.study()).await?;
            let mut ts = self.load_task_session(id).await?;
            if ts.is_expired(now) {
                self.close_task(&mut ts, TaskStatus::TimeOut, now).await?;
                self.repo.put_task_session(&ts).await?;
            }
            let stage_time_left = if ts.training || ts.accounted {
                study.half_stage_time_left
            } else {
                study.half_stage_time_left.saturating_sub(ts.active_time(now))
            };
            Ok(Timing {
                status: ts.status,
                time_left: ts.remaining(now),
                stage_time_left,
            })
        }
        .await;
        self.settle(guard, id.study(), result).await
    }

    /// Suspend the current task session; its sandbox is released
    ///
    /// # Errors
    /// Returns error unless a task session is running
    pub async fn pause(&self, id: &StudySessionId) -> Result<Timing, EngineError> {
        let guard = self.locks.lock(id.as_str()).await?;
        self.pause_locked(&guard, id).await
    }

    /// [`pause`](Self::pause) under a lock the caller holds
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] if `guard` does not cover `id`, otherwise
    /// as [`pause`](Self::pause)
    pub async fn pause_locked(
        &self,
        guard: &SessionGuard,
        id: &StudySessionId,
    ) -> Result<Timing, EngineError> {
        self.check_guard(guard, id)?;
        let result = self.pause_inner(id).await;
        self.settle(guard, id, result).await
    }

    async fn pause_inner(&self, id: &StudySessionId) -> Result<Timing, EngineError> {
        let now = self.clock.now();
        let mut study = self.load_study(id).await?;
        if !matches!(study.status, StudyStatus::Training | StudyStatus::Running) {
            return Err(invalid_state(&study, "pause"));
        }
        let mut ts = self.current_task_session(&study).await?;
        if ts.status != TaskStatus::Running {
            return Err(not_active(&ts));
        }
        if ts.is_expired(now) {
            self.close_task(&mut ts, TaskStatus::TimeOut, now).await?;
            self.repo.put_task_session(&ts).await?;
            return Ok(Timing {
                status: ts.status,
                time_left: Duration::ZERO,
                stage_time_left: study.half_stage_time_left,
            });
        }

        validate_task_transition(ts.status, TaskStatus::Paused)?;
        validate_study_transition(study.status, StudyStatus::Paused)?;
        ts.time_left = ts.remaining(now);
        ts.status = TaskStatus::Paused;
        self.record(&ts.id, ACTION_PAUSE.to_string(), now).await?;
        self.release_sandbox(&mut ts).await?;
        self.repo.put_task_session(&ts).await?;

        set_study_status(&mut study, StudyStatus::Paused)?;
        self.repo.put_study(&study).await?;
        tracing::info!(study = %id, task_session = %ts.id, "paused");

        let stage_time_left = if ts.training {
            study.half_stage_time_left
        } else {
            study.half_stage_time_left.saturating_sub(ts.active_time(now))
        };
        Ok(Timing {
            status: ts.status,
            time_left: ts.time_left,
            stage_time_left,
        })
    }

    /// Continue a paused study with a fresh sandbox
    ///
    /// A current task session that is missing, or neither running nor
    /// paused, closes the study with `closed_with_error`.
    ///
    /// # Errors
    /// Returns error unless the study is paused, or on infrastructure faults
    pub async fn resume(&self, id: &StudySessionId) -> Result<TaskSession, EngineError> {
        let guard = self.locks.lock(id.as_str()).await?;
        self.resume_locked(&guard, id).await
    }

    /// [`resume`](Self::resume) under a lock the caller holds
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] if `guard` does not cover `id`, otherwise
    /// as [`resume`](Self::resume)
    pub async fn resume_locked(
        &self,
        guard: &SessionGuard,
        id: &StudySessionId,
    ) -> Result<TaskSession, EngineError> {
        self.check_guard(guard, id)?;
        let result = self.resume_inner(id).await;
        self.settle(guard, id, result).await
    }

    async fn resume_inner(&self, id: &StudySessionId) -> Result<TaskSession, EngineError> {
        let now = self.clock.now();
        let mut study = self.load_study(id).await?;
        if study.status != StudyStatus::Paused {
            return Err(invalid_state(&study, "resume"));
        }
        let mut ts = self.current_task_session(&study).await?;
        ensure_open(&ts)?;
        let target = if ts.training {
            StudyStatus::Training
        } else {
            StudyStatus::Running
        };
        validate_study_transition(study.status, target)?;
        if ts.status == TaskStatus::Paused {
            validate_task_transition(ts.status, TaskStatus::Running)?;
        }
        let task = self.task(ts.task)?;

        self.release_sandbox(&mut ts).await?;
        ts.status = TaskStatus::Running;
        ts.last_resume = now;
        self.record(&ts.id, ACTION_RESUME.to_string(), now).await?;
        self.bind_new_sandbox(&mut ts, task).await?;

        set_study_status(&mut study, target)?;
        self.repo.put_study(&study).await?;
        tracing::info!(study = %id, task_session = %ts.id, "resumed");
        Ok(ts)
    }

    /// Find the study session a returning participant should continue
    ///
    /// Sessions still in consent or instructions are closed. Sessions with a
    /// task in progress are checked; the most recent healthy one is returned
    /// and every other open session is closed with error.
    ///
    /// # Errors
    /// Returns error on infrastructure faults while scanning
    pub async fn recover(&self, participant: &str) -> Result<Option<StudySession>, EngineError> {
        let studies = self.repo.studies_of(participant).await?;
        let mut healthy: Vec<StudySession> = Vec::new();

        for candidate in studies.into_iter().filter(|s| !s.status.is_terminal()) {
            let guard = self.locks.lock(candidate.id.as_str()).await?;
            let Some(study) = self.repo.study(&candidate.id).await? else {
                continue;
            };
            if study.status.is_terminal() {
                continue;
            }
            if study.status.is_pre_task() {
                tracing::info!(study = %study.id, status = %study.status, "closing abandoned study");
                self.close_with_error(&study.id).await?;
                guard.retire();
                continue;
            }
            match self.current_task_session(&study).await.and_then(|ts| ensure_open(&ts)) {
                Ok(()) => healthy.push(study),
                Err(e) => {
                    tracing::warn!(study = %study.id, error = %e, "study failed integrity check");
                    self.close_with_error(&study.id).await?;
                    guard.retire();
                }
            }
        }

        let keep = healthy.pop();
        for stale in healthy {
            let guard = self.locks.lock(stale.id.as_str()).await?;
            tracing::warn!(study = %stale.id, "closing superseded study");
            self.close_with_error(&stale.id).await?;
            guard.retire();
        }
        Ok(keep)
    }

    /// Per-stage active time and completion rate of a finished study
    ///
    /// # Errors
    /// Returns error unless the study has finished
    pub async fn stage_report(&self, id: &StudySessionId) -> Result<StageReport, EngineError> {
        let study = self.load_study(id).await?;
        if study.status != StudyStatus::Finished {
            return Err(invalid_state(&study, "report"));
        }
        let sessions = self.repo.task_sessions_of(id).await?;
        let now = self.clock.now();

        let stages = [Stage::I, Stage::II]
            .into_iter()
            .map(|stage| {
                let real = sessions.iter().filter(|s| !s.training && s.stage == stage);
                let (mut active_time, mut attempted, mut passed) = (Duration::ZERO, 0u32, 0u32);
                for session in real {
                    active_time += session.active_time(now);
                    attempted += 1;
                    if session.status == TaskStatus::Passed {
                        passed += 1;
                    }
                }
                let completion_rate = if attempted == 0 {
                    0.0
                } else {
                    f64::from(passed) / f64::from(attempted)
                };
                StageStats {
                    stage,
                    active_time,
                    attempted,
                    passed,
                    completion_rate,
                }
            })
            .collect();
        Ok(StageReport { stages })
    }

    /// Audit trail of a task session
    ///
    /// # Errors
    /// Returns error on store faults
    pub async fn actions(&self, id: &TaskSessionId) -> Result<Vec<ActionRecord>, EngineError> {
        Ok(self.repo.actions(id).await?)
    }

    // --- Helpers ---

    fn task(&self, id: crate::model::TaskId) -> Result<&Task, EngineError> {
        self.catalog.get(id).ok_or(EngineError::UnknownTask(id))
    }

    async fn load_study(&self, id: &StudySessionId) -> Result<StudySession, EngineError> {
        self.repo
            .study(id)
            .await?
            .ok_or_else(|| EngineError::missing_record("study session", id.as_str()))
    }

    async fn load_task_session(&self, id: &TaskSessionId) -> Result<TaskSession, EngineError> {
        self.repo
            .task_session(id)
            .await?
            .ok_or_else(|| EngineError::missing_record("task session", id.to_string()))
    }

    async fn current_task_session(&self, study: &StudySession) -> Result<TaskSession, EngineError> {
        let id = study
            .current_task_session
            .as_ref()
            .ok_or_else(|| EngineError::missing_record("current task session of", study.id.as_str()))?;
        self.load_task_session(id).await
    }

    async fn record(
        &self,
        id: &TaskSessionId,
        action: String,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.repo
            .append_action(&ActionRecord {
                task_session: id.clone(),
                action,
                timestamp: now,
            })
            .await?;
        Ok(())
    }

    /// Move a task session to a closed status and release its sandbox
    async fn close_task(
        &self,
        ts: &mut TaskSession,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        validate_task_transition(ts.status, status)?;
        let spent = ts.active_time(now);
        ts.time_left = ts.remaining(now);
        ts.status = status;
        ts.time_spent = Some(spent);
        ts.ended_at = Some(now);
        self.release_sandbox(ts).await?;
        tracing::info!(
            task_session = %ts.id,
            %status,
            spent_secs = spent.as_secs(),
            "task session closed"
        );
        Ok(())
    }

    /// Destroy the bound sandbox, if any; a sandbox already gone counts as released
    async fn release_sandbox(&self, ts: &mut TaskSession) -> Result<(), EngineError> {
        let Some(handle) = ts.sandbox.clone() else {
            return Ok(());
        };
        match self.runtime.destroy_sandbox(&handle).await {
            Ok(()) => {}
            Err(SandboxError::NotFound(_)) => {
                tracing::warn!(task_session = %ts.id, sandbox = %handle, "sandbox already gone");
            }
            Err(e) => return Err(e.into()),
        }
        ts.sandbox = None;
        Ok(())
    }

    /// Create a sandbox for an unbound task session and persist the binding
    async fn bind_new_sandbox(
        &self,
        ts: &mut TaskSession,
        task: &Task,
    ) -> Result<SandboxHandle, EngineError> {
        debug_assert!(ts.sandbox.is_none());
        let handle = self.runtime.create_sandbox(&ts.id, &task.seed()).await?;
        ts.sandbox = Some(handle.clone());
        if let Err(e) = self.repo.put_task_session(ts).await {
            ts.sandbox = None;
            self.discard(&handle).await;
            return Err(e.into());
        }
        Ok(handle)
    }

    async fn discard(&self, handle: &SandboxHandle) {
        if let Err(e) = self.runtime.destroy_sandbox(handle).await {
            tracing::error!(sandbox = %handle, error = %e, "failed to discard sandbox");
        }
    }

    fn check_guard(&self, guard: &SessionGuard, study: &StudySessionId) -> Result<(), EngineError> {
        if self.locks.owns(guard) && guard.key() == study.as_str() {
            return Ok(());
        }
        Err(LockError::NotHeld {
            held: guard.key().to_string(),
            needed: study.to_string(),
        }
        .into())
    }

    /// Close the study on infrastructure faults; a closed study's lock is retired
    async fn settle<T>(
        &self,
        guard: &SessionGuard,
        study: &StudySessionId,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let result = self.fail_on_infrastructure(study, result).await;
        if result.as_ref().is_err_and(EngineError::is_infrastructure) {
            guard.retire();
        }
        result
    }

    async fn settle_advance(
        &self,
        guard: &SessionGuard,
        study: &StudySessionId,
        result: Result<Advance, EngineError>,
    ) -> Result<Advance, EngineError> {
        let result = self.settle(guard, study, result).await;
        if matches!(result, Ok(Advance::Complete(_))) {
            guard.retire();
        }
        result
    }

    async fn fail_on_infrastructure<T>(
        &self,
        study: &StudySessionId,
        result: Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        if let Err(err) = &result {
            if err.is_infrastructure() {
                tracing::warn!(study = %study, error = %err, "infrastructure fault");
                if let Err(close_err) = self.close_with_error(study).await {
                    tracing::error!(study = %study, error = %close_err, "could not close study");
                }
            }
        }
        result
    }

    /// Force a study to `closed_with_error`, releasing its current sandbox
    ///
    /// Callers hold the study's lock.
    async fn close_with_error(&self, id: &StudySessionId) -> Result<(), EngineError> {
        let Some(mut study) = self.repo.study(id).await? else {
            return Ok(());
        };
        if study.status.is_terminal() {
            return Ok(());
        }
        if let Some(current) = &study.current_task_session {
            if let Ok(Some(mut ts)) = self.repo.task_session(current).await {
                match self.release_sandbox(&mut ts).await {
                    Ok(()) => self.repo.put_task_session(&ts).await?,
                    Err(e) => {
                        tracing::error!(task_session = %ts.id, error = %e, "sandbox left behind");
                    }
                }
            }
        }
        set_study_status(&mut study, StudyStatus::ClosedWithError)?;
        study.closed_at = Some(self.clock.now());
        self.repo.put_study(&study).await?;
        tracing::warn!(study = %id, "study closed with error");
        Ok(())
    }
}

/// Fold a closed task session into its study's counters, once
fn account(study: &mut StudySession, ts: &mut TaskSession) {
    if ts.accounted || ts.status.is_open() {
        return;
    }
    ts.accounted = true;
    if ts.training {
        return;
    }
    study.num_tasks_completed += 1;
    study.outcomes.record(ts.status);
    let spent = ts.time_spent.unwrap_or_default();
    study.half_stage_time_left = study.half_stage_time_left.saturating_sub(spent);
}

fn set_study_status(study: &mut StudySession, to: StudyStatus) -> Result<(), EngineError> {
    if study.status == to {
        return Ok(());
    }
    validate_study_transition(study.status, to)?;
    tracing::info!(study = %study.id, from = %study.status, %to, "study status");
    study.status = to;
    Ok(())
}

fn ensure_open(ts: &TaskSession) -> Result<(), EngineError> {
    if ts.status.is_open() {
        Ok(())
    } else {
        Err(InfrastructureError::Inconsistent {
            id: ts.id.to_string(),
            status: ts.status,
        }
        .into())
    }
}

fn bound_sandbox(ts: &TaskSession) -> Result<SandboxHandle, EngineError> {
    ts.sandbox
        .clone()
        .ok_or_else(|| InfrastructureError::MissingSandbox(ts.id.to_string()).into())
}

fn not_active(ts: &TaskSession) -> EngineError {
    EngineError::NotActive {
        id: ts.id.to_string(),
        status: ts.status,
    }
}

fn invalid_state(study: &StudySession, operation: &'static str) -> EngineError {
    EngineError::InvalidStudyState {
        id: study.id.clone(),
        operation,
        status: study.status.to_string(),
    }
}

/// Study id behind a study or task session id
fn study_of(session_id: &str) -> Result<StudySessionId, EngineError> {
    let parsed = if session_id.contains('/') {
        session_id
            .parse::<TaskSessionId>()
            .map(|ts| ts.study().clone())
    } else {
        StudySessionId::parse(session_id)
    };
    parsed.map_err(EngineError::InvalidSessionId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_resolve_to_study() {
        assert_eq!(study_of("abc").unwrap().as_str(), "abc");
        assert_eq!(study_of("abc/task-4").unwrap().as_str(), "abc");
        assert!(matches!(study_of("abc/x"), Err(EngineError::InvalidSessionId(_))));
        assert!(study_of("").is_err());
    }

    #[test]
    fn accounting_happens_once() {
        let now = Utc::now();
        let mut study = StudySession {
            id: StudySessionId::generate(),
            participant: "p".to_string(),
            status: StudyStatus::Running,
            tasks: vec![],
            switch_point: 1,
            total_tasks: 2,
            num_tasks_completed: 0,
            half_stage_time_left: Duration::from_secs(100),
            budget_stage: Some(Stage::I),
            current_task_session: None,
            task_seq: 1,
            outcomes: crate::model::OutcomeTally::default(),
            created_at: now,
            closed_at: None,
        };
        let mut ts = TaskSession {
            id: TaskSessionId::new(study.id.clone(), 1),
            task: crate::model::TaskId(1),
            stage: Stage::I,
            training: false,
            status: TaskStatus::Passed,
            sandbox: None,
            started_at: now,
            last_resume: now,
            allotted: Duration::from_secs(60),
            time_left: Duration::from_secs(20),
            time_spent: Some(Duration::from_secs(40)),
            ended_at: Some(now),
            accounted: false,
        };
        account(&mut study, &mut ts);
        account(&mut study, &mut ts);
        assert_eq!(study.num_tasks_completed, 1);
        assert_eq!(study.outcomes.passed, 1);
        assert_eq!(study.half_stage_time_left, Duration::from_secs(60));
        assert_eq!(study.stage(), Stage::II);
    }

    #[test]
    fn training_sessions_do_not_count() {
        let now = Utc::now();
        let mut study = StudySession {
            id: StudySessionId::generate(),
            participant: "p".to_string(),
            status: StudyStatus::Training,
            tasks: vec![],
            switch_point: 1,
            total_tasks: 2,
            num_tasks_completed: 0,
            half_stage_time_left: Duration::from_secs(100),
            budget_stage: Some(Stage::I),
            current_task_session: None,
            task_seq: 1,
            outcomes: crate::model::OutcomeTally::default(),
            created_at: now,
            closed_at: None,
        };
        let mut ts = TaskSession {
            id: TaskSessionId::new(study.id.clone(), 1),
            task: crate::model::TaskId(9),
            stage: Stage::I,
            training: true,
            status: TaskStatus::Quit,
            sandbox: None,
            started_at: now,
            last_resume: now,
            allotted: Duration::from_secs(60),
            time_left: Duration::from_secs(0),
            time_spent: Some(Duration::from_secs(60)),
            ended_at: Some(now),
            accounted: false,
        };
        account(&mut study, &mut ts);
        assert!(ts.accounted);
        assert_eq!(study.num_tasks_completed, 0);
        assert_eq!(study.half_stage_time_left, Duration::from_secs(100));
    }
}
