use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use termtask_session::{
    Advance, BlockOrder, Clock, CloseReason, Engine, EngineConfig, EngineError, Stage, StudySessionId,
    StudyStatus, TaskSessionId, TaskStatus, ACTION_PAUSE, ACTION_RESET, ACTION_RESUME,
};
use termtask_test_utils::{
    file, sample_engine, sample_engine_with, solved_tree, InMemorySandboxRuntime, ManualClock,
    SAMPLE_TASK_SECS, TASK_BACKUP, TASK_DELETE_LOG, TASK_FIND_REPORT, TASK_LIST_FILES,
    TRAINING_ONE, TRAINING_TWO,
};
use termtask_verify::{ObservedOutput, Tag};

struct Harness {
    engine: Engine,
    runtime: Arc<InMemorySandboxRuntime>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    harness_with(EngineConfig::new())
}

fn harness_with(config: EngineConfig) -> Harness {
    let runtime = Arc::new(InMemorySandboxRuntime::new());
    let clock = Arc::new(ManualClock::fixed());
    let engine = sample_engine_with(config, Arc::clone(&runtime), Arc::clone(&clock));
    Harness {
        engine,
        runtime,
        clock,
    }
}

fn next(advance: Advance) -> (TaskSessionId, bool, Stage) {
    match advance {
        Advance::Next {
            task_session,
            training,
            stage,
        } => (task_session, training, stage),
        Advance::Complete(summary) => panic!("study finished early: {summary:?}"),
    }
}

/// Registers a participant and walks a new study up to its first task session
async fn begin(h: &Harness, first: &str, order: BlockOrder) -> (StudySessionId, TaskSessionId) {
    let participant = match h.engine.register_participant(first, "Tester", order).await {
        Ok(p) => p.code,
        Err(EngineError::DuplicateParticipant(code)) => code,
        Err(e) => panic!("{e}"),
    };
    let study = h.engine.create_study_session(&participant).await.unwrap();
    h.engine.sign_consent(&study.id).await.unwrap();
    let (ts, training, stage) = next(h.engine.finish_instructions(&study.id).await.unwrap());
    assert!(training);
    assert_eq!(stage, Stage::I);
    (study.id, ts)
}

async fn study_status(h: &Harness, id: &StudySessionId) -> StudyStatus {
    h.engine.repository().study(id).await.unwrap().unwrap().status
}

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

#[tokio::test]
async fn full_study_walks_training_and_both_stages() {
    let h = harness();
    let (study, training_one) = begin(&h, "Ada", BlockOrder::OneThenTwo).await;
    let ts = h.engine.repository().task_session(&training_one).await.unwrap().unwrap();
    assert_eq!(ts.task, TRAINING_ONE);
    assert_eq!(study_status(&h, &study).await, StudyStatus::Training);

    // training does not count
    let (backup, training, stage) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    assert!(!training);
    assert_eq!(stage, Stage::I);
    assert_eq!(study_status(&h, &study).await, StudyStatus::Running);

    h.clock.advance_secs(10);
    h.runtime.set_tree(&backup, solved_tree(h.engine.catalog(), TASK_BACKUP));
    let result = h.engine.evaluate(&backup, &ObservedOutput::default()).await.unwrap();
    assert!(result.completed);
    assert_eq!(result.status, TaskStatus::Passed);
    assert_eq!(h.runtime.live_for(&backup), 0);

    // reason is ignored for a session evaluate already closed
    let (search, _, stage) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    assert_eq!(stage, Stage::I);
    h.clock.advance_secs(10);
    let observed = ObservedOutput::new(lines(&["./docs/report.txt"]), Some("~/project".to_string()));
    let result = h.engine.evaluate(&search, &observed).await.unwrap();
    assert!(result.completed);

    let (training_two, training, stage) =
        next(h.engine.advance(&study, CloseReason::Passed).await.unwrap());
    assert!(training);
    assert_eq!(stage, Stage::II);
    let ts = h.engine.repository().task_session(&training_two).await.unwrap().unwrap();
    assert_eq!(ts.task, TRAINING_TWO);
    assert_eq!(study_status(&h, &study).await, StudyStatus::Training);

    let (listing, training, _) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    assert!(!training);
    h.clock.advance_secs(10);
    let observed = ObservedOutput::new(lines(&["a.txt", "b.txt"]), Some("~/project".to_string()));
    let result = h.engine.evaluate(&listing, &observed).await.unwrap();
    assert!(result.completed);
    assert!(result.filesystem_diff.is_none());
    assert!(result.stdout_diff.unwrap().is_correct());

    let (delete, _, stage) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    assert_eq!(stage, Stage::II);
    let ts = h.engine.repository().task_session(&delete).await.unwrap().unwrap();
    assert_eq!(ts.task, TASK_DELETE_LOG);
    h.clock.advance_secs(10);

    let Advance::Complete(summary) = h.engine.advance(&study, CloseReason::Quit).await.unwrap() else {
        panic!("expected study to finish");
    };
    assert_eq!(summary.num_passed, 3);
    assert_eq!(summary.num_quit, 1);
    assert_eq!(summary.num_timed_out, 0);
    assert_eq!(summary.num_total, 4);

    let record = h.engine.repository().study(&study).await.unwrap().unwrap();
    assert_eq!(record.status, StudyStatus::Finished);
    assert_eq!(record.stage(), Stage::III);
    assert!(record.current_task_session.is_none());
    assert_eq!(h.runtime.live_count(), 0);
    assert_eq!(h.runtime.max_live_per_owner(), 1);

    let report = h.engine.stage_report(&study).await.unwrap();
    assert_eq!(report.stages.len(), 2);
    let (one, two) = (&report.stages[0], &report.stages[1]);
    assert_eq!((one.stage, one.attempted, one.passed), (Stage::I, 2, 2));
    assert_eq!(one.active_time, Duration::from_secs(20));
    assert!((one.completion_rate - 1.0).abs() < f64::EPSILON);
    assert_eq!((two.stage, two.attempted, two.passed), (Stage::II, 2, 1));
    assert!((two.completion_rate - 0.5).abs() < f64::EPSILON);
}

#[tokio::test]
async fn reversed_block_order_starts_with_block_two() {
    let h = harness();
    let (study, _) = begin(&h, "Grace", BlockOrder::TwoThenOne).await;
    let (ts, _, _) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    let record = h.engine.repository().task_session(&ts).await.unwrap().unwrap();
    assert_eq!(record.task, TASK_LIST_FILES);
}

#[tokio::test]
async fn wrong_selection_keeps_task_open() {
    let h = harness();
    let (study, _) = begin(&h, "Alan", BlockOrder::OneThenTwo).await;
    next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    let (search, _, _) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    let record = h.engine.repository().task_session(&search).await.unwrap().unwrap();
    assert_eq!(record.task, TASK_FIND_REPORT);

    let observed = ObservedOutput::new(lines(&["todo.txt"]), Some("~/project".to_string()));
    let result = h.engine.evaluate(&search, &observed).await.unwrap();
    assert!(!result.completed);
    assert_eq!(result.status, TaskStatus::Running);

    let tree = result.filesystem_diff.unwrap();
    assert_eq!(tree.child("todo.txt").unwrap().tags.get(Tag::Selected), Some(1));
    let report = tree.child("docs").and_then(|d| d.child("report.txt")).unwrap();
    assert_eq!(report.tags.get(Tag::Selected), Some(-1));
    assert_eq!(tree.tags.get(Tag::ChIncorrect), Some(2));
    assert_eq!(h.runtime.live_for(&search), 1);
}

#[tokio::test]
async fn expired_session_times_out_lazily() {
    let h = harness();
    let (study, _) = begin(&h, "Edsger", BlockOrder::OneThenTwo).await;
    let (backup, _, _) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());

    h.clock.advance_secs(SAMPLE_TASK_SECS + 1);
    h.runtime.set_tree(&backup, solved_tree(h.engine.catalog(), TASK_BACKUP));
    let result = h.engine.evaluate(&backup, &ObservedOutput::default()).await.unwrap();
    assert_eq!(result.status, TaskStatus::TimeOut);
    assert!(!result.completed);
    assert!(result.filesystem_diff.is_none());
    assert_eq!(h.runtime.live_for(&backup), 0);

    let timing = h.engine.refresh(&backup).await.unwrap();
    assert_eq!(timing.status, TaskStatus::TimeOut);
    assert_eq!(timing.time_left, Duration::ZERO);

    let (search, _, _) = next(h.engine.advance(&study, CloseReason::Passed).await.unwrap());

    // never evaluated; advance detects the expiry itself
    h.clock.advance_secs(SAMPLE_TASK_SECS * 2);
    next(h.engine.advance(&study, CloseReason::Passed).await.unwrap());
    let closed = h.engine.repository().task_session(&search).await.unwrap().unwrap();
    assert_eq!(closed.status, TaskStatus::TimeOut);
    assert_eq!(closed.time_spent, Some(Duration::from_secs(SAMPLE_TASK_SECS)));

    let record = h.engine.repository().study(&study).await.unwrap().unwrap();
    assert_eq!(record.outcomes.timed_out, 2);
    assert_eq!(record.num_tasks_completed, 2);
}

#[tokio::test]
async fn stage_budget_caps_task_time() {
    let h = harness_with(EngineConfig::new().with_stage_duration(Duration::from_secs(150)));
    let (study, _) = begin(&h, "Barbara", BlockOrder::OneThenTwo).await;
    let (backup, _, _) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    let first = h.engine.repository().task_session(&backup).await.unwrap().unwrap();
    assert_eq!(first.allotted, Duration::from_secs(SAMPLE_TASK_SECS));

    h.clock.advance_secs(100);
    let (search, _, _) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    let second = h.engine.repository().task_session(&search).await.unwrap().unwrap();
    assert_eq!(second.allotted, Duration::from_secs(50));

    let timing = h.engine.refresh(&search).await.unwrap();
    assert_eq!(timing.stage_time_left, Duration::from_secs(50));
    h.clock.advance_secs(20);
    let timing = h.engine.refresh(&search).await.unwrap();
    assert_eq!(timing.time_left, Duration::from_secs(30));
    assert_eq!(timing.stage_time_left, Duration::from_secs(30));

    // stage II gets a fresh budget
    h.clock.advance_secs(10);
    let (training, is_training, stage) =
        next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    assert!(is_training);
    assert_eq!(stage, Stage::II);
    let ts = h.engine.repository().task_session(&training).await.unwrap().unwrap();
    assert_eq!(ts.allotted, Duration::from_secs(SAMPLE_TASK_SECS));
}

#[tokio::test]
async fn reset_replaces_sandbox() {
    let h = harness();
    let (study, _) = begin(&h, "Niklaus", BlockOrder::OneThenTwo).await;
    let (backup, _, _) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());

    h.runtime.add_to_root(&backup, file("junk.txt"));
    let before = h.runtime.handle_of(&backup).unwrap();
    let outcome = h.engine.reset(&backup).await.unwrap();

    let after = outcome.sandbox.unwrap();
    assert_ne!(after, before);
    assert!(!h.runtime.is_live(&before));
    assert!(h.runtime.is_live(&after));
    assert_eq!(outcome.status, TaskStatus::Running);

    let tree = outcome.filesystem_diff.unwrap();
    assert!(!tree.is_complete());
    assert!(tree.child("junk.txt").is_none());
    assert!(tree.child("backup").unwrap().tags.has(Tag::Missing));

    let record = h.engine.repository().task_session(&backup).await.unwrap().unwrap();
    assert_eq!(record.sandbox, Some(after));
    let actions = h.engine.actions(&backup).await.unwrap();
    assert_eq!(actions.last().unwrap().action, ACTION_RESET);
    assert_eq!(h.runtime.max_live_per_owner(), 1);
}

#[tokio::test]
async fn reset_after_expiry_reports_timeout() {
    let h = harness();
    let (_, training) = begin(&h, "Tony", BlockOrder::OneThenTwo).await;
    h.clock.advance_secs(SAMPLE_TASK_SECS);
    let outcome = h.engine.reset(&training).await.unwrap();
    assert_eq!(outcome.status, TaskStatus::TimeOut);
    assert!(outcome.sandbox.is_none());
    assert_eq!(h.runtime.live_count(), 0);
}

#[tokio::test]
async fn pause_freezes_time_and_resume_rebinds() {
    let h = harness();
    let (study, ts) = begin(&h, "Frances", BlockOrder::OneThenTwo).await;

    h.clock.advance_secs(30);
    let timing = h.engine.pause(&study).await.unwrap();
    assert_eq!(timing.status, TaskStatus::Paused);
    assert_eq!(timing.time_left, Duration::from_secs(SAMPLE_TASK_SECS - 30));
    assert_eq!(h.runtime.live_count(), 0);
    assert_eq!(study_status(&h, &study).await, StudyStatus::Paused);

    h.clock.advance_secs(500);
    let err = h.engine.evaluate(&ts, &ObservedOutput::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotActive { status: TaskStatus::Paused, .. }));
    let err = h.engine.pause(&study).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStudyState { .. }));

    let resumed = h.engine.resume(&study).await.unwrap();
    assert_eq!(resumed.status, TaskStatus::Running);
    assert!(h.runtime.is_live(resumed.sandbox.as_ref().unwrap()));
    assert_eq!(study_status(&h, &study).await, StudyStatus::Training);

    let timing = h.engine.refresh(&ts).await.unwrap();
    assert_eq!(timing.time_left, Duration::from_secs(SAMPLE_TASK_SECS - 30));
    h.clock.advance_secs(10);
    let timing = h.engine.refresh(&ts).await.unwrap();
    assert_eq!(timing.time_left, Duration::from_secs(SAMPLE_TASK_SECS - 40));

    let actions: Vec<String> = h
        .engine
        .actions(&ts)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.action)
        .collect();
    assert!(actions.contains(&ACTION_PAUSE.to_string()));
    assert!(actions.contains(&ACTION_RESUME.to_string()));
    assert_eq!(h.runtime.max_live_per_owner(), 1);
}

#[tokio::test]
async fn advance_while_paused_closes_paused_session() {
    let h = harness();
    let (study, ts) = begin(&h, "John", BlockOrder::OneThenTwo).await;
    h.engine.pause(&study).await.unwrap();
    next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());
    let closed = h.engine.repository().task_session(&ts).await.unwrap().unwrap();
    assert_eq!(closed.status, TaskStatus::Quit);
    assert_eq!(study_status(&h, &study).await, StudyStatus::Running);
}

#[tokio::test]
async fn transcript_is_parsed_from_sandbox() {
    let h = harness();
    let (study, _) = begin(&h, "Margaret", BlockOrder::TwoThenOne).await;
    let (listing, _, _) = next(h.engine.advance(&study, CloseReason::Quit).await.unwrap());

    h.runtime
        .push_output(&listing, "ls\na.txt\nb.txt\nparticipant@box:~/project$ ");
    let result = h.engine.evaluate_transcript(&listing).await.unwrap();
    assert!(result.completed);
    assert_eq!(result.status, TaskStatus::Passed);

    let actions = h.engine.actions(&listing).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, "ls");
}

#[tokio::test]
async fn commands_after_pass_are_not_recorded() {
    let h = harness();
    let (_, ts) = begin(&h, "Edsger", BlockOrder::OneThenTwo).await;
    h.runtime.set_tree(&ts, solved_tree(h.engine.catalog(), TRAINING_ONE));
    let observed = ObservedOutput {
        command: Some("touch hello.txt".to_string()),
        ..ObservedOutput::default()
    };
    assert!(h.engine.evaluate(&ts, &observed).await.unwrap().completed);
    assert_eq!(h.engine.actions(&ts).await.unwrap().len(), 1);

    let late = ObservedOutput {
        command: Some("rm hello.txt".to_string()),
        ..ObservedOutput::default()
    };
    let err = h.engine.evaluate(&ts, &late).await.unwrap_err();
    assert!(matches!(err, EngineError::NotActive { status: TaskStatus::Passed, .. }));
    let actions = h.engine.actions(&ts).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].action, "touch hello.txt");
}

#[tokio::test]
async fn active_time_agrees_with_action_history() {
    let h = harness();
    let (study, ts) = begin(&h, "Barbara", BlockOrder::OneThenTwo).await;
    h.clock.advance_secs(25);
    h.engine.pause(&study).await.unwrap();
    h.clock.advance_secs(300);
    h.engine.resume(&study).await.unwrap();
    h.clock.advance_secs(15);
    h.engine.pause(&study).await.unwrap();
    h.clock.advance_secs(60);
    h.engine.resume(&study).await.unwrap();
    h.clock.advance_secs(5);

    let now = h.clock.now();
    let record = h.engine.repository().task_session(&ts).await.unwrap().unwrap();
    let mut running_since = Some(record.started_at);
    let mut replayed = Duration::ZERO;
    for action in h.engine.actions(&ts).await.unwrap() {
        match action.action.as_str() {
            ACTION_PAUSE => {
                let since = running_since.take().unwrap();
                replayed += (action.timestamp - since).to_std().unwrap();
            }
            ACTION_RESUME => running_since = Some(action.timestamp),
            _ => {}
        }
    }
    replayed += (now - running_since.unwrap()).to_std().unwrap();

    assert_eq!(replayed, Duration::from_secs(45));
    assert_eq!(record.active_time(now), replayed);
}

#[tokio::test]
async fn registration_rejects_duplicates_and_unknown_codes() {
    let h = harness();
    let participant = h
        .engine
        .register_participant(" Ada ", "Lovelace", BlockOrder::OneThenTwo)
        .await
        .unwrap();
    assert_eq!(participant.code, "ada-lovelace");

    let err = h
        .engine
        .register_participant("ada", "LOVELACE", BlockOrder::TwoThenOne)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateParticipant(code) if code == "ada-lovelace"));

    let err = h.engine.create_study_session("nobody").await.unwrap_err();
    assert!(matches!(err, EngineError::UnknownParticipant(_)));
}

#[tokio::test]
async fn operations_out_of_order_are_rejected_without_closing() {
    let h = harness();
    let code = h
        .engine
        .register_participant("Ken", "Thompson", BlockOrder::OneThenTwo)
        .await
        .unwrap()
        .code;
    let study = h.engine.create_study_session(&code).await.unwrap();
    assert_eq!(study.stage(), Stage::O);

    let err = h.engine.advance(&study.id, CloseReason::Quit).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStudyState { .. }));
    let err = h.engine.finish_instructions(&study.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStudyState { .. }));

    h.engine.sign_consent(&study.id).await.unwrap();
    let err = h.engine.sign_consent(&study.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStudyState { .. }));
    assert_eq!(study_status(&h, &study.id).await, StudyStatus::ReadingInstructions);

    let (ts, _, _) = next(h.engine.finish_instructions(&study.id).await.unwrap());
    next(h.engine.advance(&study.id, CloseReason::Quit).await.unwrap());
    let err = h.engine.evaluate(&ts, &ObservedOutput::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotActive { status: TaskStatus::Quit, .. }));
    let err = h.engine.stage_report(&study.id).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidStudyState { .. }));
    assert_eq!(study_status(&h, &study.id).await, StudyStatus::Running);
}

#[tokio::test]
async fn recover_keeps_newest_healthy_study() {
    let h = harness();
    let (older, older_ts) = begin(&h, "Donald", BlockOrder::OneThenTwo).await;
    h.clock.advance_secs(1);
    let (newer, newer_ts) = begin(&h, "Donald", BlockOrder::OneThenTwo).await;
    h.clock.advance_secs(1);
    let abandoned = h.engine.create_study_session("donald-tester").await.unwrap();
    h.engine.sign_consent(&abandoned.id).await.unwrap();

    let kept = h.engine.recover("donald-tester").await.unwrap().unwrap();
    assert_eq!(kept.id, newer);
    assert_eq!(study_status(&h, &newer).await, StudyStatus::Training);
    assert_eq!(study_status(&h, &older).await, StudyStatus::ClosedWithError);
    assert_eq!(study_status(&h, &abandoned.id).await, StudyStatus::ClosedWithError);
    assert_eq!(h.runtime.live_for(&older_ts), 0);
    assert_eq!(h.runtime.live_for(&newer_ts), 1);
}

#[tokio::test]
async fn recover_closes_study_with_missing_task_session() {
    let h = harness();
    let (study, ts) = begin(&h, "Leslie", BlockOrder::OneThenTwo).await;
    h.engine
        .repository()
        .store()
        .delete(&format!("task_session/{ts}"))
        .await
        .unwrap();

    assert!(h.engine.recover("leslie-tester").await.unwrap().is_none());
    assert_eq!(study_status(&h, &study).await, StudyStatus::ClosedWithError);
}

#[tokio::test]
async fn sample_engine_has_two_blocks() {
    let runtime = Arc::new(InMemorySandboxRuntime::new());
    let engine = sample_engine(runtime, Arc::new(ManualClock::fixed()));
    assert_eq!(engine.plan().block_one, vec![TASK_BACKUP, TASK_FIND_REPORT]);
    assert_eq!(engine.plan().block_two, vec![TASK_LIST_FILES, TASK_DELETE_LOG]);
    assert_eq!(engine.plan().training, vec![TRAINING_ONE, TRAINING_TWO]);
}
