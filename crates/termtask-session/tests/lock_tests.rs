use futures::future::join_all;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use termtask_session::{
    Advance, BlockOrder, CloseReason, Engine, EngineConfig, EngineError, LockError,
    StudySessionId, StudyStatus, TaskSessionId, TaskStatus,
};
use termtask_test_utils::{
    sample_engine, sample_engine_with, solved_tree, InMemorySandboxRuntime, ManualClock,
    TASK_BACKUP,
};
use termtask_verify::ObservedOutput;

/// Real tasks closed after the first `n` advances from the first training task
const COMPLETED_AFTER: [u32; 6] = [0, 1, 2, 2, 3, 4];

#[derive(Debug, Clone)]
enum Op {
    Advance,
    Reset,
    Pause,
    Resume,
    Evaluate,
    Refresh,
    Tick(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Advance),
        Just(Op::Reset),
        Just(Op::Pause),
        Just(Op::Resume),
        Just(Op::Evaluate),
        Just(Op::Refresh),
        (1u64..90).prop_map(Op::Tick),
    ]
}

fn not_held(err: &EngineError) -> bool {
    matches!(err, EngineError::Lock(LockError::NotHeld { .. }))
}

fn engine_with(config: EngineConfig) -> (Arc<Engine>, Arc<InMemorySandboxRuntime>) {
    let runtime = Arc::new(InMemorySandboxRuntime::new());
    let engine = sample_engine_with(config, Arc::clone(&runtime), Arc::new(ManualClock::fixed()));
    (Arc::new(engine), runtime)
}

async fn start(engine: &Engine, first: &str) -> (StudySessionId, TaskSessionId) {
    let code = engine
        .register_participant(first, "Lock", BlockOrder::OneThenTwo)
        .await
        .unwrap()
        .code;
    let study = engine.create_study_session(&code).await.unwrap();
    engine.sign_consent(&study.id).await.unwrap();
    match engine.finish_instructions(&study.id).await.unwrap() {
        Advance::Next { task_session, .. } => (study.id, task_session),
        Advance::Complete(_) => panic!("study finished early"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_locked_read_modify_write_loses_nothing(workers in 2usize..16, yields in 0usize..4) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let total = rt.block_on(async move {
            let runtime = Arc::new(InMemorySandboxRuntime::new());
            let engine = Arc::new(sample_engine(runtime, Arc::new(ManualClock::fixed())));
            let study = StudySessionId::generate();

            let handles = (0..workers).map(|_| {
                let engine = Arc::clone(&engine);
                let key = study.as_str().to_string();
                tokio::spawn(async move {
                    let guard = engine.lock(&key).await.unwrap();
                    let store = engine.repository().store();
                    let n = store
                        .get("counter")
                        .await
                        .unwrap()
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0);
                    for _ in 0..yields {
                        tokio::task::yield_now().await;
                    }
                    store.put("counter", json!(n + 1)).await.unwrap();
                    engine.unlock(guard);
                })
            });
            for joined in join_all(handles).await {
                joined.unwrap();
            }
            engine
                .repository()
                .store()
                .get("counter")
                .await
                .unwrap()
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        });
        prop_assert_eq!(total, workers as u64);
    }

    #[test]
    fn prop_concurrent_advances_count_each_task_once(advances in 1usize..=8, evaluators in 0usize..4) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        let (record, rejected, unexpected, live, max_live) = rt.block_on(async move {
            let (engine, runtime) = engine_with(EngineConfig::new());
            let (study, _) = start(&engine, "Tally").await;

            let advancing = (0..advances).map(|_| {
                let engine = Arc::clone(&engine);
                let study = study.clone();
                tokio::spawn(async move { engine.advance(&study, CloseReason::Quit).await.map(drop) })
            });
            let evaluating = (0..evaluators).map(|_| {
                let engine = Arc::clone(&engine);
                let study = study.clone();
                tokio::spawn(async move {
                    let current = engine
                        .repository()
                        .study(&study)
                        .await
                        .unwrap()
                        .and_then(|s| s.current_task_session);
                    match current {
                        Some(ts) => engine.evaluate(&ts, &ObservedOutput::default()).await.map(drop),
                        None => Ok(()),
                    }
                })
            });
            let (advanced, evaluated) = futures::join!(join_all(advancing), join_all(evaluating));

            let mut rejected = 0;
            let mut unexpected = Vec::new();
            for result in advanced.into_iter().map(Result::unwrap) {
                match result {
                    Ok(()) => {}
                    Err(EngineError::InvalidStudyState { .. }) => rejected += 1,
                    Err(e) => unexpected.push(e.to_string()),
                }
            }
            for result in evaluated.into_iter().map(Result::unwrap) {
                match result {
                    Ok(()) | Err(EngineError::NotActive { .. } | EngineError::InvalidStudyState { .. }) => {}
                    Err(e) => unexpected.push(e.to_string()),
                }
            }

            let record = engine.repository().study(&study).await.unwrap().unwrap();
            (record, rejected, unexpected, runtime.live_count(), runtime.max_live_per_owner())
        });

        let expected = COMPLETED_AFTER[advances.min(6) - 1];
        prop_assert!(unexpected.is_empty(), "{:?}", unexpected);
        prop_assert_eq!(record.num_tasks_completed, expected);
        prop_assert_eq!(record.outcomes.quit, expected);
        prop_assert_eq!(record.outcomes.passed + record.outcomes.timed_out, 0);
        prop_assert_eq!(rejected, advances.saturating_sub(6));
        prop_assert_eq!(live, usize::from(advances < 6));
        prop_assert!(max_live <= 1);
        if advances >= 6 {
            prop_assert_eq!(record.status, StudyStatus::Finished);
        }
    }

    #[test]
    fn prop_running_sessions_hold_exactly_one_sandbox(ops in prop::collection::vec(op(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let violations = rt.block_on(async move {
            let runtime = Arc::new(InMemorySandboxRuntime::new());
            let clock = Arc::new(ManualClock::fixed());
            let engine = sample_engine(Arc::clone(&runtime), Arc::clone(&clock));
            let (study, _) = start(&engine, "Shuffle").await;
            let mut violations = Vec::new();

            for op in &ops {
                let current = engine
                    .repository()
                    .study(&study)
                    .await
                    .unwrap()
                    .and_then(|s| s.current_task_session);
                let result = match (op, &current) {
                    (Op::Advance, _) => engine.advance(&study, CloseReason::Quit).await.map(drop),
                    (Op::Pause, _) => engine.pause(&study).await.map(drop),
                    (Op::Resume, _) => engine.resume(&study).await.map(drop),
                    (Op::Tick(secs), _) => {
                        clock.advance_secs(*secs);
                        Ok(())
                    }
                    (Op::Reset, Some(ts)) => engine.reset(ts).await.map(drop),
                    (Op::Evaluate, Some(ts)) => {
                        engine.evaluate(ts, &ObservedOutput::default()).await.map(drop)
                    }
                    (Op::Refresh, Some(ts)) => engine.refresh(ts).await.map(drop),
                    (_, None) => Ok(()),
                };
                if let Err(e) = &result {
                    if e.is_infrastructure() {
                        violations.push(format!("{op:?}: {e}"));
                    }
                }

                for ts in engine.repository().task_sessions_of(&study).await.unwrap() {
                    let live = runtime.live_for(&ts.id);
                    let consistent = match ts.status {
                        TaskStatus::Running => {
                            live == 1 && ts.sandbox.as_ref().is_some_and(|h| runtime.is_live(h))
                        }
                        _ => live == 0 && ts.sandbox.is_none(),
                    };
                    if !consistent {
                        violations.push(format!("after {op:?}: {} is {} with {live} live", ts.id, ts.status));
                    }
                }
            }
            if runtime.max_live_per_owner() > 1 {
                violations.push(format!("{} live sandboxes for one session", runtime.max_live_per_owner()));
            }
            violations
        });
        prop_assert!(violations.is_empty(), "{:?}", violations);
    }
}

#[tokio::test]
async fn task_session_ids_share_their_study_lock() {
    let (engine, _) = engine_with(EngineConfig::new());
    let study = StudySessionId::generate();
    let guard = engine.lock(&format!("{study}/task-3")).await.unwrap();
    assert_eq!(guard.key(), study.as_str());
    assert!(engine.locks().try_lock(study.as_str()).is_none());
    engine.unlock(guard);
    assert!(engine.locks().try_lock(study.as_str()).is_some());
}

#[tokio::test]
async fn malformed_ids_are_rejected() {
    let (engine, _) = engine_with(EngineConfig::new());
    for id in ["", "a/b", "a/task-x", "/task-1"] {
        let err = engine.lock(id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSessionId(_)), "{id}");
    }
}

#[tokio::test]
async fn lock_timeout_fails_without_closing_study() {
    let config = EngineConfig::new().with_lock_timeout(Duration::from_millis(30));
    let (engine, _) = engine_with(config);
    let (study, ts) = start(&engine, "Held").await;

    let guard = engine.lock(study.as_str()).await.unwrap();
    let err = engine.evaluate(&ts, &ObservedOutput::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::Lock(_)));
    engine.unlock(guard);

    let record = engine.repository().study(&study).await.unwrap().unwrap();
    assert_eq!(record.status, StudyStatus::Training);
    assert!(engine.actions(&ts).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_evaluations_pass_once() {
    let (engine, runtime) = engine_with(EngineConfig::new());
    let (study, _) = start(&engine, "Race").await;
    let Advance::Next { task_session: ts, .. } =
        engine.advance(&study, CloseReason::Quit).await.unwrap()
    else {
        panic!("study finished early");
    };
    runtime.set_tree(&ts, solved_tree(engine.catalog(), TASK_BACKUP));

    let attempts = (0..8).map(|_| {
        let engine = Arc::clone(&engine);
        let ts = ts.clone();
        tokio::spawn(async move { engine.evaluate(&ts, &ObservedOutput::default()).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    let passed = results
        .iter()
        .filter(|r| matches!(r, Ok(e) if e.completed))
        .count();
    let inactive = results
        .iter()
        .filter(|r| matches!(r, Err(EngineError::NotActive { .. })))
        .count();
    assert_eq!(passed, 1);
    assert_eq!(inactive, 7);
    assert_eq!(runtime.max_live_per_owner(), 1);

    engine.advance(&study, CloseReason::Quit).await.unwrap();
    let record = engine.repository().study(&study).await.unwrap().unwrap();
    assert_eq!(record.outcomes.passed, 1);
    assert_eq!(record.outcomes.quit, 0);
}

#[tokio::test]
async fn operations_run_under_a_held_lock() {
    let (engine, runtime) = engine_with(EngineConfig::new());
    let (study, ts) = start(&engine, "Holder").await;

    let guard = engine.lock(&ts.to_string()).await.unwrap();
    let held = tokio::time::timeout(Duration::from_secs(5), async {
        let evaluation = engine
            .evaluate_locked(&guard, &ts, &ObservedOutput::default())
            .await?;
        let reset = engine.reset_locked(&guard, &ts).await?;
        let timing = engine.refresh_locked(&guard, &ts).await?;
        Ok::<_, EngineError>((evaluation, reset, timing))
    })
    .await
    .expect("operations under a held lock must not wait for it");
    let (evaluation, reset, timing) = held.unwrap();

    assert!(!evaluation.completed);
    assert_eq!(reset.status, TaskStatus::Running);
    assert_eq!(timing.status, TaskStatus::Running);
    assert!(engine.locks().is_locked(study.as_str()));
    engine.unlock(guard);
    assert!(!engine.locks().is_locked(study.as_str()));

    assert_eq!(runtime.live_for(&ts), 1);
    assert_eq!(engine.actions(&ts).await.unwrap().len(), 2);
}

#[tokio::test]
async fn guard_for_another_study_is_rejected() {
    let (engine, _) = engine_with(EngineConfig::new());
    let (first, _) = start(&engine, "First").await;
    let (second, second_ts) = start(&engine, "Second").await;

    let guard = engine.lock(first.as_str()).await.unwrap();
    let err = engine.reset_locked(&guard, &second_ts).await.unwrap_err();
    assert!(not_held(&err));
    let err = engine.pause_locked(&guard, &second).await.unwrap_err();
    assert!(not_held(&err));
    engine.unlock(guard);

    let (other, _) = engine_with(EngineConfig::new());
    let stray = other.lock(second.as_str()).await.unwrap();
    let err = engine
        .advance_locked(&stray, &second, CloseReason::Quit)
        .await
        .unwrap_err();
    assert!(not_held(&err));

    let record = engine.repository().study(&second).await.unwrap().unwrap();
    assert_eq!(record.status, StudyStatus::Training);
}

#[tokio::test]
async fn finished_study_leaves_lock_table() {
    let (engine, _) = engine_with(EngineConfig::new());
    let (study, _) = start(&engine, "Done").await;
    let before = engine.locks().len();

    let mut finished = false;
    for _ in 0..COMPLETED_AFTER.len() {
        if let Advance::Complete(_) = engine.advance(&study, CloseReason::Quit).await.unwrap() {
            finished = true;
            break;
        }
    }
    assert!(finished);
    assert_eq!(engine.locks().len(), before - 1);
}

#[tokio::test]
async fn study_closed_by_fault_leaves_lock_table() {
    let (engine, runtime) = engine_with(EngineConfig::new());
    let (study, ts) = start(&engine, "Broken").await;
    let before = engine.locks().len();

    runtime.fail_snapshots(true);
    let err = engine.evaluate(&ts, &ObservedOutput::default()).await.unwrap_err();
    assert!(err.is_infrastructure());
    let record = engine.repository().study(&study).await.unwrap().unwrap();
    assert_eq!(record.status, StudyStatus::ClosedWithError);
    assert_eq!(engine.locks().len(), before - 1);
}
