//! Testing utilities for the termtask workspace
//!
//! Tree builders, a manually driven clock, an in-memory sandbox runtime that
//! tracks how many sandboxes each task session holds, and a small sample
//! task catalog.

#![allow(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termtask_session::{
    Clock, Engine, EngineConfig, MemoryStore, SandboxError, SandboxHandle, SandboxRuntime, Task,
    TaskCatalog, TaskId, TaskSessionId,
};
use termtask_snapshot::{Attribute, AttributeSet, FsNode, SnapshotPath};
use termtask_verify::TaskType;

// --- Trees ---

pub fn dir(name: &str, children: Vec<FsNode>) -> FsNode {
    FsNode::dir(name, children).unwrap()
}

pub fn file(name: &str) -> FsNode {
    FsNode::file(name)
}

pub fn file_with_size(name: &str, size: u64) -> FsNode {
    FsNode::file_with(name, AttributeSet::new().with(Attribute::Size, size.to_string()))
}

pub fn file_with_content(name: &str, content: &str) -> FsNode {
    FsNode::file_with(name, AttributeSet::new().with(Attribute::Content, content))
}

pub fn path(text: &str) -> SnapshotPath {
    text.parse().unwrap()
}

// --- Clock ---

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Clock starting at 2024-01-01 09:00 UTC
    pub fn fixed() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(by).unwrap();
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// --- Sandbox runtime ---

#[derive(Debug, Clone)]
struct MemorySandbox {
    owner: TaskSessionId,
    tree: FsNode,
    transcript: String,
}

/// Sandbox runtime holding trees in memory
///
/// Records the highest number of live sandboxes any single task session has
/// held at once, and can be told to fail creations or snapshots.
#[derive(Debug, Default)]
pub struct InMemorySandboxRuntime {
    next_id: AtomicU64,
    live: DashMap<String, MemorySandbox>,
    max_per_owner: Mutex<HashMap<TaskSessionId, usize>>,
    created: AtomicU64,
    destroyed: AtomicU64,
    fail_create: AtomicBool,
    fail_snapshot: AtomicBool,
}

impl InMemorySandboxRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_for(&self, owner: &TaskSessionId) -> usize {
        self.live.iter().filter(|s| &s.owner == owner).count()
    }

    /// Highest number of simultaneously live sandboxes owned by one task session
    pub fn max_live_per_owner(&self) -> usize {
        self.max_per_owner.lock().values().copied().max().unwrap_or(0)
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn is_live(&self, handle: &SandboxHandle) -> bool {
        self.live.contains_key(handle.as_str())
    }

    /// Live sandbox owned by `owner`
    pub fn handle_of(&self, owner: &TaskSessionId) -> Option<SandboxHandle> {
        self.live
            .iter()
            .find(|s| &s.owner == owner)
            .map(|s| SandboxHandle::new(s.key().clone()))
    }

    /// Current tree of a live sandbox
    pub fn tree(&self, handle: &SandboxHandle) -> Option<FsNode> {
        self.live.get(handle.as_str()).map(|s| s.tree.clone())
    }

    /// Replace the tree of the sandbox owned by `owner`
    pub fn set_tree(&self, owner: &TaskSessionId, tree: FsNode) {
        let mut entry = self
            .live
            .iter_mut()
            .find(|s| &s.owner == owner)
            .expect("owner has a live sandbox");
        entry.tree = tree;
    }

    /// Add a child to the tree root of the sandbox owned by `owner`
    pub fn add_to_root(&self, owner: &TaskSessionId, child: FsNode) {
        let mut entry = self
            .live
            .iter_mut()
            .find(|s| &s.owner == owner)
            .expect("owner has a live sandbox");
        match &mut entry.tree {
            FsNode::Directory(root) => root.insert(child).unwrap(),
            FsNode::File(_) => panic!("tree root is a file"),
        }
    }

    /// Append terminal output to the sandbox owned by `owner`
    pub fn push_output(&self, owner: &TaskSessionId, text: &str) {
        let mut entry = self
            .live
            .iter_mut()
            .find(|s| &s.owner == owner)
            .expect("owner has a live sandbox");
        entry.transcript.push_str(text);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshot.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SandboxRuntime for InMemorySandboxRuntime {
    async fn create_sandbox(
        &self,
        owner: &TaskSessionId,
        initial: &FsNode,
    ) -> Result<SandboxHandle, SandboxError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::CreationFailed("injected fault".to_string()));
        }
        let id = format!("sbx-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.live.insert(
            id.clone(),
            MemorySandbox {
                owner: owner.clone(),
                tree: initial.clone(),
                transcript: String::new(),
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);

        let held = self.live_for(owner);
        let mut max = self.max_per_owner.lock();
        let high = max.entry(owner.clone()).or_insert(0);
        *high = (*high).max(held);
        Ok(SandboxHandle::new(id))
    }

    async fn destroy_sandbox(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        self.live
            .remove(handle.as_str())
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))?;
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn snapshot(
        &self,
        handle: &SandboxHandle,
        attributes: &[Attribute],
    ) -> Result<FsNode, SandboxError> {
        if self.fail_snapshot.load(Ordering::SeqCst) {
            return Err(SandboxError::Unavailable("injected fault".to_string()));
        }
        self.live
            .get(handle.as_str())
            .map(|s| s.tree.filter_attributes(attributes))
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))
    }

    async fn current_stdout(&self, handle: &SandboxHandle) -> Result<String, SandboxError> {
        self.live
            .get(handle.as_str())
            .map(|s| s.transcript.clone())
            .ok_or_else(|| SandboxError::NotFound(handle.to_string()))
    }
}

// --- Sample catalog ---

pub const TASK_BACKUP: TaskId = TaskId(1);
pub const TASK_FIND_REPORT: TaskId = TaskId(2);
pub const TASK_LIST_FILES: TaskId = TaskId(3);
pub const TASK_DELETE_LOG: TaskId = TaskId(4);
pub const TRAINING_ONE: TaskId = TaskId(101);
pub const TRAINING_TWO: TaskId = TaskId(102);

/// Seconds each sample task may run
pub const SAMPLE_TASK_SECS: u64 = 120;

fn training(id: TaskId) -> Task {
    Task::new(id, TaskType::FilesystemChange)
        .with_description("create hello.txt")
        .with_initial_filesystem(dir("project", vec![]))
        .with_goal_filesystem(dir("project", vec![file("hello.txt")]))
        .with_duration(Duration::from_secs(SAMPLE_TASK_SECS))
        .as_training()
}

/// Four real tasks, one of each kind plus a deletion, and two training tasks
pub fn sample_catalog() -> TaskCatalog {
    let duration = Duration::from_secs(SAMPLE_TASK_SECS);

    let mut search_goal = dir(
        "project",
        vec![
            dir("docs", vec![file("report.txt"), file("draft.txt")]),
            file("todo.txt"),
        ],
    );
    search_goal.mark_to_select(&path("project/docs/report.txt")).unwrap();

    TaskCatalog::new()
        .with_task(
            Task::new(TASK_BACKUP, TaskType::FilesystemChange)
                .with_description("copy notes.txt into backup/")
                .with_initial_filesystem(dir("project", vec![file("notes.txt")]))
                .with_goal_filesystem(dir(
                    "project",
                    vec![file("notes.txt"), dir("backup", vec![file("notes.txt")])],
                ))
                .with_duration(duration),
        )
        .unwrap()
        .with_task(
            Task::new(TASK_FIND_REPORT, TaskType::FileSearch)
                .with_description("find the report")
                .with_initial_filesystem(strip_marks(&search_goal))
                .with_goal_filesystem(search_goal)
                .with_duration(duration),
        )
        .unwrap()
        .with_task(
            Task::new(TASK_LIST_FILES, TaskType::Stdout)
                .with_description("list the project directory")
                .with_initial_filesystem(dir("project", vec![file("a.txt"), file("b.txt")]))
                .with_goal_stdout(vec!["a.txt".to_string(), "b.txt".to_string()])
                .with_duration(duration),
        )
        .unwrap()
        .with_task(
            Task::new(TASK_DELETE_LOG, TaskType::FilesystemChange)
                .with_description("delete old.log")
                .with_attributes(vec![Attribute::Size])
                .with_initial_filesystem(dir("project", vec![file_with_size("old.log", 512)]))
                .with_goal_filesystem(dir("project", vec![]))
                .with_duration(duration),
        )
        .unwrap()
        .with_task(training(TRAINING_ONE))
        .unwrap()
        .with_task(training(TRAINING_TWO))
        .unwrap()
}

/// Engine over the sample catalog, an in-memory store and the given runtime and clock
pub fn sample_engine(runtime: Arc<InMemorySandboxRuntime>, clock: Arc<ManualClock>) -> Engine {
    sample_engine_with(EngineConfig::new(), runtime, clock)
}

pub fn sample_engine_with(
    config: EngineConfig,
    runtime: Arc<InMemorySandboxRuntime>,
    clock: Arc<ManualClock>,
) -> Engine {
    Engine::new(config, sample_catalog(), Arc::new(MemoryStore::new()), runtime)
        .unwrap()
        .with_clock(clock)
}

/// Goal tree of a sample task with selection marks removed
pub fn solved_tree(catalog: &TaskCatalog, id: TaskId) -> FsNode {
    let goal = catalog.get(id).and_then(|t| t.goal_filesystem.clone()).unwrap();
    strip_marks(&goal)
}

fn strip_marks(node: &FsNode) -> FsNode {
    match node {
        FsNode::File(f) => FsNode::file_with(f.name.clone(), f.attributes.clone()),
        FsNode::Directory(d) => dir(d.name(), d.children().iter().map(strip_marks).collect()),
    }
}
