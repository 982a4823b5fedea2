//! Task definitions and the task catalog
//!
//! Tasks are immutable once loaded. [`TaskCatalog::load_dir`] reads
//! `task<ID>.json` / `task<ID>.yaml` files and optional `task<ID>.stdout`
//! files holding the expected terminal output. Goal trees may be written in
//! the tagged JSON form or the compact structure-only form.

use crate::error::{CatalogError, ConfigError, EngineError};
use crate::model::{BlockOrder, Stage, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termtask_snapshot::{Attribute, FsNode, SnapshotPath};
use termtask_verify::{ComparisonPolicy, TaskType};

/// Default directory goal output was recorded in
pub const DEFAULT_GOAL_WORKING_DIR: &str = "~";

/// A loaded task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub description: String,
    /// Attributes that take part in comparison
    pub attributes: Vec<Attribute>,
    /// Sandbox seed; an empty home directory when absent
    pub initial_filesystem: Option<FsNode>,
    pub goal_filesystem: Option<FsNode>,
    pub goal_stdout: Option<Vec<String>>,
    pub duration: Duration,
    pub policy: ComparisonPolicy,
    /// Directory relative goal output lines are resolved from
    pub goal_working_dir: String,
    /// Practice task run at the start of a stage
    pub training: bool,
}

impl Task {
    /// Task with no goals and default settings
    #[must_use]
    pub fn new(id: TaskId, task_type: TaskType) -> Self {
        Self {
            id,
            task_type,
            description: String::new(),
            attributes: Vec::new(),
            initial_filesystem: None,
            goal_filesystem: None,
            goal_stdout: None,
            duration: Duration::from_secs(300),
            policy: ComparisonPolicy::Exact,
            goal_working_dir: DEFAULT_GOAL_WORKING_DIR.to_string(),
            training: false,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Vec<Attribute>) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn with_initial_filesystem(mut self, tree: FsNode) -> Self {
        self.initial_filesystem = Some(tree);
        self
    }

    #[must_use]
    pub fn with_goal_filesystem(mut self, tree: FsNode) -> Self {
        self.goal_filesystem = Some(tree);
        self
    }

    #[must_use]
    pub fn with_goal_stdout(mut self, lines: Vec<String>) -> Self {
        self.goal_stdout = Some(lines);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: ComparisonPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn as_training(mut self) -> Self {
        self.training = true;
        self
    }

    /// Tree the sandbox is seeded with
    #[must_use]
    pub fn seed(&self) -> FsNode {
        self.initial_filesystem
            .clone()
            .unwrap_or_else(|| FsNode::empty_dir(home_root_name(self.goal_filesystem.as_ref())))
    }

    /// Ensure the goals required by the task type are present
    ///
    /// # Errors
    /// Returns [`CatalogError::MissingGoal`]
    pub fn check(&self) -> Result<(), CatalogError> {
        let missing = |what| CatalogError::MissingGoal { task: self.id, what };
        match self.task_type {
            TaskType::Stdout if self.goal_stdout.is_none() => Err(missing("goal stdout")),
            TaskType::FileSearch | TaskType::FilesystemChange if self.goal_filesystem.is_none() => {
                Err(missing("goal filesystem"))
            }
            _ => Ok(()),
        }
    }
}

fn home_root_name(goal: Option<&FsNode>) -> String {
    goal.map_or_else(|| "home".to_string(), |g| g.name().to_string())
}

/// On-disk task file
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskFile {
    id: TaskId,
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    attributes: Vec<Attribute>,
    #[serde(default)]
    initial_filesystem: Option<Value>,
    #[serde(default)]
    goal_filesystem: Option<Value>,
    /// Paths in the goal tree a file-search task expects to be printed
    #[serde(default)]
    select: Vec<String>,
    #[serde(default)]
    goal_stdout: Option<Vec<String>>,
    /// Seconds
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    policy: ComparisonPolicy,
    #[serde(default)]
    goal_working_dir: Option<String>,
    #[serde(default)]
    training: bool,
}

impl TaskFile {
    fn into_task(self, path: &Path, default_duration: Duration) -> Result<Task, CatalogError> {
        let id = self.id;
        let task_type = self
            .task_type
            .parse::<TaskType>()
            .map_err(|source| CatalogError::UnknownTaskType {
                path: path.to_path_buf(),
                source,
            })?;
        let tree_err = |source| CatalogError::Tree { task: id, source };

        let initial_filesystem = self
            .initial_filesystem
            .as_ref()
            .map(FsNode::from_json_value)
            .transpose()
            .map_err(tree_err)?;
        let goal_filesystem = self
            .goal_filesystem
            .as_ref()
            .map(FsNode::from_json_value)
            .transpose()
            .map_err(tree_err)?;
        let goal_filesystem = match goal_filesystem {
            Some(mut goal) => {
                for raw in &self.select {
                    let target: SnapshotPath = raw.parse().map_err(|_| {
                        tree_err(termtask_snapshot::SnapshotError::PathNotFound(raw.clone()))
                    })?;
                    goal.mark_to_select(&target).map_err(tree_err)?;
                }
                Some(goal.filter_attributes(&self.attributes))
            }
            None => None,
        };

        Ok(Task {
            id,
            task_type,
            description: self.description,
            attributes: self.attributes,
            initial_filesystem,
            goal_filesystem,
            goal_stdout: self.goal_stdout,
            duration: self.duration.map_or(default_duration, Duration::from_secs),
            policy: self.policy,
            goal_working_dir: self
                .goal_working_dir
                .unwrap_or_else(|| DEFAULT_GOAL_WORKING_DIR.to_string()),
            training: self.training,
        })
    }
}

/// All tasks known to the engine, keyed by id
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: BTreeMap<TaskId, Task>,
}

impl TaskCatalog {
    /// Empty catalog
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task
    ///
    /// # Errors
    /// Returns error on a duplicate id or a missing goal
    pub fn insert(&mut self, task: Task) -> Result<(), CatalogError> {
        task.check()?;
        if self.tasks.contains_key(&task.id) {
            return Err(CatalogError::DuplicateTask(task.id));
        }
        self.tasks.insert(task.id, task);
        Ok(())
    }

    /// Builder-style insert
    ///
    /// # Errors
    /// See [`insert`](Self::insert)
    pub fn with_task(mut self, task: Task) -> Result<Self, CatalogError> {
        self.insert(task)?;
        Ok(self)
    }

    #[inline]
    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Comparison policy of a task
    #[inline]
    #[must_use]
    pub fn policy(&self, id: TaskId) -> Option<&ComparisonPolicy> {
        self.tasks.get(&id).map(|t| &t.policy)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Load every task file in `dir`
    ///
    /// # Errors
    /// Returns error on unreadable or malformed files, duplicate ids, missing
    /// goals, or stdout files without a matching task
    pub fn load_dir(dir: &Path, default_duration: Duration) -> Result<Self, CatalogError> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CatalogError::Io { path, source }
        };
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(io(dir))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()
            .map_err(io(dir))?;
        paths.sort();

        let mut tasks: BTreeMap<TaskId, Task> = BTreeMap::new();
        let mut outputs: BTreeMap<TaskId, Vec<String>> = BTreeMap::new();

        for path in paths {
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !stem.starts_with("task") || !path.is_file() {
                continue;
            }
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
            let file: TaskFile = match extension {
                "json" => {
                    let text = fs::read_to_string(&path).map_err(io(&path))?;
                    serde_json::from_str(&text).map_err(|source| CatalogError::Json {
                        path: path.clone(),
                        source,
                    })?
                }
                "yaml" | "yml" => {
                    let text = fs::read_to_string(&path).map_err(io(&path))?;
                    serde_yaml::from_str(&text).map_err(|source| CatalogError::Yaml {
                        path: path.clone(),
                        source,
                    })?
                }
                "stdout" => {
                    let id = stem["task".len()..]
                        .parse::<u32>()
                        .map_err(|_| CatalogError::BadFileName(path.clone()))?;
                    let text = fs::read_to_string(&path).map_err(io(&path))?;
                    outputs.insert(TaskId(id), text.lines().map(str::to_string).collect());
                    continue;
                }
                _ => continue,
            };
            let task = file.into_task(&path, default_duration)?;
            let id = task.id;
            tracing::debug!(task = %id, path = %path.display(), "loaded task");
            if tasks.insert(id, task).is_some() {
                return Err(CatalogError::DuplicateTask(id));
            }
        }

        for (id, lines) in outputs {
            let task = tasks.get_mut(&id).ok_or(CatalogError::OrphanStdout(id))?;
            task.goal_stdout.get_or_insert(lines);
        }

        let mut catalog = Self::new();
        for task in tasks.into_values() {
            catalog.insert(task)?;
        }
        tracing::info!(dir = %dir.display(), tasks = catalog.len(), "task catalog loaded");
        Ok(catalog)
    }
}

/// Which tasks make up the two stages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyPlan {
    #[serde(default)]
    pub block_one: Vec<TaskId>,
    #[serde(default)]
    pub block_two: Vec<TaskId>,
    /// Training task of stage I, then of stage II
    #[serde(default)]
    pub training: Vec<TaskId>,
}

impl StudyPlan {
    /// Split the catalog's real tasks in half by id; training tasks in id order
    #[must_use]
    pub fn from_catalog(catalog: &TaskCatalog) -> Self {
        let (training, real): (Vec<&Task>, Vec<&Task>) = catalog.iter().partition(|t| t.training);
        let real: Vec<TaskId> = real.iter().map(|t| t.id).collect();
        let split = real.len().div_ceil(2);
        Self {
            block_one: real[..split].to_vec(),
            block_two: real[split..].to_vec(),
            training: training.iter().map(|t| t.id).collect(),
        }
    }

    /// Stage I tasks followed by stage II tasks, and the switch point
    #[must_use]
    pub fn sequence(&self, order: BlockOrder) -> (Vec<TaskId>, u32) {
        let (first, second) = match order {
            BlockOrder::OneThenTwo => (&self.block_one, &self.block_two),
            BlockOrder::TwoThenOne => (&self.block_two, &self.block_one),
        };
        let tasks = first.iter().chain(second).copied().collect();
        (tasks, u32::try_from(first.len()).unwrap_or(u32::MAX))
    }

    /// Training task that opens `stage`
    #[must_use]
    pub fn training_for(&self, stage: Stage) -> Option<TaskId> {
        match stage {
            Stage::I => self.training.first().copied(),
            Stage::II => self.training.get(1).copied(),
            Stage::O | Stage::III => None,
        }
    }

    /// Ensure the plan is usable with `catalog`
    ///
    /// # Errors
    /// Returns error if the plan is empty or names unknown tasks
    pub fn validate(&self, catalog: &TaskCatalog) -> Result<(), EngineError> {
        if self.block_one.is_empty() && self.block_two.is_empty() {
            return Err(ConfigError::Invalid {
                field: "plan",
                reason: "no tasks".to_string(),
            }
            .into());
        }
        let ids = self.block_one.iter().chain(&self.block_two).chain(&self.training);
        for id in ids {
            if catalog.get(*id).is_none() {
                return Err(EngineError::UnknownTask(*id));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn write(dir: &Path, name: &str, body: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[test]
    fn loads_json_yaml_and_stdout_files() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "task1.json",
            r#"{
                "id": 1,
                "type": "file_search",
                "description": "Find css files",
                "goal_filesystem": {"website": {"index.html": null, "css": {"main.css": null}}},
                "select": ["website/css/main.css"],
                "duration": 120
            }"#,
        );
        write(
            tmp.path(),
            "task2.yaml",
            "id: 2\ntype: stdout\npolicy:\n  kind: path_with_line_count\n  tolerate_total: true\n",
        );
        write(tmp.path(), "task2.stdout", "3 website/index.html\n");
        write(tmp.path(), "README.md", "ignored");

        let catalog = TaskCatalog::load_dir(tmp.path(), Duration::from_secs(300)).unwrap();
        assert_eq!(catalog.len(), 2);

        let search = catalog.get(TaskId(1)).unwrap();
        assert_eq!(search.duration, Duration::from_secs(120));
        let goal = search.goal_filesystem.as_ref().unwrap();
        let target: SnapshotPath = "website/css/main.css".parse().unwrap();
        assert!(goal.find(&target).unwrap().to_select());

        let stdout = catalog.get(TaskId(2)).unwrap();
        assert_eq!(stdout.goal_stdout.as_deref(), Some(&["3 website/index.html".to_string()][..]));
        assert_eq!(stdout.duration, Duration::from_secs(300));
        assert_eq!(
            catalog.policy(TaskId(2)),
            Some(&ComparisonPolicy::PathWithLineCount { tolerate_total: true })
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let body = r#"{"id": 7, "type": "stdout", "goal_stdout": ["x"]}"#;
        write(tmp.path(), "task7.json", body);
        write(tmp.path(), "task7b.json", body);
        let err = TaskCatalog::load_dir(tmp.path(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateTask(TaskId(7))));
    }

    #[test]
    fn unknown_type_fails_loudly() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "task1.json", r#"{"id": 1, "type": "guess"}"#);
        let err = TaskCatalog::load_dir(tmp.path(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownTaskType { .. }));
    }

    #[test]
    fn missing_goal_is_rejected() {
        let mut catalog = TaskCatalog::new();
        let err = catalog.insert(Task::new(TaskId(3), TaskType::FilesystemChange)).unwrap_err();
        assert!(matches!(err, CatalogError::MissingGoal { task: TaskId(3), .. }));
    }

    #[test]
    fn orphan_stdout_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "task9.stdout", "x\n");
        let err = TaskCatalog::load_dir(tmp.path(), Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, CatalogError::OrphanStdout(TaskId(9))));
    }

    #[test]
    fn tagged_goal_trees_keep_declared_attributes_only() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "task4.json",
            r#"{
                "id": 4,
                "type": "filesystem_change",
                "attributes": ["mode"],
                "goal_filesystem": {"type": "directory", "name": "home", "children": [
                    {"type": "file", "name": "run.sh", "attributes": {"mode": "755", "size": "10"}}
                ]}
            }"#,
        );
        let catalog = TaskCatalog::load_dir(tmp.path(), Duration::from_secs(1)).unwrap();
        let goal = catalog.get(TaskId(4)).unwrap().goal_filesystem.clone().unwrap();
        let attrs = goal.children()[0].attributes().unwrap();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs.get(Attribute::Mode), Some("755"));
    }

    #[test]
    fn plan_splits_and_orders_blocks() {
        let mut catalog = TaskCatalog::new();
        for id in 1..=5 {
            catalog
                .insert(Task::new(TaskId(id), TaskType::Stdout).with_goal_stdout(vec![]))
                .unwrap();
        }
        catalog
            .insert(Task::new(TaskId(90), TaskType::Stdout).with_goal_stdout(vec![]).as_training())
            .unwrap();
        let plan = StudyPlan::from_catalog(&catalog);
        assert_eq!(plan.block_one, vec![TaskId(1), TaskId(2), TaskId(3)]);
        assert_eq!(plan.block_two, vec![TaskId(4), TaskId(5)]);
        assert_eq!(plan.training_for(Stage::I), Some(TaskId(90)));
        assert_eq!(plan.training_for(Stage::II), None);

        let (tasks, switch) = plan.sequence(BlockOrder::TwoThenOne);
        assert_eq!(switch, 2);
        assert_eq!(tasks[0], TaskId(4));
        assert!(plan.validate(&catalog).is_ok());
        assert!(StudyPlan::default().validate(&catalog).is_err());
    }
}
