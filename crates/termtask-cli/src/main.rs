//! `termtask` command line
//!
//! Offline access to the verification engine: compare trees, capture a
//! directory as a snapshot, compare terminal output and check a task catalog.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use termtask_session::{EngineConfig, StudyPlan, TaskCatalog};
use termtask_snapshot::{compact, snapshot_dir, Attribute, FsNode};
use termtask_verify::{
    annotate_selection, diff, diff_stdout, ComparisonPolicy, LineContext, ObservedOutput,
    PathResolver, TaskType,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "termtask", version, about = "Terminal task verification tools")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    #[value(name = "exact")]
    Exact,
    #[value(name = "path_with_timestamp")]
    PathWithTimestamp,
    #[value(name = "path_with_line_count")]
    PathWithLineCount,
    #[value(name = "ordered_paths")]
    OrderedPaths,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff a current tree against a goal tree (tagged or compact JSON)
    Diff {
        #[arg(long)]
        current: PathBuf,
        #[arg(long)]
        goal: PathBuf,
        /// Judge printed paths for this task type
        #[arg(long, default_value = "filesystem_change")]
        task_type: String,
        /// Terminal transcript whose printed paths are stamped onto the diff
        #[arg(long)]
        transcript: Option<PathBuf>,
        #[arg(long, default_value = "/home/participant")]
        home: String,
        #[arg(long, default_value = "$ ")]
        prompt_separator: String,
    },
    /// Capture a directory as a snapshot
    Snapshot {
        dir: PathBuf,
        /// Attributes to record, comma separated
        #[arg(long, value_delimiter = ',')]
        attributes: Vec<String>,
        /// Print the structure-only form
        #[arg(long)]
        compact: bool,
    },
    /// Compare terminal output lines against goal lines
    StdoutDiff {
        #[arg(long)]
        actual: PathBuf,
        #[arg(long)]
        goal: PathBuf,
        #[arg(long, value_enum, default_value = "exact")]
        policy: PolicyArg,
        /// Ignore `total` lines of `ls -l` style output
        #[arg(long)]
        tolerate_total: bool,
        /// Directory the actual output was produced in
        #[arg(long)]
        cwd: Option<String>,
        #[arg(long, default_value = "~")]
        goal_cwd: String,
        #[arg(long, default_value = "/home/participant")]
        home: String,
    },
    /// Load a task directory and validate the study plan
    CheckTasks {
        /// Task directory; defaults to `tasks_dir` from the configuration
        dir: Option<PathBuf>,
        /// Engine configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_logging(json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow!("cannot install log subscriber: {e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.json) {
        eprintln!("termtask: {e:#}");
    }

    match run(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

/// Returns whether the checked input matched its goal
fn run(command: Commands) -> Result<bool> {
    match command {
        Commands::Diff {
            current,
            goal,
            task_type,
            transcript,
            home,
            prompt_separator,
        } => {
            let task_type: TaskType = task_type.parse()?;
            let current = load_tree(&current)?;
            let goal = load_tree(&goal)?;
            let mut result = diff(&current, &goal)?;
            if let Some(path) = transcript {
                let text = read(&path)?;
                let observed = ObservedOutput::from_transcript(&text, &prompt_separator);
                let paths = observed.paths(&PathResolver::new(home));
                annotate_selection(&mut result, task_type, &paths);
            }
            let summary = result.summary();
            tracing::info!(
                correct = summary.correct,
                incorrect = summary.incorrect,
                extra = summary.extra,
                missing = summary.missing,
                "diff complete"
            );
            print_json(&result)?;
            Ok(result.is_complete())
        }
        Commands::Snapshot {
            dir,
            attributes,
            compact: structure_only,
        } => {
            let attributes = parse_attributes(&attributes)?;
            let tree = snapshot_dir(&dir, &attributes)?;
            if structure_only {
                print_json(&compact::to_value(&tree))?;
            } else {
                print_json(&tree)?;
            }
            Ok(true)
        }
        Commands::StdoutDiff {
            actual,
            goal,
            policy,
            tolerate_total,
            cwd,
            goal_cwd,
            home,
        } => {
            let actual = read_lines(&actual)?;
            let goal = read_lines(&goal)?;
            let policy = build_policy(policy, tolerate_total);
            let resolver = PathResolver::new(home);
            let ctx = LineContext {
                resolver: &resolver,
                actual_cwd: cwd.as_deref(),
                goal_cwd: Some(&goal_cwd),
            };
            let result = diff_stdout(&actual, &goal, &policy, &ctx);
            print_json(&result)?;
            Ok(result.is_correct())
        }
        Commands::CheckTasks { dir, config } => {
            let config = match config {
                Some(path) => EngineConfig::load(&path)?,
                None => EngineConfig::new(),
            };
            config.validate()?;
            let Some(dir) = dir.or_else(|| config.tasks_dir.clone()) else {
                bail!("no task directory given and none configured");
            };
            let catalog = TaskCatalog::load_dir(&dir, config.default_task_duration())?;
            let plan = config
                .plan
                .clone()
                .unwrap_or_else(|| StudyPlan::from_catalog(&catalog));
            plan.validate(&catalog)?;
            for task in catalog.iter() {
                println!(
                    "task{:<4} {:<18} {:>5}s{}  {}",
                    task.id,
                    task.task_type.as_str(),
                    task.duration.as_secs(),
                    if task.training { " training" } else { "" },
                    task.description
                );
            }
            print_json(&plan)?;
            Ok(true)
        }
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    Ok(read(path)?.lines().map(str::to_string).collect())
}

/// Parse a tree file, accepting both the tagged and the compact form
fn load_tree(path: &Path) -> Result<FsNode> {
    let text = read(path)?;
    let value: Value =
        serde_json::from_str(&text).with_context(|| format!("{} is not JSON", path.display()))?;
    FsNode::from_json_value(&value).with_context(|| format!("invalid tree in {}", path.display()))
}

fn parse_attributes(names: &[String]) -> Result<Vec<Attribute>> {
    let mut attributes = Vec::with_capacity(names.len());
    for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        let attribute = name.parse::<Attribute>()?;
        if attributes.contains(&attribute) {
            bail!("attribute {name} given twice");
        }
        attributes.push(attribute);
    }
    Ok(attributes)
}

fn build_policy(policy: PolicyArg, tolerate_total: bool) -> ComparisonPolicy {
    match policy {
        PolicyArg::Exact => ComparisonPolicy::Exact,
        PolicyArg::PathWithTimestamp => ComparisonPolicy::PathWithTimestamp,
        PolicyArg::PathWithLineCount => ComparisonPolicy::PathWithLineCount { tolerate_total },
        PolicyArg::OrderedPaths => ComparisonPolicy::OrderedPaths,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
