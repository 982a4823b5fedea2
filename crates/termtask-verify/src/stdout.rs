//! Terminal output comparison
//!
//! [`diff_stdout`] tags every observed line as correct or extra and appends
//! the expected lines that never matched as missing. How two lines are
//! considered equal is decided by a per-task [`ComparisonPolicy`].

use crate::shell::PathResolver;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use termtask_snapshot::SnapshotPath;

static TIMESTAMP: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\d{4}-\d{2}-\d{2}\s\d{2}:\d{2}(:\d{2}(\.\d+)?)?").ok());

static TOTAL_LINE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(^total\s|\stotal$|\stotal\s)").ok());

fn line_matches(pattern: &Lazy<Option<Regex>>, line: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(line))
}

/// Line equality rule used by a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComparisonPolicy {
    /// Trimmed lines must be identical; each expected line matches once
    #[default]
    Exact,
    /// Lines name the same path and the observed line carries a timestamp
    PathWithTimestamp,
    /// Lines name the same path and the observed line has the expected
    /// leading count (e.g. `wc -l`); summary `total` lines may be tolerated
    PathWithLineCount {
        #[serde(default)]
        tolerate_total: bool,
    },
    /// Both sides are sorted path listings compared by file name
    OrderedPaths,
}

/// Verdict for one line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineTag {
    Correct,
    Extra,
    Missing,
}

/// Overall verdict of a stdout comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTag {
    Correct,
    Incorrect,
}

/// One tagged line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdoutLine {
    pub line: String,
    pub tag: LineTag,
}

/// Result of [`diff_stdout`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdoutDiff {
    /// Observed lines in order, then unmatched expected lines
    pub lines: Vec<StdoutLine>,
    /// Correct iff every line is correct
    pub tag: OutputTag,
}

impl StdoutDiff {
    fn from_lines(lines: Vec<StdoutLine>) -> Self {
        let tag = if lines.iter().all(|l| l.tag == LineTag::Correct) {
            OutputTag::Correct
        } else {
            OutputTag::Incorrect
        };
        Self { lines, tag }
    }

    /// Whether the output matched
    #[inline]
    #[must_use]
    pub fn is_correct(&self) -> bool {
        self.tag == OutputTag::Correct
    }

    /// Number of lines carrying `tag`
    #[must_use]
    pub fn count(&self, tag: LineTag) -> usize {
        self.lines.iter().filter(|l| l.tag == tag).count()
    }
}

/// Where lines on each side are resolved from, for path-based policies
#[derive(Debug, Clone, Copy)]
pub struct LineContext<'a> {
    pub resolver: &'a PathResolver,
    /// Participant's working directory when the command ran
    pub actual_cwd: Option<&'a str>,
    /// Directory the expected output was recorded in
    pub goal_cwd: Option<&'a str>,
}

impl LineContext<'_> {
    fn actual_path(&self, line: &str) -> Option<SnapshotPath> {
        self.resolver.extract(line, self.actual_cwd)
    }

    fn goal_path(&self, line: &str) -> Option<SnapshotPath> {
        self.resolver.extract(line, self.goal_cwd)
    }
}

impl ComparisonPolicy {
    /// Whether an observed line matches an expected line
    #[must_use]
    pub fn matches(&self, actual: &str, goal: &str, ctx: &LineContext<'_>) -> bool {
        match self {
            Self::Exact | Self::OrderedPaths => actual == goal,
            Self::PathWithTimestamp => {
                line_matches(&TIMESTAMP, actual)
                    && same_path(ctx.actual_path(actual), ctx.goal_path(goal))
            }
            Self::PathWithLineCount { .. } => {
                let Some(count) = goal.split_whitespace().next() else {
                    return false;
                };
                let tokens: Vec<&str> = actual.split_whitespace().collect();
                let leading = &tokens[..tokens.len().saturating_sub(1)];
                leading.contains(&count) && same_path(ctx.actual_path(actual), ctx.goal_path(goal))
            }
        }
    }

    /// Whether an unmatched observed line is still acceptable
    #[must_use]
    pub fn tolerates(&self, actual: &str) -> bool {
        match self {
            Self::PathWithLineCount { tolerate_total } => {
                *tolerate_total && line_matches(&TOTAL_LINE, actual)
            }
            _ => false,
        }
    }
}

fn same_path(a: Option<SnapshotPath>, b: Option<SnapshotPath>) -> bool {
    matches!((a, b), (Some(a), Some(b)) if a == b)
}

fn clean(lines: &[String]) -> Vec<&str> {
    lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()).collect()
}

/// Compare observed terminal lines with the expected ones
///
/// Lines are trimmed and blank lines dropped on both sides. For the bag
/// policies each observed line consumes the first unconsumed expected line it
/// matches; [`ComparisonPolicy::OrderedPaths`] instead walks both sorted
/// listings with two cursors.
#[must_use]
pub fn diff_stdout(
    actual: &[String],
    goal: &[String],
    policy: &ComparisonPolicy,
    ctx: &LineContext<'_>,
) -> StdoutDiff {
    let actual = clean(actual);
    let goal = clean(goal);
    let lines = match policy {
        ComparisonPolicy::OrderedPaths => ordered_merge(&actual, &goal, ctx),
        _ => bag_match(&actual, &goal, policy, ctx),
    };
    StdoutDiff::from_lines(lines)
}

fn tagged(line: &str, tag: LineTag) -> StdoutLine {
    StdoutLine {
        line: line.to_string(),
        tag,
    }
}

fn bag_match(
    actual: &[&str],
    goal: &[&str],
    policy: &ComparisonPolicy,
    ctx: &LineContext<'_>,
) -> Vec<StdoutLine> {
    let mut consumed = vec![false; goal.len()];
    let mut out = Vec::with_capacity(actual.len() + goal.len());

    for line in actual {
        let hit = goal
            .iter()
            .enumerate()
            .position(|(j, g)| !consumed[j] && policy.matches(line, g, ctx));
        let tag = match hit {
            Some(j) => {
                consumed[j] = true;
                LineTag::Correct
            }
            None if policy.tolerates(line) => LineTag::Correct,
            None => LineTag::Extra,
        };
        out.push(tagged(line, tag));
    }
    out.extend(
        goal.iter()
            .zip(&consumed)
            .filter(|(_, used)| !**used)
            .map(|(g, _)| tagged(g, LineTag::Missing)),
    );
    out
}

fn ordered_merge(actual: &[&str], goal: &[&str], ctx: &LineContext<'_>) -> Vec<StdoutLine> {
    let mut out = Vec::with_capacity(actual.len() + goal.len());
    let (mut i, mut j) = (0, 0);

    while i < actual.len() && j < goal.len() {
        let a = ctx.actual_path(actual[i]);
        let g = ctx.goal_path(goal[j]);
        match (a, g) {
            (Some(a), Some(g)) if a == g => {
                out.push(tagged(actual[i], LineTag::Correct));
                i += 1;
                j += 1;
            }
            (None, _) => {
                out.push(tagged(actual[i], LineTag::Extra));
                i += 1;
            }
            (Some(_), None) => {
                out.push(tagged(goal[j], LineTag::Missing));
                j += 1;
            }
            (Some(a), Some(g)) => {
                if a.file_name() < g.file_name() {
                    out.push(tagged(actual[i], LineTag::Extra));
                    i += 1;
                } else {
                    out.push(tagged(goal[j], LineTag::Missing));
                    j += 1;
                }
            }
        }
    }
    out.extend(actual[i..].iter().map(|l| tagged(l, LineTag::Extra)));
    out.extend(goal[j..].iter().map(|l| tagged(l, LineTag::Missing)));
    out
}
