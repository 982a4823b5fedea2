//! Terminal transcripts and path extraction
//!
//! A captured transcript starts with the echoed command and ends with the
//! next prompt, `user@host:DIR$ `. [`ObservedOutput`] splits it apart and
//! [`PathResolver`] turns the trailing token of an output line into a path
//! relative to the participant's home directory.

use serde::{Deserialize, Serialize};
use termtask_snapshot::SnapshotPath;

/// Default shell prompt terminator
pub const DEFAULT_PROMPT_SEPARATOR: &str = "$ ";

/// Resolves printed paths against a home directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathResolver {
    home: String,
}

impl PathResolver {
    /// Resolver for the given absolute home directory
    #[must_use]
    pub fn new(home: impl Into<String>) -> Self {
        let mut home = home.into();
        while home.len() > 1 && home.ends_with('/') {
            home.pop();
        }
        Self { home }
    }

    /// Home directory
    #[inline]
    #[must_use]
    pub fn home(&self) -> &str {
        &self.home
    }

    /// Path printed on `line`, relative to home
    ///
    /// The last whitespace-separated token is taken as the path. Relative
    /// tokens are resolved against `cwd` (itself `~`, absolute, or relative to
    /// home); a missing `cwd` means home. Returns `None` when the line has no
    /// path-like token or the path leaves the home directory.
    #[must_use]
    pub fn extract(&self, line: &str, cwd: Option<&str>) -> Option<SnapshotPath> {
        let token = line.split_whitespace().last()?;
        if token.starts_with('-') || token.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        self.resolve(token, cwd)
    }

    /// Resolve a path token, relative to `cwd` when not anchored
    #[must_use]
    pub fn resolve(&self, token: &str, cwd: Option<&str>) -> Option<SnapshotPath> {
        if token == "~" || token == self.home {
            return Some(SnapshotPath::root());
        }
        if let Some(rest) = token.strip_prefix("~/") {
            return normalize(SnapshotPath::root(), rest);
        }
        if token.starts_with('/') {
            let rest = token.strip_prefix(self.home.as_str())?.strip_prefix('/')?;
            return normalize(SnapshotPath::root(), rest);
        }
        let base = match cwd {
            Some(dir) => self.resolve(dir, None)?,
            None => SnapshotPath::root(),
        };
        normalize(base, token)
    }
}

impl Default for PathResolver {
    fn default() -> Self {
        Self::new("/home/participant")
    }
}

fn normalize(mut base: SnapshotPath, rest: &str) -> Option<SnapshotPath> {
    for segment in rest.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                base.pop()?;
            }
            name => base.push(name),
        }
    }
    Some(base)
}

/// Output of one command as seen in the terminal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedOutput {
    /// Echoed command line, if captured
    pub command: Option<String>,
    /// Output lines between the command and the next prompt
    pub lines: Vec<String>,
    /// Working directory parsed from the trailing prompt
    pub cwd: Option<String>,
}

impl ObservedOutput {
    /// Output lines with a known working directory
    #[must_use]
    pub fn new(lines: Vec<String>, cwd: Option<String>) -> Self {
        Self {
            command: None,
            lines,
            cwd,
        }
    }

    /// Split a transcript into command, output and prompt directory
    ///
    /// The first line is taken as the echoed command. If the last line is a
    /// prompt ending in `separator`, the directory between the first `:` and
    /// the separator becomes [`cwd`](Self::cwd) and the line is dropped.
    #[must_use]
    pub fn from_transcript(text: &str, separator: &str) -> Self {
        let mut lines: Vec<&str> = text.lines().map(|l| l.trim_end_matches('\r')).collect();
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }

        let cwd = lines.last().and_then(|l| parse_prompt(l, separator));
        if cwd.is_some() {
            lines.pop();
        }
        let command = if lines.is_empty() {
            None
        } else {
            Some(lines.remove(0).to_string())
        };

        Self {
            command,
            lines: lines.into_iter().map(str::to_string).collect(),
            cwd,
        }
    }

    /// Paths printed on each output line, skipping lines without one
    #[must_use]
    pub fn paths(&self, resolver: &PathResolver) -> Vec<SnapshotPath> {
        self.lines
            .iter()
            .filter_map(|l| resolver.extract(l, self.cwd.as_deref()))
            .collect()
    }
}

/// Directory shown in a `user@host:DIR<sep>` prompt
fn parse_prompt(line: &str, separator: &str) -> Option<String> {
    let body = line.strip_suffix(separator).or_else(|| line.strip_suffix(separator.trim_end()))?;
    let (identity, dir) = body.split_once(':')?;
    if !identity.contains('@') || dir.is_empty() {
        return None;
    }
    Some(dir.to_string())
}
