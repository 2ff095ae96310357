//! Catalog entities.
//!
//! Rows carry a column-level modification mark. Setters record the columns
//! they touch; `Update` in the catalog writes only marked columns and
//! `reset_mark` clears the record after a successful write. Cloning a row
//! yields an independent copy with the same mark.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Maximum length of a scheduler Job name.
const MAX_NODE_NAME: usize = 63;

/// What a task runs under Bazel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildCommand {
    Build,
    Test,
}

impl std::fmt::Display for BuildCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildCommand::Build => write!(f, "build"),
            BuildCommand::Test => write!(f, "test"),
        }
    }
}

impl std::str::FromStr for BuildCommand {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(BuildCommand::Build),
            "test" => Ok(BuildCommand::Test),
            _ => Err(Error::Validation(format!("unknown command: {}", s))),
        }
    }
}

/// How a task was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Via {
    Webhook,
    Api,
    Manual,
}

impl std::fmt::Display for Via {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Via::Webhook => write!(f, "webhook"),
            Via::Api => write!(f, "api"),
            Via::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for Via {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "webhook" => Ok(Via::Webhook),
            "api" => Ok(Via::Api),
            "manual" => Ok(Via::Manual),
            _ => Err(Error::Validation(format!("unknown via: {}", s))),
        }
    }
}

/// A source repository known to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: i32,
    pub name: String,
    pub url: String,
    pub clone_url: String,
}

/// The logical build definition. Template for tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i32,
    pub repository_id: i32,
    pub command: BuildCommand,
    pub target: String,
    pub bazel_version: String,
    pub config_name: String,
    /// Build every revision referenced by the trigger instead of only the
    /// head revision.
    pub all_revision: bool,
    /// Report commit statuses to GitHub.
    pub github_status: bool,
    /// At most one non-terminal task at a time.
    pub exclusive: bool,
}

impl Job {
    pub fn fingerprint(&self, revision: &str) -> Fingerprint {
        Fingerprint {
            repository_id: self.repository_id,
            command: self.command,
            target: self.target.clone(),
            revision: revision.to_string(),
            bazel_version: self.bazel_version.clone(),
            config_name: self.config_name.clone(),
        }
    }
}

/// Tuple uniquely identifying a build request for admission control.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub repository_id: i32,
    pub command: BuildCommand,
    pub target: String,
    pub revision: String,
    pub bazel_version: String,
    pub config_name: String,
}

/// Allow-list entry for API-initiated builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedUser {
    pub id: i32,
    pub github_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Columns of the task row, used by the modification mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskColumn {
    Revision,
    Success,
    LogFile,
    Node,
    StartAt,
    FinishedAt,
}

impl TaskColumn {
    /// Catalog column name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskColumn::Revision => "revision",
            TaskColumn::Success => "success",
            TaskColumn::LogFile => "log_file",
            TaskColumn::Node => "node",
            TaskColumn::StartAt => "start_at",
            TaskColumn::FinishedAt => "finished_at",
        }
    }
}

/// A single build execution: one revision, one target, one scheduler Job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i32,
    pub job_id: i32,
    pub revision: String,
    pub via: Via,
    pub success: bool,
    pub log_file: Option<String>,
    /// Name of the scheduler Job materializing this task. Set after the
    /// Job is created; exactly one per non-terminal task.
    pub node: Option<String>,
    pub command: BuildCommand,
    pub target: String,
    pub start_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(skip)]
    mark: BTreeSet<TaskColumn>,
}

impl Task {
    pub fn new(job: &Job, revision: impl Into<String>, via: Via) -> Self {
        Task {
            id: 0,
            job_id: job.id,
            revision: revision.into(),
            via,
            success: false,
            log_file: None,
            node: None,
            command: job.command,
            target: job.target.clone(),
            start_at: None,
            finished_at: None,
            mark: BTreeSet::new(),
        }
    }

    /// Reconstruct a row loaded from the catalog. The mark starts clean.
    #[allow(clippy::too_many_arguments)]
    pub fn restored(
        id: i32,
        job_id: i32,
        revision: String,
        via: Via,
        success: bool,
        log_file: Option<String>,
        node: Option<String>,
        command: BuildCommand,
        target: String,
        start_at: Option<DateTime<Utc>>,
        finished_at: Option<DateTime<Utc>>,
    ) -> Self {
        Task {
            id,
            job_id,
            revision,
            via,
            success,
            log_file,
            node,
            command,
            target,
            start_at,
            finished_at,
            mark: BTreeSet::new(),
        }
    }

    /// Terminal iff `finished_at` is set; only then is `success` meaningful.
    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn set_revision(&mut self, revision: impl Into<String>) {
        self.revision = revision.into();
        self.mark.insert(TaskColumn::Revision);
    }

    pub fn set_success(&mut self, success: bool) {
        self.success = success;
        self.mark.insert(TaskColumn::Success);
    }

    pub fn set_log_file(&mut self, key: impl Into<String>) {
        self.log_file = Some(key.into());
        self.mark.insert(TaskColumn::LogFile);
    }

    pub fn set_node(&mut self, node: impl Into<String>) {
        self.node = Some(node.into());
        self.mark.insert(TaskColumn::Node);
    }

    pub fn set_start_at(&mut self, at: DateTime<Utc>) {
        self.start_at = Some(at);
        self.mark.insert(TaskColumn::StartAt);
    }

    pub fn set_finished_at(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
        self.mark.insert(TaskColumn::FinishedAt);
    }

    /// Columns touched since the last `reset_mark`.
    pub fn changed_columns(&self) -> impl Iterator<Item = TaskColumn> + '_ {
        self.mark.iter().copied()
    }

    pub fn is_changed(&self) -> bool {
        !self.mark.is_empty()
    }

    pub fn reset_mark(&mut self) {
        self.mark.clear();
    }
}

/// Deterministic scheduler Job name for a task: `<job>-<task>-<short sha>`,
/// capped at 63 characters.
pub fn node_name(job_id: i32, task_id: i32, revision: &str) -> String {
    let short = &revision[..revision.len().min(7)];
    let mut name = format!("{}-{}-{}", job_id, task_id, short);
    if name.len() > MAX_NODE_NAME {
        name.truncate(MAX_NODE_NAME);
    }
    while name.ends_with('-') {
        name.pop();
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job {
            id: 1,
            repository_id: 1,
            command: BuildCommand::Test,
            target: "//...".to_string(),
            bazel_version: "6.0.0".to_string(),
            config_name: String::new(),
            all_revision: false,
            github_status: true,
            exclusive: false,
        }
    }

    #[test]
    fn test_mark_tracks_setters() {
        let mut task = Task::new(&job(), "abc123", Via::Api);
        assert!(!task.is_changed());

        task.set_success(true);
        task.set_finished_at(Utc::now());
        let changed: Vec<_> = task.changed_columns().collect();
        assert_eq!(changed, vec![TaskColumn::Success, TaskColumn::FinishedAt]);

        task.reset_mark();
        assert!(!task.is_changed());
    }

    #[test]
    fn test_clone_keeps_mark_independent() {
        let mut task = Task::new(&job(), "abc123", Via::Api);
        task.set_node("1-0-abc123");

        let mut copy = task.clone();
        copy.reset_mark();
        assert!(task.is_changed());
        assert!(!copy.is_changed());
    }

    #[test]
    fn test_terminal_iff_finished() {
        let mut task = Task::new(&job(), "abc123", Via::Webhook);
        assert!(!task.is_terminal());
        task.set_finished_at(Utc::now());
        assert!(task.is_terminal());
    }

    #[test]
    fn test_node_name_short_sha() {
        assert_eq!(node_name(1, 1, "abc123def456"), "1-1-abc123d");
        assert_eq!(node_name(1, 2, "ab"), "1-2-ab");
    }

    #[test]
    fn test_node_name_capped_at_63() {
        let name = node_name(1234567, 7654321, "a".repeat(80).as_str());
        assert!(name.len() <= 63);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn test_fingerprint_distinguishes_revisions() {
        let j = job();
        assert_eq!(j.fingerprint("abc"), j.fingerprint("abc"));
        assert_ne!(j.fingerprint("abc"), j.fingerprint("def"));
    }

    #[test]
    fn test_command_round_trip() {
        for cmd in [BuildCommand::Build, BuildCommand::Test] {
            assert_eq!(cmd.to_string().parse::<BuildCommand>().unwrap(), cmd);
        }
        assert!("deploy".parse::<BuildCommand>().is_err());
    }
}
