//! Normalized scheduler job events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Phase of a scheduler Job, normalized from raw cluster state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl JobPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }
}

/// A single lifecycle transition observed on a scheduler Job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Scheduler Job name; matches `Task.node`.
    pub job_key: String,
    pub phase: JobPhase,
    pub terminal_reason: Option<String>,
}

impl JobEvent {
    pub fn new(job_key: impl Into<String>, phase: JobPhase) -> Self {
        JobEvent {
            job_key: job_key.into(),
            phase,
            terminal_reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.terminal_reason = Some(reason.into());
        self
    }
}

/// Callback capability handed to the job watcher. The watcher signals, the
/// implementor mutates; failures must be `Transient` only.
#[async_trait]
pub trait JobEventHandler: Send + Sync {
    async fn on_job_event(&self, event: JobEvent) -> Result<()>;
}
