//! Core domain types for the monobuild coordinator.
//!
//! This crate contains:
//! - Error kinds shared across the workspace
//! - Catalog entities (repository, job, task, trusted user) with
//!   column-level modification marks
//! - Build requests and admission fingerprints
//! - Normalized scheduler job events and the handler seam
//! - The indexer manifest record

pub mod error;
pub mod event;
pub mod logs;
pub mod manifest;
pub mod request;
pub mod task;

pub use error::{Error, Result};
pub use event::{JobEvent, JobEventHandler, JobPhase};

use std::time::Duration;

/// Timeout applied to every catalog call.
pub const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);
/// Timeout applied to scheduler API calls.
pub const SCHEDULER_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout applied to GitHub calls.
pub const GITHUB_TIMEOUT: Duration = Duration::from_secs(15);

/// Label carrying the catalog job id on scheduler Jobs.
pub const LABEL_JOB_ID: &str = "build.coordinator/job-id";
/// Label carrying the catalog task id on scheduler Jobs.
pub const LABEL_TASK_ID: &str = "build.coordinator/task-id";
/// Pod annotation through which the sidecar reports the final log key.
pub const ANNOTATION_LOG_FILE: &str = "build.coordinator/log-file";
