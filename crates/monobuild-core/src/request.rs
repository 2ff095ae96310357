//! Transient request records produced by the ingress layer.

use serde::{Deserialize, Serialize};

use crate::task::{BuildCommand, Via};

/// A validated-on-admission build request. Becomes one task per resolved
/// revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Direct reference to a catalog job. When absent, the job is resolved
    /// from `repository` + `command` + `target`.
    pub job_id: Option<i32>,
    /// Repository name as registered in the catalog.
    pub repository: Option<String>,
    pub command: Option<BuildCommand>,
    pub target: Option<String>,
    /// Revisions referenced by the trigger. Empty means "head of the
    /// default branch".
    pub revisions: Vec<String>,
    pub via: Via,
    /// GitHub user id of the actor, when known.
    pub actor: Option<i64>,
}

impl BuildRequest {
    pub fn for_job(job_id: i32, via: Via) -> Self {
        BuildRequest {
            job_id: Some(job_id),
            repository: None,
            command: None,
            target: None,
            revisions: Vec::new(),
            via,
            actor: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revisions.push(revision.into());
        self
    }
}

/// One repository record from a trusted source, used to upsert the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub name: String,
    pub url: String,
    pub clone_url: String,
}

/// Upsert request for the repository catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRepositoriesRequest {
    pub repositories: Vec<RepositorySpec>,
}
