//! GitHub reporting seam.
//!
//! The coordinator talks to GitHub through this capability so tests can
//! observe status traffic without a network.

use async_trait::async_trait;
use monobuild_core::{Error, GITHUB_TIMEOUT, Result};
use octocrab::Octocrab;
use url::Url;

/// Commit status states the coordinator reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Pending,
    Success,
    Failure,
}

#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Head revision of the repository's default branch.
    async fn head_revision(&self, owner: &str, name: &str) -> Result<String>;

    /// Post a commit status. Best-effort at the call sites; the task state
    /// stays authoritative.
    async fn post_status(
        &self,
        owner: &str,
        name: &str,
        revision: &str,
        state: CommitState,
        description: &str,
        target_url: &str,
    ) -> Result<()>;
}

/// Split a GitHub repository URL into owner and repository name.
pub fn parse_owner_repo(repo_url: &str) -> Result<(String, String)> {
    let url = Url::parse(repo_url)
        .map_err(|e| Error::Validation(format!("invalid repository url {}: {}", repo_url, e)))?;
    let mut segments = url
        .path_segments()
        .ok_or_else(|| Error::Validation(format!("invalid repository url {}", repo_url)))?;
    let owner = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Validation(format!("repository url lacks owner: {}", repo_url)))?;
    let name = segments
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Validation(format!("repository url lacks name: {}", repo_url)))?;

    Ok((owner.to_string(), name.trim_end_matches(".git").to_string()))
}

/// Reporter backed by a GitHub App installation client.
pub struct GithubReporter {
    client: Octocrab,
    context: String,
}

impl GithubReporter {
    pub fn new(client: Octocrab) -> Self {
        GithubReporter {
            client,
            context: "monobuild".to_string(),
        }
    }
}

fn upstream(err: octocrab::Error) -> Error {
    Error::upstream("github", err.to_string())
}

#[async_trait]
impl StatusReporter for GithubReporter {
    async fn head_revision(&self, owner: &str, name: &str) -> Result<String> {
        let fut = async {
            let repo = self
                .client
                .repos(owner, name)
                .get()
                .await
                .map_err(upstream)?;
            let branch = repo.default_branch.unwrap_or_else(|| "main".to_string());

            let commits = self
                .client
                .repos(owner, name)
                .list_commits()
                .branch(branch)
                .per_page(1)
                .send()
                .await
                .map_err(upstream)?;
            commits
                .items
                .into_iter()
                .next()
                .map(|c| c.sha)
                .ok_or_else(|| Error::NotFound(format!("{}/{} has no commits", owner, name)))
        };

        tokio::time::timeout(GITHUB_TIMEOUT, fut)
            .await
            .map_err(|_| Error::Transient("github deadline exceeded".to_string()))?
    }

    async fn post_status(
        &self,
        owner: &str,
        name: &str,
        revision: &str,
        state: CommitState,
        description: &str,
        target_url: &str,
    ) -> Result<()> {
        let status = match state {
            CommitState::Pending => octocrab::models::StatusState::Pending,
            CommitState::Success => octocrab::models::StatusState::Success,
            CommitState::Failure => octocrab::models::StatusState::Failure,
        };

        let repo_handler = self.client.repos(owner, name);
        let fut = repo_handler
            .create_status(revision.to_string(), status)
            .context(self.context.clone())
            .description(description.to_string())
            .target(target_url.to_string())
            .send();

        tokio::time::timeout(GITHUB_TIMEOUT, fut)
            .await
            .map_err(|_| Error::Transient("github deadline exceeded".to_string()))?
            .map_err(upstream)?;
        Ok(())
    }
}
