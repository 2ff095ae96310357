//! In-memory doubles for the catalog, scheduler, and reporter seams.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use monobuild_core::request::RepositorySpec;
use monobuild_core::task::{Job, Repository, Task, TaskColumn, TrustedUser};
use monobuild_core::{Error, Result};
use monobuild_db::repo::{JobRepo, RepositoryRepo, TaskRepo, TrustedUserRepo};
use monobuild_db::{Dao, DbError, DbResult};
use monobuild_executor::{JobChange, SchedulerClient};
use monobuild_storage::{ObjectStorage, S3Options, S3Storage};
use object_store::memory::InMemory;

use crate::github::{CommitState, StatusReporter};

#[derive(Default)]
struct CatalogState {
    repositories: Vec<Repository>,
    jobs: Vec<Job>,
    tasks: Vec<Task>,
    trusted: Vec<TrustedUser>,
    next_repository_id: i32,
    next_job_id: i32,
    next_task_id: i32,
}

/// One shared state implementing every catalog trait.
#[derive(Default)]
pub(crate) struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub(crate) fn seed_repository(&self, name: &str, url: &str, clone_url: &str) -> Repository {
        let mut state = self.state.lock().unwrap();
        state.next_repository_id += 1;
        let repo = Repository {
            id: state.next_repository_id,
            name: name.to_string(),
            url: url.to_string(),
            clone_url: clone_url.to_string(),
        };
        state.repositories.push(repo.clone());
        repo
    }

    pub(crate) fn seed_job(&self, job: Job) -> Job {
        let mut state = self.state.lock().unwrap();
        state.next_job_id += 1;
        let mut job = job;
        job.id = state.next_job_id;
        state.jobs.push(job.clone());
        job
    }

    pub(crate) fn seed_trusted_user(&self, github_id: i64) {
        let mut state = self.state.lock().unwrap();
        let id = state.trusted.len() as i32 + 1;
        state.trusted.push(TrustedUser {
            id,
            github_id,
            created_at: Utc::now(),
        });
    }

    pub(crate) fn task(&self, id: i32) -> Option<Task> {
        self.state
            .lock()
            .unwrap()
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub(crate) fn tasks(&self) -> Vec<Task> {
        self.state.lock().unwrap().tasks.clone()
    }

    pub(crate) fn insert_task(&self, mut task: Task) -> Task {
        let mut state = self.state.lock().unwrap();
        state.next_task_id += 1;
        task.id = state.next_task_id;
        task.reset_mark();
        state.tasks.push(task.clone());
        task
    }
}

#[async_trait]
impl RepositoryRepo for MemoryCatalog {
    async fn get(&self, id: i32) -> DbResult<Repository> {
        self.state
            .lock()
            .unwrap()
            .repositories
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("repository {}", id)))
    }

    async fn get_by_name(&self, name: &str) -> DbResult<Option<Repository>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .repositories
            .iter()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn list(&self) -> DbResult<Vec<Repository>> {
        Ok(self.state.lock().unwrap().repositories.clone())
    }

    async fn create(&self, spec: &RepositorySpec) -> DbResult<Repository> {
        Ok(self.seed_repository(&spec.name, &spec.url, &spec.clone_url))
    }

    async fn upsert(&self, spec: &RepositorySpec) -> DbResult<Repository> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state.repositories.iter_mut().find(|r| r.name == spec.name) {
                existing.url = spec.url.clone();
                existing.clone_url = spec.clone_url.clone();
                return Ok(existing.clone());
            }
        }
        Ok(self.seed_repository(&spec.name, &spec.url, &spec.clone_url))
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        self.state.lock().unwrap().repositories.retain(|r| r.id != id);
        Ok(())
    }
}

#[async_trait]
impl JobRepo for MemoryCatalog {
    async fn get(&self, id: i32) -> DbResult<Job> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list(&self) -> DbResult<Vec<Job>> {
        Ok(self.state.lock().unwrap().jobs.clone())
    }

    async fn list_by_repository(&self, repository_id: i32) -> DbResult<Vec<Job>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|j| j.repository_id == repository_id)
            .cloned()
            .collect())
    }

    async fn create(&self, job: &Job) -> DbResult<Job> {
        Ok(self.seed_job(job.clone()))
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        self.state.lock().unwrap().jobs.retain(|j| j.id != id);
        Ok(())
    }
}

#[async_trait]
impl TaskRepo for MemoryCatalog {
    async fn get(&self, id: i32) -> DbResult<Task> {
        self.task(id)
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))
    }

    async fn get_by_node(&self, node: &str) -> DbResult<Option<Task>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tasks
            .iter()
            .find(|t| t.node.as_deref() == Some(node))
            .cloned())
    }

    async fn list_by_job(&self, job_id: i32) -> DbResult<Vec<Task>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn list_in_flight(&self, job_id: i32) -> DbResult<Vec<Task>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|t| t.job_id == job_id && !t.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_expired(&self, cutoff: DateTime<Utc>) -> DbResult<Vec<Task>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tasks
            .iter()
            .filter(|t| t.finished_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn create(&self, task: &Task) -> DbResult<Task> {
        Ok(self.insert_task(task.clone()))
    }

    async fn update(&self, task: &mut Task) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .tasks
            .iter_mut()
            .find(|t| t.id == task.id)
            .ok_or_else(|| DbError::NotFound(format!("task {}", task.id)))?;
        for column in task.changed_columns() {
            match column {
                TaskColumn::Revision => stored.revision = task.revision.clone(),
                TaskColumn::Success => stored.success = task.success,
                TaskColumn::LogFile => stored.log_file = task.log_file.clone(),
                TaskColumn::Node => stored.node = task.node.clone(),
                TaskColumn::StartAt => stored.start_at = task.start_at,
                TaskColumn::FinishedAt => stored.finished_at = task.finished_at,
            }
        }
        task.reset_mark();
        Ok(())
    }

    async fn set_node(&self, id: i32, node: &str) -> DbResult<bool> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        if stored.node.is_some() {
            return Ok(false);
        }
        stored.node = Some(node.to_string());
        Ok(true)
    }

    async fn exists(&self, id: i32) -> DbResult<bool> {
        Ok(self.task(id).is_some())
    }

    async fn delete(&self, id: i32) -> DbResult<()> {
        self.state.lock().unwrap().tasks.retain(|t| t.id != id);
        Ok(())
    }
}

#[async_trait]
impl TrustedUserRepo for MemoryCatalog {
    async fn get_by_github_id(&self, github_id: i64) -> DbResult<Option<TrustedUser>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .trusted
            .iter()
            .find(|u| u.github_id == github_id)
            .cloned())
    }

    async fn create(&self, github_id: i64) -> DbResult<TrustedUser> {
        self.seed_trusted_user(github_id);
        Ok(self.get_by_github_id(github_id).await?.unwrap())
    }
}

pub(crate) fn dao(catalog: &Arc<MemoryCatalog>) -> Dao {
    Dao {
        repository: catalog.clone(),
        job: catalog.clone(),
        task: catalog.clone(),
        trusted_user: catalog.clone(),
    }
}

/// Scheduler double recording created and deleted jobs.
#[derive(Default)]
pub(crate) struct MockScheduler {
    pub(crate) created: Mutex<Vec<KubeJob>>,
    pub(crate) deleted: Mutex<Vec<String>>,
    pub(crate) fail_create: Mutex<Option<String>>,
    pub(crate) annotations: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
}

impl MockScheduler {
    pub(crate) fn created_names(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter_map(|j| j.metadata.name.clone())
            .collect()
    }
}

#[async_trait]
impl SchedulerClient for MockScheduler {
    async fn create_job(&self, job: KubeJob) -> Result<()> {
        if let Some(message) = self.fail_create.lock().unwrap().clone() {
            return Err(Error::upstream("500", message));
        }
        self.created.lock().unwrap().push(job);
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<KubeJob>> {
        Ok(self
            .created
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.metadata.name.as_deref() == Some(name))
            .cloned())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<KubeJob>> {
        Ok(self.created.lock().unwrap().clone())
    }

    fn watch_jobs(&self) -> BoxStream<'static, Result<JobChange>> {
        futures::stream::pending().boxed()
    }

    async fn pod_annotations(&self, job_name: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .annotations
            .lock()
            .unwrap()
            .get(job_name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Reporter double recording every status post.
pub(crate) struct RecordingReporter {
    pub(crate) head: String,
    pub(crate) statuses: Mutex<Vec<(String, CommitState, String)>>,
}

impl RecordingReporter {
    pub(crate) fn new(head: &str) -> Self {
        RecordingReporter {
            head: head.to_string(),
            statuses: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn states(&self) -> Vec<CommitState> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .map(|(_, state, _)| *state)
            .collect()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn head_revision(&self, _owner: &str, _name: &str) -> Result<String> {
        Ok(self.head.clone())
    }

    async fn post_status(
        &self,
        _owner: &str,
        _name: &str,
        revision: &str,
        state: CommitState,
        description: &str,
        _target_url: &str,
    ) -> Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((revision.to_string(), state, description.to_string()));
        Ok(())
    }
}

pub(crate) fn memory_storage() -> Arc<dyn ObjectStorage> {
    Arc::new(S3Storage::new(Arc::new(InMemory::new())))
}

pub(crate) fn storage_opts() -> S3Options {
    S3Options::via_endpoint("http://127.0.0.1:9000", "logs", "minio", "minio-secret")
}
