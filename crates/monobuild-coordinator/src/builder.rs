//! The Bazel builder: request admission, job dispatch, event handling.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use k8s_openapi::api::batch::v1::{Job as KubeJob, JobSpec};
use k8s_openapi::api::core::v1::{
    CSIVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, ObjectFieldSelector,
    PodSpec, PodTemplateSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use monobuild_core::event::{JobEvent, JobEventHandler, JobPhase};
use monobuild_core::logs::log_file_key;
use monobuild_core::request::{BuildRequest, SyncRepositoriesRequest};
use monobuild_core::task::{Job, Repository, Task, node_name};
use monobuild_core::{
    ANNOTATION_LOG_FILE, CATALOG_TIMEOUT, Error, LABEL_JOB_ID, LABEL_TASK_ID, Result,
};
use monobuild_db::{Dao, DbResult};
use monobuild_executor::SchedulerClient;
use monobuild_storage::{ObjectStorage, S3Options};
use tracing::{debug, info, warn};

use crate::github::{CommitState, StatusReporter, parse_owner_repo};

/// Where the init container checks out the workspace.
const WORKSPACE_DIR: &str = "/workspace";
/// Shared volume the build writes its output to and the sidecar tails.
const BUILD_LOG_DIR: &str = "/var/log/build";

/// Bazel-specific knobs for synthesized jobs.
#[derive(Debug, Clone)]
pub struct BazelOptions {
    /// Passed to Bazel through `--remote_cache` when non-empty.
    pub remote_cache: String,
    /// Enable the experimental Remote Asset API. Requires a gRPC remote
    /// cache.
    pub remote_asset_api: bool,
    pub sidecar_image: String,
    pub bazel_image: String,
    pub default_bazel_version: String,
    pub ctl_image: String,
    /// Secret provider class holding the GitHub App key, mounted through
    /// the secret-store CSI driver.
    pub github_app_secret_name: String,
    pub task_cpu_limit: String,
    pub task_memory_limit: String,
}

/// Connection info for the secret manager, injected into build containers
/// so they can fetch registry credentials.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub addr: String,
    pub token: String,
}

/// Translates validated build requests into catalog tasks and scheduler
/// Jobs, and reacts to job lifecycle events.
///
/// Immutable after construction; methods may be called concurrently from
/// API handlers and watcher callbacks. The task row is the canonical
/// mutable state and the catalog serializes all writers.
pub struct BazelBuilder {
    dao: Dao,
    scheduler: Option<Arc<dyn SchedulerClient>>,
    storage: Arc<dyn ObjectStorage>,
    storage_opts: S3Options,
    reporter: Arc<dyn StatusReporter>,
    namespace: String,
    dashboard_url: String,
    opts: BazelOptions,
    vault: Option<VaultConfig>,
}

async fn catalog<T>(fut: impl Future<Output = DbResult<T>>) -> Result<T> {
    tokio::time::timeout(CATALOG_TIMEOUT, fut)
        .await
        .map_err(|_| Error::Transient("catalog deadline exceeded".to_string()))?
        .map_err(Into::into)
}

impl BazelBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dashboard_url: impl Into<String>,
        dao: Dao,
        scheduler: Option<Arc<dyn SchedulerClient>>,
        storage: Arc<dyn ObjectStorage>,
        storage_opts: S3Options,
        reporter: Arc<dyn StatusReporter>,
        namespace: impl Into<String>,
        opts: BazelOptions,
        vault: Option<VaultConfig>,
    ) -> Self {
        BazelBuilder {
            dao,
            scheduler,
            storage,
            storage_opts,
            reporter,
            namespace: namespace.into(),
            dashboard_url: dashboard_url.into(),
            opts,
            vault,
        }
    }

    /// Validate the request, resolve revisions, and create one task (and
    /// scheduler Job) per resolved revision.
    pub async fn build(&self, req: BuildRequest) -> Result<Vec<Task>> {
        let job = self.resolve_job(&req).await?;
        let repository = catalog(self.dao.repository.get(job.repository_id)).await?;
        let revisions = self.resolve_revisions(&job, &repository, &req).await?;

        if job.exclusive {
            let in_flight = catalog(self.dao.task.list_in_flight(job.id)).await?;
            if !in_flight.is_empty() {
                return Err(Error::Conflict(format!(
                    "job {} already has {} task(s) in flight",
                    job.id,
                    in_flight.len()
                )));
            }
        }

        let mut tasks = Vec::with_capacity(revisions.len());
        for revision in revisions {
            tasks.push(self.dispatch(&job, &repository, revision, req.via).await?);
        }
        Ok(tasks)
    }

    /// Upsert the repository catalog from a trusted source.
    pub async fn sync_repositories(&self, req: SyncRepositoriesRequest) -> Result<()> {
        for spec in &req.repositories {
            if spec.name.is_empty() {
                return Err(Error::Validation("repository name is empty".to_string()));
            }
            let repo = catalog(self.dao.repository.upsert(spec)).await?;
            debug!(repository = %repo.name, id = repo.id, "Synced repository");
        }
        Ok(())
    }

    /// Best-effort job deletion plus a terminal task update.
    pub async fn cancel(&self, task_id: i32) -> Result<()> {
        let mut task = catalog(self.dao.task.get(task_id)).await?;
        if task.is_terminal() {
            return Ok(());
        }

        if let (Some(scheduler), Some(node)) = (&self.scheduler, task.node.as_deref()) {
            if let Err(e) = scheduler.delete_job(node).await {
                warn!(task = task_id, node, error = %e, "Failed to delete scheduler job");
            }
        }

        task.set_success(false);
        task.set_finished_at(Utc::now());
        catalog(self.dao.task.update(&mut task)).await?;
        info!(task = task_id, "Cancelled task");
        Ok(())
    }

    async fn resolve_job(&self, req: &BuildRequest) -> Result<Job> {
        if let Some(job_id) = req.job_id {
            return catalog(self.dao.job.get(job_id)).await;
        }

        let name = req
            .repository
            .as_deref()
            .ok_or_else(|| Error::Validation("request names neither job nor repository".to_string()))?;
        let repository = catalog(self.dao.repository.get_by_name(name))
            .await?
            .ok_or_else(|| Error::Validation(format!("unknown repository: {}", name)))?;

        let jobs = catalog(self.dao.job.list_by_repository(repository.id)).await?;
        jobs.into_iter()
            .find(|j| {
                req.command.is_none_or(|c| c == j.command)
                    && req.target.as_deref().is_none_or(|t| t == j.target)
            })
            .ok_or_else(|| {
                Error::Validation(format!("no job matches the request for {}", name))
            })
    }

    async fn resolve_revisions(
        &self,
        job: &Job,
        repository: &Repository,
        req: &BuildRequest,
    ) -> Result<Vec<String>> {
        let given: Vec<String> = req
            .revisions
            .iter()
            .filter(|r| !r.is_empty())
            .cloned()
            .collect();

        if job.all_revision && !given.is_empty() {
            return Ok(given);
        }
        if let Some(first) = given.first() {
            // Without all_revision only the head of the trigger is built.
            return Ok(vec![first.clone()]);
        }

        let (owner, name) = parse_owner_repo(&repository.url)?;
        let head = self.reporter.head_revision(&owner, &name).await?;
        Ok(vec![head])
    }

    /// Persist-then-dispatch: catalog row first, scheduler Job second, then
    /// the conditional `node` write. Failure to create the Job terminates
    /// the task with a synthetic error log so every task has a durable
    /// outcome.
    async fn dispatch(
        &self,
        job: &Job,
        repository: &Repository,
        revision: String,
        via: monobuild_core::task::Via,
    ) -> Result<Task> {
        let task = Task::new(job, &revision, via);
        let mut task = catalog(self.dao.task.create(&task)).await?;

        let Some(scheduler) = &self.scheduler else {
            info!(task = task.id, "Scheduler disabled; task stays pending");
            return Ok(task);
        };

        let node = node_name(job.id, task.id, &revision);
        let manifest = self.job_manifest(job, repository, &task, &node);
        let created = match scheduler.create_job(manifest).await {
            Ok(()) => Ok(()),
            // The job already exists from an earlier attempt.
            Err(Error::Upstream { ref code, .. }) if code == "409" => Ok(()),
            Err(e) => Err(e),
        };

        match created {
            Ok(()) => {
                if catalog(self.dao.task.set_node(task.id, &node)).await? {
                    task.node = Some(node);
                } else {
                    debug!(task = task.id, "Node already recorded");
                }
                info!(task = task.id, job = job.id, revision = %task.revision, "Dispatched task");
                Ok(task)
            }
            Err(e) => {
                let key = log_file_key(job.id, task.id);
                let diagnostic = format!("failed to create scheduler job {}: {}\n", node, e);
                if let Err(put_err) = self.storage.put(&key, Bytes::from(diagnostic)).await {
                    warn!(task = task.id, error = %put_err, "Failed to write diagnostic log");
                }

                task.set_success(false);
                task.set_finished_at(Utc::now());
                task.set_log_file(&key);
                catalog(self.dao.task.update(&mut task)).await?;
                Err(e)
            }
        }
    }

    async fn handle_event(&self, event: JobEvent) -> Result<()> {
        let Some(mut task) = catalog(self.dao.task.get_by_node(&event.job_key)).await? else {
            debug!(job_key = %event.job_key, "Event for unknown node");
            return Ok(());
        };

        // Re-delivery never regresses a terminal task.
        if task.is_terminal() {
            return Ok(());
        }

        match event.phase {
            JobPhase::Pending | JobPhase::Unknown => Ok(()),
            JobPhase::Running => {
                if task.start_at.is_none() {
                    task.set_start_at(Utc::now());
                    catalog(self.dao.task.update(&mut task)).await?;
                    self.report_status(&task, CommitState::Pending, "build running")
                        .await;
                }
                Ok(())
            }
            JobPhase::Succeeded => self.finish_task(task, true, event.terminal_reason).await,
            JobPhase::Failed => self.finish_task(task, false, event.terminal_reason).await,
        }
    }

    async fn finish_task(
        &self,
        mut task: Task,
        success: bool,
        reason: Option<String>,
    ) -> Result<()> {
        let key = self
            .annotated_log_file(task.node.as_deref())
            .await
            .unwrap_or_else(|| log_file_key(task.job_id, task.id));

        task.set_success(success);
        task.set_finished_at(Utc::now());
        task.set_log_file(key);
        catalog(self.dao.task.update(&mut task)).await?;
        info!(task = task.id, success, reason = ?reason, "Task finished");

        let (state, description) = if success {
            (CommitState::Success, "build succeeded".to_string())
        } else {
            (
                CommitState::Failure,
                reason.unwrap_or_else(|| "build failed".to_string()),
            )
        };
        self.report_status(&task, state, &description).await;
        Ok(())
    }

    /// The sidecar may have recorded the final log key on the pod.
    async fn annotated_log_file(&self, node: Option<&str>) -> Option<String> {
        let scheduler = self.scheduler.as_ref()?;
        let node = node?;
        match scheduler.pod_annotations(node).await {
            Ok(annotations) => annotations.get(ANNOTATION_LOG_FILE).cloned(),
            Err(e) => {
                debug!(node, error = %e, "Could not read pod annotations");
                None
            }
        }
    }

    /// Post a commit status. Best-effort: failures are logged, never
    /// propagated.
    async fn report_status(&self, task: &Task, state: CommitState, description: &str) {
        let result: Result<()> = async {
            let job = catalog(self.dao.job.get(task.job_id)).await?;
            if !job.github_status || task.revision.is_empty() {
                return Ok(());
            }
            let repository = catalog(self.dao.repository.get(job.repository_id)).await?;
            let (owner, name) = parse_owner_repo(&repository.url)?;
            let target_url = format!("{}/task/{}", self.dashboard_url, task.id);
            self.reporter
                .post_status(&owner, &name, &task.revision, state, description, &target_url)
                .await
        }
        .await;

        if let Err(e) = result {
            warn!(task = task.id, error = %e, "Failed to report commit status");
        }
    }

    fn bazel_args(&self, job: &Job) -> Vec<String> {
        let mut args = vec!["bazel".to_string(), job.command.to_string()];
        if !job.config_name.is_empty() {
            args.push(format!("--config={}", job.config_name));
        }
        if !self.opts.remote_cache.is_empty() {
            args.push(format!("--remote_cache={}", self.opts.remote_cache));
            if self.opts.remote_asset_api {
                args.push("--experimental_remote_asset".to_string());
            }
        }
        args.push(job.target.clone());
        args
    }

    fn bazel_image(&self, job: &Job) -> String {
        let version = if job.bazel_version.is_empty() {
            &self.opts.default_bazel_version
        } else {
            &job.bazel_version
        };
        format!("{}:{}", self.opts.bazel_image, version)
    }

    /// Synthesize the scheduler Job manifest: clone init container, bazel
    /// build container, and the log sidecar sharing the output volume.
    fn job_manifest(
        &self,
        job: &Job,
        repository: &Repository,
        task: &Task,
        node: &str,
    ) -> KubeJob {
        let labels = BTreeMap::from([
            (LABEL_JOB_ID.to_string(), job.id.to_string()),
            (LABEL_TASK_ID.to_string(), task.id.to_string()),
        ]);

        let workdir_mount = VolumeMount {
            name: "workdir".to_string(),
            mount_path: WORKSPACE_DIR.to_string(),
            ..Default::default()
        };
        let log_mount = VolumeMount {
            name: "build-logs".to_string(),
            mount_path: BUILD_LOG_DIR.to_string(),
            ..Default::default()
        };

        let clone = Container {
            name: "clone".to_string(),
            image: Some(self.opts.ctl_image.clone()),
            args: Some(vec![
                "clone".to_string(),
                "--url".to_string(),
                repository.clone_url.clone(),
                "--revision".to_string(),
                task.revision.clone(),
                "--work-dir".to_string(),
                WORKSPACE_DIR.to_string(),
            ]),
            volume_mounts: Some(vec![workdir_mount.clone()]),
            ..Default::default()
        };

        let sidecar = Container {
            name: "log-sidecar".to_string(),
            image: Some(self.opts.sidecar_image.clone()),
            // Native sidecar: stops after the build container completes.
            restart_policy: Some("Always".to_string()),
            args: Some(vec![
                "--job-id".to_string(),
                job.id.to_string(),
                "--task-id".to_string(),
                task.id.to_string(),
                "--log-dir".to_string(),
                BUILD_LOG_DIR.to_string(),
            ]),
            env: Some(vec![
                env_var("MINIO_ENDPOINT", &self.storage_opts.endpoint),
                env_var("MINIO_BUCKET", &self.storage_opts.bucket),
                env_var("MINIO_ACCESS_KEY", &self.storage_opts.access_key),
                env_var("MINIO_SECRET_ACCESS_KEY", &self.storage_opts.secret_access_key),
                field_env_var("POD_NAME", "metadata.name"),
                field_env_var("POD_NAMESPACE", "metadata.namespace"),
            ]),
            volume_mounts: Some(vec![log_mount.clone()]),
            ..Default::default()
        };

        let script = format!(
            "{} > {}/stdout.log 2> {}/stderr.log",
            self.bazel_args(job).join(" "),
            BUILD_LOG_DIR,
            BUILD_LOG_DIR,
        );
        let mut build_env = Vec::new();
        if let Some(vault) = &self.vault {
            build_env.push(env_var("VAULT_ADDR", &vault.addr));
        }
        let mut build_mounts = vec![workdir_mount, log_mount];
        if !self.opts.github_app_secret_name.is_empty() {
            build_mounts.push(VolumeMount {
                name: "github-app".to_string(),
                mount_path: "/etc/github".to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let build = Container {
            name: "build".to_string(),
            image: Some(self.bazel_image(job)),
            command: Some(vec!["sh".to_string(), "-c".to_string(), script]),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            env: (!build_env.is_empty()).then_some(build_env),
            volume_mounts: Some(build_mounts),
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity(self.opts.task_cpu_limit.clone())),
                    (
                        "memory".to_string(),
                        Quantity(self.opts.task_memory_limit.clone()),
                    ),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut volumes = vec![
            Volume {
                name: "workdir".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            Volume {
                name: "build-logs".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ];
        if !self.opts.github_app_secret_name.is_empty() {
            volumes.push(Volume {
                name: "github-app".to_string(),
                csi: Some(CSIVolumeSource {
                    driver: "secrets-store.csi.k8s.io".to_string(),
                    read_only: Some(true),
                    volume_attributes: Some(BTreeMap::from([(
                        "secretProviderClass".to_string(),
                        self.opts.github_app_secret_name.clone(),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        KubeJob {
            metadata: ObjectMeta {
                name: Some(node.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        init_containers: Some(vec![clone, sidecar]),
                        containers: vec![build],
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn field_env_var(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl JobEventHandler for BazelBuilder {
    async fn on_job_event(&self, event: JobEvent) -> Result<()> {
        // The watcher retries on Transient; nothing else may escape.
        self.handle_event(event).await.map_err(|e| {
            if e.is_transient() {
                e
            } else {
                Error::Transient(e.to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        MemoryCatalog, MockScheduler, RecordingReporter, dao, memory_storage, storage_opts,
    };
    use monobuild_core::task::{BuildCommand, Via};

    struct Fixture {
        catalog: Arc<MemoryCatalog>,
        scheduler: Arc<MockScheduler>,
        reporter: Arc<RecordingReporter>,
        storage: Arc<dyn ObjectStorage>,
        builder: BazelBuilder,
        job: Job,
    }

    fn options() -> BazelOptions {
        BazelOptions {
            remote_cache: "grpc://cache.internal:9090".to_string(),
            remote_asset_api: false,
            sidecar_image: "registry.internal/build/sidecar".to_string(),
            bazel_image: "ghcr.io/bazelbuild/bazel".to_string(),
            default_bazel_version: "6.0.0".to_string(),
            ctl_image: "registry.internal/build/ctl".to_string(),
            github_app_secret_name: "github-app".to_string(),
            task_cpu_limit: "1000m".to_string(),
            task_memory_limit: "4096Mi".to_string(),
        }
    }

    fn fixture(configure: impl FnOnce(&mut Job)) -> Fixture {
        let catalog = Arc::new(MemoryCatalog::default());
        let repository =
            catalog.seed_repository("mono", "https://github.com/f110/mono", "https://github.com/f110/mono.git");
        let mut job = Job {
            id: 0,
            repository_id: repository.id,
            command: BuildCommand::Test,
            target: "//...".to_string(),
            bazel_version: String::new(),
            config_name: String::new(),
            all_revision: false,
            github_status: true,
            exclusive: false,
        };
        configure(&mut job);
        let job = catalog.seed_job(job);

        let scheduler = Arc::new(MockScheduler::default());
        let reporter = Arc::new(RecordingReporter::new("feedbee"));
        let storage = memory_storage();
        let builder = BazelBuilder::new(
            "http://dashboard.localhost",
            dao(&catalog),
            Some(scheduler.clone()),
            storage.clone(),
            storage_opts(),
            reporter.clone(),
            "build",
            options(),
            None,
        );

        Fixture {
            catalog,
            scheduler,
            reporter,
            storage,
            builder,
            job,
        }
    }

    fn request(job_id: i32, revision: &str) -> BuildRequest {
        BuildRequest::for_job(job_id, Via::Api).with_revision(revision)
    }

    #[tokio::test]
    async fn test_build_persists_then_dispatches() {
        let f = fixture(|_| {});

        let tasks = f.builder.build(request(f.job.id, "abc123")).await.unwrap();
        assert_eq!(tasks.len(), 1);

        let task = &tasks[0];
        assert_eq!(task.via, Via::Api);
        assert_eq!(task.revision, "abc123");
        assert_eq!(task.node.as_deref(), Some("1-1-abc123"));
        assert!(!task.is_terminal());

        assert_eq!(f.scheduler.created_names(), vec!["1-1-abc123"]);
        let stored = f.catalog.task(task.id).unwrap();
        assert_eq!(stored.node.as_deref(), Some("1-1-abc123"));
    }

    #[tokio::test]
    async fn test_build_resolves_job_by_repository() {
        let f = fixture(|_| {});

        let req = BuildRequest {
            job_id: None,
            repository: Some("mono".to_string()),
            command: Some(BuildCommand::Test),
            target: Some("//...".to_string()),
            revisions: vec!["abc123".to_string()],
            via: Via::Api,
            actor: None,
        };
        let tasks = f.builder.build(req).await.unwrap();
        assert_eq!(tasks[0].job_id, f.job.id);
    }

    #[tokio::test]
    async fn test_build_rejects_unknown_repository() {
        let f = fixture(|_| {});

        let req = BuildRequest {
            job_id: None,
            repository: Some("nonexistent".to_string()),
            command: None,
            target: None,
            revisions: vec![],
            via: Via::Api,
            actor: None,
        };
        let err = f.builder.build(req).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_build_resolves_head_revision() {
        let f = fixture(|_| {});

        let tasks = f
            .builder
            .build(BuildRequest::for_job(f.job.id, Via::Api))
            .await
            .unwrap();
        assert_eq!(tasks[0].revision, "feedbee");
    }

    #[tokio::test]
    async fn test_exclusive_conflict() {
        let f = fixture(|job| job.exclusive = true);

        f.builder.build(request(f.job.id, "abc123")).await.unwrap();
        let err = f.builder.build(request(f.job.id, "def456")).await.unwrap_err();
        assert!(err.is_conflict());

        let in_flight: Vec<_> = f
            .catalog
            .tasks()
            .into_iter()
            .filter(|t| !t.is_terminal())
            .collect();
        assert_eq!(in_flight.len(), 1);
    }

    #[tokio::test]
    async fn test_all_revision_fanout() {
        let f = fixture(|job| job.all_revision = true);

        let req = BuildRequest {
            job_id: Some(f.job.id),
            repository: None,
            command: None,
            target: None,
            revisions: vec!["aaa111".into(), "bbb222".into(), "ccc333".into()],
            via: Via::Webhook,
            actor: None,
        };
        let tasks = f.builder.build(req).await.unwrap();
        assert_eq!(tasks.len(), 3);

        let mut nodes: Vec<_> = tasks.iter().filter_map(|t| t.node.clone()).collect();
        nodes.sort();
        nodes.dedup();
        assert_eq!(nodes.len(), 3);
        assert_eq!(f.scheduler.created_names().len(), 3);
    }

    #[tokio::test]
    async fn test_without_all_revision_only_head_is_built() {
        let f = fixture(|_| {});

        let req = BuildRequest {
            job_id: Some(f.job.id),
            repository: None,
            command: None,
            target: None,
            revisions: vec!["head00".into(), "older1".into(), "older2".into()],
            via: Via::Webhook,
            actor: None,
        };
        let tasks = f.builder.build(req).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].revision, "head00");
    }

    #[tokio::test]
    async fn test_scheduler_failure_terminates_task_with_diagnostic() {
        let f = fixture(|_| {});
        *f.scheduler.fail_create.lock().unwrap() = Some("quota exceeded".to_string());

        let err = f.builder.build(request(f.job.id, "abc123")).await.unwrap_err();
        assert!(matches!(err, Error::Upstream { .. }));

        let task = f.catalog.task(1).unwrap();
        assert!(task.is_terminal());
        assert!(!task.success);
        assert_eq!(task.log_file.as_deref(), Some("logs/1/1.log"));

        let log = f.storage.get_bytes("logs/1/1.log").await.unwrap();
        let log = String::from_utf8(log.to_vec()).unwrap();
        assert!(log.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_event_lifecycle_and_status_reports() {
        let f = fixture(|_| {});
        f.builder.build(request(f.job.id, "abc123")).await.unwrap();

        f.builder
            .on_job_event(JobEvent::new("1-1-abc123", JobPhase::Running))
            .await
            .unwrap();
        let running = f.catalog.task(1).unwrap();
        assert!(running.start_at.is_some());
        assert!(!running.is_terminal());

        f.builder
            .on_job_event(JobEvent::new("1-1-abc123", JobPhase::Succeeded))
            .await
            .unwrap();
        let finished = f.catalog.task(1).unwrap();
        assert!(finished.success);
        assert!(finished.finished_at.is_some());
        assert_eq!(finished.log_file.as_deref(), Some("logs/1/1.log"));

        assert_eq!(
            f.reporter.states(),
            vec![CommitState::Pending, CommitState::Success]
        );
    }

    #[tokio::test]
    async fn test_event_redelivery_is_idempotent() {
        let f = fixture(|_| {});
        f.builder.build(request(f.job.id, "abc123")).await.unwrap();

        let event = JobEvent::new("1-1-abc123", JobPhase::Succeeded);
        f.builder.on_job_event(event.clone()).await.unwrap();
        let first = f.catalog.task(1).unwrap();

        f.builder.on_job_event(event).await.unwrap();
        let second = f.catalog.task(1).unwrap();

        assert_eq!(first.finished_at, second.finished_at);
        assert_eq!(first.success, second.success);
        // No duplicate status post either.
        assert_eq!(f.reporter.states().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_event_records_reason() {
        let f = fixture(|_| {});
        f.builder.build(request(f.job.id, "abc123")).await.unwrap();

        f.builder
            .on_job_event(
                JobEvent::new("1-1-abc123", JobPhase::Failed)
                    .with_reason("BackoffLimitExceeded"),
            )
            .await
            .unwrap();

        let task = f.catalog.task(1).unwrap();
        assert!(task.is_terminal());
        assert!(!task.success);
        assert_eq!(f.reporter.states(), vec![CommitState::Failure]);
    }

    #[tokio::test]
    async fn test_event_for_unknown_node_is_noop() {
        let f = fixture(|_| {});
        f.builder
            .on_job_event(JobEvent::new("9-9-zzzzzzz", JobPhase::Succeeded))
            .await
            .unwrap();
        assert!(f.catalog.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_annotation_overrides_log_file() {
        let f = fixture(|_| {});
        f.builder.build(request(f.job.id, "abc123")).await.unwrap();
        f.scheduler.annotations.lock().unwrap().insert(
            "1-1-abc123".to_string(),
            BTreeMap::from([(
                ANNOTATION_LOG_FILE.to_string(),
                "logs/1/1-partial.log".to_string(),
            )]),
        );

        f.builder
            .on_job_event(JobEvent::new("1-1-abc123", JobPhase::Succeeded))
            .await
            .unwrap();
        let task = f.catalog.task(1).unwrap();
        assert_eq!(task.log_file.as_deref(), Some("logs/1/1-partial.log"));
    }

    #[tokio::test]
    async fn test_cancel_deletes_job_and_terminates() {
        let f = fixture(|_| {});
        let tasks = f.builder.build(request(f.job.id, "abc123")).await.unwrap();

        f.builder.cancel(tasks[0].id).await.unwrap();

        assert_eq!(f.scheduler.deleted.lock().unwrap().clone(), vec!["1-1-abc123"]);
        let task = f.catalog.task(tasks[0].id).unwrap();
        assert!(task.is_terminal());
        assert!(!task.success);
    }

    #[tokio::test]
    async fn test_cancel_terminal_task_is_noop() {
        let f = fixture(|_| {});
        f.builder.build(request(f.job.id, "abc123")).await.unwrap();
        f.builder
            .on_job_event(JobEvent::new("1-1-abc123", JobPhase::Succeeded))
            .await
            .unwrap();

        f.builder.cancel(1).await.unwrap();
        assert!(f.scheduler.deleted.lock().unwrap().is_empty());
        assert!(f.catalog.task(1).unwrap().success);
    }

    #[tokio::test]
    async fn test_sync_repositories_upserts() {
        let f = fixture(|_| {});
        f.builder
            .sync_repositories(SyncRepositoriesRequest {
                repositories: vec![
                    monobuild_core::request::RepositorySpec {
                        name: "mono".to_string(),
                        url: "https://github.com/f110/mono".to_string(),
                        clone_url: "https://github.com/f110/mono2.git".to_string(),
                    },
                    monobuild_core::request::RepositorySpec {
                        name: "tools".to_string(),
                        url: "https://github.com/f110/tools".to_string(),
                        clone_url: "https://github.com/f110/tools.git".to_string(),
                    },
                ],
            })
            .await
            .unwrap();

        let repos = monobuild_db::repo::RepositoryRepo::list(&*f.catalog).await.unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].clone_url, "https://github.com/f110/mono2.git");
    }

    #[tokio::test]
    async fn test_manifest_contains_sidecar_and_labels() {
        let f = fixture(|_| {});
        f.builder.build(request(f.job.id, "abc123")).await.unwrap();

        let jobs = f.scheduler.created.lock().unwrap();
        let manifest = &jobs[0];
        let labels = manifest.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_JOB_ID).unwrap(), "1");
        assert_eq!(labels.get(LABEL_TASK_ID).unwrap(), "1");

        let spec = manifest.spec.as_ref().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        let pod = spec.template.spec.as_ref().unwrap();
        let init: Vec<_> = pod
            .init_containers
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(init, vec!["clone", "log-sidecar"]);
        assert_eq!(pod.containers[0].name, "build");

        let script = pod.containers[0].command.as_ref().unwrap().join(" ");
        assert!(script.contains("bazel test"));
        assert!(script.contains("--remote_cache=grpc://cache.internal:9090"));
        assert!(script.contains("//..."));
    }
}
