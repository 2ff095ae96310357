//! Process lifecycle.
//!
//! A single-threaded state machine sequences startup and shutdown:
//! Init -> Setup -> StartApiServer -> LeaderElection -> StartWorker ->
//! Shutdown. SIGINT/SIGTERM and loss of leadership both drive a clean
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use monobuild_coordinator::{
    BazelBuilder, BazelOptions, Gc, GithubReporter, JobWatcher, LeaderElection, LeaderEvent,
    VaultConfig,
};
use monobuild_db::Dao;
use monobuild_executor::{KubernetesScheduler, SchedulerClient};
use monobuild_storage::{ObjectStorage, S3Options};
use octocrab::Octocrab;
use octocrab::models::{AppId, InstallationId};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::routes;
use crate::state::AppState;

/// Grace period for draining in-flight API requests.
const API_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const GC_INTERVAL: Duration = Duration::from_secs(3600);
const GC_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Parser)]
#[command(name = "monobuild-builder", about = "Build coordinator")]
pub struct Options {
    /// Holder identity for leader election.
    #[arg(long, default_value_t = uuid::Uuid::new_v4().to_string())]
    pub id: String,

    /// Catalog data source name.
    #[arg(long, default_value = "")]
    pub dsn: String,

    /// Namespace the scheduler jobs are created in.
    #[arg(long, default_value = "")]
    pub namespace: String,

    #[arg(long)]
    pub enable_leader_election: bool,

    #[arg(long, default_value = "")]
    pub lease_lock_name: String,

    #[arg(long, default_value = "")]
    pub lease_lock_namespace: String,

    #[arg(long, env = "GITHUB_APP_ID", default_value_t = 0)]
    pub github_app_id: u64,

    #[arg(long, env = "GITHUB_INSTALLATION_ID", default_value_t = 0)]
    pub github_installation_id: u64,

    #[arg(long, env = "GITHUB_PRIVATEKEY_FILE", default_value = "")]
    pub github_private_key_file: String,

    /// Secret provider class containing the GitHub App credentials,
    /// mounted into build pods.
    #[arg(long, default_value = "")]
    pub github_app_secret_name: String,

    /// File holding the webhook HMAC secret.
    #[arg(long, default_value = "")]
    pub github_webhook_secret_file: String,

    /// Endpoint of the object storage. When empty, the endpoint is found
    /// through kube-apiserver.
    #[arg(long, default_value = "")]
    pub minio_endpoint: String,

    #[arg(long, default_value = "")]
    pub minio_name: String,

    #[arg(long, default_value = "")]
    pub minio_namespace: String,

    #[arg(long, default_value_t = 8080)]
    pub minio_port: u16,

    /// Bucket used as the log storage.
    #[arg(long, default_value = "logs")]
    pub minio_bucket: String,

    #[arg(long, default_value = "")]
    pub minio_access_key: String,

    #[arg(long, default_value = "")]
    pub minio_secret_access_key: String,

    #[arg(long, default_value = "")]
    pub vault_addr: String,

    #[arg(long, default_value = "")]
    pub vault_token_file: String,

    /// Listen address of the API.
    #[arg(long, default_value = "127.0.0.1:8081")]
    pub addr: String,

    /// URL of the dashboard, used as the commit status target.
    #[arg(long, default_value = "http://localhost")]
    pub dashboard: String,

    /// Public URL of this API.
    #[arg(long, default_value = "http://localhost")]
    pub builder_api: String,

    /// Passed to Bazel through --remote_cache when non-empty.
    #[arg(long, default_value = "")]
    pub remote_cache: String,

    /// Enable the experimental Remote Asset API.
    #[arg(long)]
    pub remote_asset: bool,

    #[arg(long, default_value = "ghcr.io/bazelbuild/bazel")]
    pub bazel_image: String,

    #[arg(long, default_value = "6.0.0")]
    pub default_bazel_version: String,

    #[arg(long, default_value = "registry.internal/build/sidecar")]
    pub sidecar_image: String,

    #[arg(long = "ctl-image", default_value = "registry.internal/build/ctl")]
    pub ctl_image: String,

    /// Default task cpu limit; a job-defined limit wins.
    #[arg(long, default_value = "1000m")]
    pub task_cpu_limit: String,

    #[arg(long, default_value = "4096Mi")]
    pub task_memory_limit: String,

    /// Enable garbage collection.
    #[arg(long)]
    pub with_gc: bool,

    /// Run without kube-apiserver. All cluster integrations are disabled.
    #[arg(long)]
    pub dev: bool,

    #[arg(long)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Setup,
    StartApiServer,
    LeaderElection,
    StartWorker,
    Shutdown,
}

pub struct Process {
    opt: Options,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    github: Option<Octocrab>,
    kube_client: Option<Client>,
    pool: Option<PgPool>,
    dao: Option<Dao>,
    vault: Option<VaultConfig>,
    webhook_secret: Option<String>,

    storage: Option<Arc<dyn ObjectStorage>>,
    builder: Option<Arc<BazelBuilder>>,
    api_handle: Option<JoinHandle<()>>,
    leader_events: Option<mpsc::Receiver<LeaderEvent>>,

    fatal: bool,
    lost_leadership: bool,
}

impl Process {
    pub fn new(opt: Options) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Process {
            opt,
            shutdown_tx,
            shutdown_rx,
            github: None,
            kube_client: None,
            pool: None,
            dao: None,
            vault: None,
            webhook_secret: None,
            storage: None,
            builder: None,
            api_handle: None,
            leader_events: None,
            fatal: false,
            lost_leadership: false,
        }
    }

    /// Drive the state machine to completion and return the exit code:
    /// 0 normal shutdown, 1 fatal error, 2 lost leadership.
    pub async fn run(mut self) -> i32 {
        let mut state = State::Init;
        loop {
            let next = match state {
                State::Init => self.init().await,
                State::Setup => self.setup().await,
                State::StartApiServer => self.start_api_server().await,
                State::LeaderElection => self.leader_election().await,
                State::StartWorker => self.start_worker().await,
                State::Shutdown => return self.shutdown().await,
            };
            state = match next {
                Ok(next) => next,
                Err(e) => {
                    error!(error = %e, "State transition failed");
                    self.fatal = true;
                    State::Shutdown
                }
            };
        }
    }

    async fn init(&mut self) -> anyhow::Result<State> {
        self.github = Some(self.github_client()?);

        if self.opt.dev {
            info!("Start without kube-apiserver. All cluster integrations are disabled.");
        } else {
            let client = Client::try_default()
                .await
                .context("connect to kube-apiserver")?;
            self.kube_client = Some(client);
        }

        let pool = monobuild_db::create_pool(&self.opt.dsn)
            .await
            .context("open catalog connection")?;
        monobuild_db::run_migrations(&pool)
            .await
            .context("migrate catalog")?;
        self.dao = Some(Dao::new(pool.clone()));
        self.pool = Some(pool);

        if !self.opt.vault_addr.is_empty() && !self.opt.vault_token_file.is_empty() {
            let token = std::fs::read_to_string(&self.opt.vault_token_file)
                .context("read vault token")?;
            self.vault = Some(VaultConfig {
                addr: self.opt.vault_addr.clone(),
                token: token.trim().to_string(),
            });
        }

        if !self.opt.github_webhook_secret_file.is_empty() {
            let secret = std::fs::read_to_string(&self.opt.github_webhook_secret_file)
                .context("read webhook secret")?;
            self.webhook_secret = Some(secret.trim().to_string());
        }

        Ok(State::Setup)
    }

    async fn setup(&mut self) -> anyhow::Result<State> {
        let storage_opts = if !self.opt.minio_endpoint.is_empty() {
            S3Options::via_endpoint(
                &self.opt.minio_endpoint,
                &self.opt.minio_bucket,
                &self.opt.minio_access_key,
                &self.opt.minio_secret_access_key,
            )
        } else {
            let client = self
                .kube_client
                .clone()
                .context("storage service lookup needs kube-apiserver")?;
            S3Options::via_service(
                client,
                &self.opt.minio_name,
                &self.opt.minio_namespace,
                self.opt.minio_port,
                &self.opt.minio_bucket,
                &self.opt.minio_access_key,
                &self.opt.minio_secret_access_key,
                self.opt.dev,
            )
            .await?
        };
        let storage: Arc<dyn ObjectStorage> = Arc::new(storage_opts.build()?);
        self.storage = Some(storage.clone());

        let scheduler: Option<Arc<dyn SchedulerClient>> = self
            .kube_client
            .clone()
            .map(|client| {
                Arc::new(KubernetesScheduler::new(client, &self.opt.namespace))
                    as Arc<dyn SchedulerClient>
            });

        let reporter = Arc::new(GithubReporter::new(
            self.github.clone().context("github client missing")?,
        ));

        let builder = BazelBuilder::new(
            &self.opt.dashboard,
            self.dao.clone().context("catalog missing")?,
            scheduler,
            storage,
            storage_opts,
            reporter,
            &self.opt.namespace,
            BazelOptions {
                remote_cache: self.opt.remote_cache.clone(),
                remote_asset_api: self.opt.remote_asset,
                sidecar_image: self.opt.sidecar_image.clone(),
                bazel_image: self.opt.bazel_image.clone(),
                default_bazel_version: self.opt.default_bazel_version.clone(),
                ctl_image: self.opt.ctl_image.clone(),
                github_app_secret_name: self.opt.github_app_secret_name.clone(),
                task_cpu_limit: self.opt.task_cpu_limit.clone(),
                task_memory_limit: self.opt.task_memory_limit.clone(),
            },
            self.vault.clone(),
        );
        self.builder = Some(Arc::new(builder));

        Ok(State::StartApiServer)
    }

    async fn start_api_server(&mut self) -> anyhow::Result<State> {
        let state = AppState {
            pool: self.pool.clone().context("catalog missing")?,
            dao: self.dao.clone().context("catalog missing")?,
            builder: self.builder.clone().context("builder missing")?,
            storage: self.storage.clone().context("storage missing")?,
            webhook_secret: self.webhook_secret.clone(),
            builder_api_url: self.opt.builder_api.clone(),
        };
        let app = routes::router(state);

        let listener = TcpListener::bind(&self.opt.addr)
            .await
            .with_context(|| format!("bind {}", self.opt.addr))?;
        info!(addr = %self.opt.addr, "Start API server");

        let mut shutdown = self.shutdown_rx.clone();
        self.api_handle = Some(tokio::spawn(async move {
            let served = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(e) = served.await {
                error!(error = %e, "API server failed");
            }
        }));

        Ok(State::LeaderElection)
    }

    /// Block until leadership is acquired. Skipped when the lease is not
    /// configured (dev mode).
    async fn leader_election(&mut self) -> anyhow::Result<State> {
        let Some(client) = self.kube_client.clone() else {
            info!("Skip leader election");
            return Ok(State::StartWorker);
        };
        if !self.opt.enable_leader_election
            || self.opt.lease_lock_name.is_empty()
            || self.opt.lease_lock_namespace.is_empty()
        {
            info!("Skip leader election");
            return Ok(State::StartWorker);
        }

        let election = LeaderElection::new(
            client,
            &self.opt.lease_lock_namespace,
            &self.opt.lease_lock_name,
            &self.opt.id,
        );
        let (tx, mut rx) = mpsc::channel(1);
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(election.run(tx, shutdown));

        let mut shutdown = self.shutdown_rx.clone();
        tokio::select! {
            event = rx.recv() => match event {
                Some(LeaderEvent::StartedLeading) => {}
                _ => anyhow::bail!("leader election ended before leading"),
            },
            _ = shutdown.changed() => return Ok(State::Shutdown),
        }

        self.leader_events = Some(rx);
        Ok(State::StartWorker)
    }

    async fn start_worker(&mut self) -> anyhow::Result<State> {
        let builder = self.builder.clone().context("builder missing")?;

        if let Some(client) = self.kube_client.clone() {
            let scheduler: Arc<dyn SchedulerClient> =
                Arc::new(KubernetesScheduler::new(client, &self.opt.namespace));
            let watcher = JobWatcher::new(scheduler, builder);
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                info!("Start job watcher");
                if let Err(e) = watcher.run(shutdown).await {
                    error!(error = %e, "Job watcher failed");
                }
            });
        }

        if self.opt.with_gc {
            let gc = Gc::new(
                GC_INTERVAL,
                GC_RETENTION,
                self.dao.clone().context("catalog missing")?,
                self.storage.clone().context("storage missing")?,
            );
            let shutdown = self.shutdown_rx.clone();
            tokio::spawn(async move {
                info!("Start GC");
                gc.run(shutdown).await;
            });
        }

        // Park until a signal or loss of leadership.
        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        let mut leader_events = self.leader_events.take();
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT");
                    return Ok(State::Shutdown);
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    return Ok(State::Shutdown);
                }
                event = recv_leader_event(&mut leader_events) => {
                    match event {
                        Some(LeaderEvent::StoppedLeading) | None => {
                            warn!("Lost leadership");
                            self.lost_leadership = true;
                            return Ok(State::Shutdown);
                        }
                        Some(LeaderEvent::StartedLeading) => {}
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) -> i32 {
        info!("Shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.api_handle.take() {
            match tokio::time::timeout(API_DRAIN_TIMEOUT, handle).await {
                Ok(_) => info!("Shutdown API server"),
                Err(_) => warn!("API server drain timed out"),
            }
        }

        if self.fatal {
            1
        } else if self.lost_leadership {
            2
        } else {
            0
        }
    }

    /// GitHub App installation client; an unauthenticated client in dev
    /// setups without app credentials.
    fn github_client(&self) -> anyhow::Result<Octocrab> {
        if self.opt.github_app_id == 0 || self.opt.github_private_key_file.is_empty() {
            warn!("GitHub App is not configured; statuses will not be reported");
            return Octocrab::builder().build().context("build github client");
        }

        let key = std::fs::read(&self.opt.github_private_key_file)
            .context("read github app private key")?;
        let key =
            jsonwebtoken::EncodingKey::from_rsa_pem(&key).context("parse github app key")?;
        let app = Octocrab::builder()
            .app(AppId(self.opt.github_app_id), key)
            .build()
            .context("build github app client")?;
        app.installation(InstallationId(self.opt.github_installation_id))
            .context("scope github client to installation")
    }
}

/// Pending forever when leader election is disabled, so the select below
/// only reacts to signals.
async fn recv_leader_event(
    events: &mut Option<mpsc::Receiver<LeaderEvent>>,
) -> Option<LeaderEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
