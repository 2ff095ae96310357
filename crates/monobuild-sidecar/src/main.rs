//! Log sidecar.
//!
//! Runs next to the build container with a shared volume, tails
//! `stdout.log` and `stderr.log`, and streams them to
//! `logs/<job_id>/<task_id>.log` as a single multipart upload. On SIGTERM
//! the tail is flushed, the upload finalized, and the final key recorded on
//! the pod as a best-effort annotation. The build container's exit code
//! decides the task outcome, never the sidecar's.

mod tail;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use monobuild_core::ANNOTATION_LOG_FILE;
use monobuild_core::logs::log_file_key;
use monobuild_storage::{ObjectStorage, S3Options, StorageError};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tail::Tailer;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "monobuild-sidecar", about = "Build log uploader")]
struct Options {
    #[arg(long)]
    job_id: i32,

    #[arg(long)]
    task_id: i32,

    /// Directory the build writes stdout.log / stderr.log into.
    #[arg(long, default_value = "/var/log/build")]
    log_dir: PathBuf,

    #[arg(long, env = "MINIO_ENDPOINT")]
    endpoint: String,

    #[arg(long, env = "MINIO_BUCKET", default_value = "logs")]
    bucket: String,

    #[arg(long, env = "MINIO_ACCESS_KEY")]
    access_key: String,

    #[arg(long, env = "MINIO_SECRET_ACCESS_KEY")]
    secret_access_key: String,

    #[arg(long, env = "POD_NAME", default_value = "")]
    pod_name: String,

    #[arg(long, env = "POD_NAMESPACE", default_value = "")]
    pod_namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opt = Options::parse();
    let key = log_file_key(opt.job_id, opt.task_id);
    let storage = S3Options::via_endpoint(
        &opt.endpoint,
        &opt.bucket,
        &opt.access_key,
        &opt.secret_access_key,
    )
    .build()
    .context("open log storage")?;

    let mut tailer = Tailer::new(vec![
        opt.log_dir.join("stdout.log"),
        opt.log_dir.join("stderr.log"),
    ]);

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, StorageError>(chunk), rx))
    })
    .boxed();

    let uploader = {
        let key = key.clone();
        tokio::spawn(async move { storage.put_stream(&key, chunks, None).await })
    };

    info!(key = %key, dir = %opt.log_dir.display(), "Tailing build output");
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM; flushing");
                break;
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if let Some(chunk) = tailer.drain().await.context("read build output")? {
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Final flush before the upload is closed.
    if let Some(chunk) = tailer.drain().await.context("read build output")? {
        let _ = tx.send(chunk).await;
    }
    drop(tx);
    uploader.await.context("join uploader")?.context("finalize upload")?;
    info!(key = %key, "Upload finalized");

    annotate_pod(&opt, &key).await;
    Ok(())
}

/// Record the final log key on the pod. Best-effort: the coordinator falls
/// back to the deterministic key template when the annotation is missing.
async fn annotate_pod(opt: &Options, key: &str) {
    if opt.pod_name.is_empty() || opt.pod_namespace.is_empty() {
        return;
    }

    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "No cluster access; skipping pod annotation");
            return;
        }
    };
    let pods: Api<Pod> = Api::namespaced(client, &opt.pod_namespace);
    let patch = serde_json::json!({
        "metadata": {
            "annotations": { ANNOTATION_LOG_FILE: key }
        }
    });
    match pods
        .patch(&opt.pod_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => info!(pod = %opt.pod_name, "Annotated pod with log key"),
        Err(e) => warn!(pod = %opt.pod_name, error = %e, "Failed to annotate pod"),
    }
}
