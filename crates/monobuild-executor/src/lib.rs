//! Cluster scheduler client.
//!
//! A thin capability over the cluster's batch API: create, inspect, label,
//! and delete Jobs, plus a lazy stream of their status transitions. The
//! client does not interpret business state; normalization is the job
//! watcher's concern.

pub mod kubernetes;

pub use kubernetes::KubernetesScheduler;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use monobuild_core::Result;

/// A raw change observed on a scheduler Job.
#[derive(Debug, Clone)]
pub enum JobChange {
    /// Created, updated, or listed during a resync.
    Applied(KubeJob),
    Deleted(KubeJob),
}

/// Capability to manage cluster Jobs owned by the coordinator.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn create_job(&self, job: KubeJob) -> Result<()>;

    async fn get_job(&self, name: &str) -> Result<Option<KubeJob>>;

    async fn delete_job(&self, name: &str) -> Result<()>;

    /// All Jobs carrying the coordinator's owner label.
    async fn list_jobs(&self) -> Result<Vec<KubeJob>>;

    /// Lazy event stream over owned Jobs. The stream restarts internally;
    /// consumers see a contiguous sequence of changes.
    fn watch_jobs(&self) -> BoxStream<'static, Result<JobChange>>;

    /// Annotations of the pod(s) backing the named Job, merged.
    async fn pod_annotations(&self, job_name: &str) -> Result<BTreeMap<String, String>>;
}
