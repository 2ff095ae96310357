//! Kubernetes scheduler client.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::watcher;
use kube::runtime::watcher::Event;
use kube::Client;
use monobuild_core::{Error, Result, LABEL_JOB_ID, SCHEDULER_TIMEOUT};
use tracing::info;

use crate::{JobChange, SchedulerClient};

fn from_kube(err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) => Error::Upstream {
            code: ae.code.to_string(),
            message: ae.message,
        },
        other => Error::Transient(other.to_string()),
    }
}

async fn with_timeout<T>(fut: impl Future<Output = std::result::Result<T, kube::Error>>) -> Result<T> {
    tokio::time::timeout(SCHEDULER_TIMEOUT, fut)
        .await
        .map_err(|_| Error::Transient("scheduler api deadline exceeded".to_string()))?
        .map_err(from_kube)
}

/// Scheduler client over the cluster batch API, scoped to one namespace and
/// the coordinator's owner label.
pub struct KubernetesScheduler {
    jobs: Api<KubeJob>,
    pods: Api<Pod>,
    namespace: String,
}

impl KubernetesScheduler {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        KubernetesScheduler {
            jobs: Api::namespaced(client.clone(), &namespace),
            pods: Api::namespaced(client, &namespace),
            namespace,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl SchedulerClient for KubernetesScheduler {
    async fn create_job(&self, job: KubeJob) -> Result<()> {
        let name = job.metadata.name.clone().unwrap_or_default();
        with_timeout(self.jobs.create(&PostParams::default(), &job)).await?;
        info!(job = %name, namespace = %self.namespace, "Created scheduler job");
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<KubeJob>> {
        with_timeout(self.jobs.get_opt(name)).await
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        match with_timeout(self.jobs.delete(name, &DeleteParams::background())).await {
            Ok(_) => Ok(()),
            // Deleting an already-gone job is a no-op.
            Err(Error::Upstream { ref code, .. }) if code == "404" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list_jobs(&self) -> Result<Vec<KubeJob>> {
        let params = ListParams::default().labels(LABEL_JOB_ID);
        let list = with_timeout(self.jobs.list(&params)).await?;
        Ok(list.items)
    }

    fn watch_jobs(&self) -> BoxStream<'static, Result<JobChange>> {
        let config = watcher::Config::default().labels(LABEL_JOB_ID);
        watcher(self.jobs.clone(), config)
            .filter_map(|event| {
                futures::future::ready(match event {
                    Ok(Event::Apply(job)) | Ok(Event::InitApply(job)) => {
                        Some(Ok(JobChange::Applied(job)))
                    }
                    Ok(Event::Delete(job)) => Some(Ok(JobChange::Deleted(job))),
                    Ok(Event::Init) | Ok(Event::InitDone) => None,
                    Err(e) => Some(Err(Error::Transient(e.to_string()))),
                })
            })
            .boxed()
    }

    async fn pod_annotations(&self, job_name: &str) -> Result<BTreeMap<String, String>> {
        // The batch controller stamps pods with the job-name label.
        let params = ListParams::default().labels(&format!("job-name={}", job_name));
        let pods = with_timeout(self.pods.list(&params)).await?;

        let mut annotations = BTreeMap::new();
        for pod in pods.items {
            if let Some(meta) = pod.metadata.annotations {
                annotations.extend(meta);
            }
        }
        Ok(annotations)
    }
}
