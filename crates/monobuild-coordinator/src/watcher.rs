//! Job watcher: normalizes scheduler events and feeds the coordinator.
//!
//! The watcher interprets no business state. It turns raw Job changes into
//! `(job_key, phase, terminal_reason)` and hands them to the handler it was
//! constructed with. On stream failure it reconnects with jittered
//! exponential backoff and resynchronizes by listing current Jobs so missed
//! terminal transitions are replayed.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job as KubeJob;
use monobuild_core::event::{JobEvent, JobEventHandler, JobPhase};
use monobuild_core::Result;
use monobuild_executor::{JobChange, SchedulerClient};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Attempts per event before it is dropped with an error log.
const EVENT_RETRIES: u32 = 3;

pub struct JobWatcher {
    scheduler: Arc<dyn SchedulerClient>,
    handler: Arc<dyn JobEventHandler>,
    workers: usize,
}

impl JobWatcher {
    pub fn new(scheduler: Arc<dyn SchedulerClient>, handler: Arc<dyn JobEventHandler>) -> Self {
        JobWatcher {
            scheduler,
            handler,
            workers: 1,
        }
    }

    /// Worker concurrency. Events for the same job key always land on the
    /// same worker, preserving per-task ordering.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut senders = Vec::with_capacity(self.workers);
        let mut handles = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let (tx, rx) = mpsc::channel::<JobEvent>(64);
            senders.push(tx);
            handles.push(tokio::spawn(Self::worker(index, rx, self.handler.clone())));
        }

        info!(workers = self.workers, "Job watcher started");
        let mut attempt: u32 = 0;
        loop {
            // Resync: replay current state to catch transitions missed
            // while disconnected.
            match self.scheduler.list_jobs().await {
                Ok(jobs) => {
                    attempt = 0;
                    for job in &jobs {
                        if let Some(event) = normalize_job(job) {
                            dispatch(&senders, event).await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Job list for resync failed");
                }
            }

            let mut stream = self.scheduler.watch_jobs();
            let disconnect = loop {
                tokio::select! {
                    _ = shutdown.changed() => break None,
                    item = stream.next() => match item {
                        Some(Ok(change)) => {
                            attempt = 0;
                            if let Some(event) = normalize(change) {
                                dispatch(&senders, event).await;
                            }
                        }
                        Some(Err(e)) => break Some(e.to_string()),
                        None => break Some("stream closed".to_string()),
                    }
                }
            };

            let Some(reason) = disconnect else {
                break;
            };

            attempt += 1;
            let delay = backoff_delay(attempt);
            warn!(%reason, attempt, ?delay, "Job watch disconnected; reconnecting");
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        drop(senders);
        for handle in handles {
            let _ = handle.await;
        }
        info!("Job watcher stopped");
        Ok(())
    }

    async fn worker(index: usize, mut rx: mpsc::Receiver<JobEvent>, handler: Arc<dyn JobEventHandler>) {
        while let Some(event) = rx.recv().await {
            let mut attempt = 0;
            loop {
                match handler.on_job_event(event.clone()).await {
                    Ok(()) => break,
                    Err(e) if attempt < EVENT_RETRIES => {
                        attempt += 1;
                        debug!(worker = index, job_key = %event.job_key, error = %e, attempt, "Retrying event");
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                    Err(e) => {
                        error!(worker = index, job_key = %event.job_key, error = %e, "Dropping event");
                        break;
                    }
                }
            }
        }
    }
}

async fn dispatch(senders: &[mpsc::Sender<JobEvent>], event: JobEvent) {
    let mut hasher = DefaultHasher::new();
    event.job_key.hash(&mut hasher);
    let index = (hasher.finish() % senders.len() as u64) as usize;
    if senders[index].send(event).await.is_err() {
        warn!("Event worker gone; dropping event");
    }
}

/// Exponential backoff with jitter: 100 ms doubling up to 30 s.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
    let capped = exp.min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    capped.mul_f64(jitter).min(BACKOFF_CAP)
}

/// Normalize a raw Job change into a lifecycle event.
pub fn normalize(change: JobChange) -> Option<JobEvent> {
    match change {
        JobChange::Applied(job) => normalize_job(&job),
        JobChange::Deleted(job) => {
            let event = normalize_job(&job)?;
            if event.phase.is_terminal() {
                // Terminal state already reported; re-delivery is a no-op
                // downstream.
                Some(event)
            } else {
                Some(
                    JobEvent::new(event.job_key, JobPhase::Failed).with_reason("cancelled"),
                )
            }
        }
    }
}

fn normalize_job(job: &KubeJob) -> Option<JobEvent> {
    let name = job.metadata.name.clone()?;
    let Some(status) = job.status.as_ref() else {
        return Some(JobEvent::new(name, JobPhase::Pending));
    };

    if status.succeeded.unwrap_or(0) > 0 {
        return Some(JobEvent::new(name, JobPhase::Succeeded));
    }
    if status.failed.unwrap_or(0) > 0 {
        let reason = status
            .conditions
            .as_ref()
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.type_ == "Failed" && c.status == "True")
                    .and_then(|c| c.reason.clone())
            })
            .unwrap_or_else(|| "failed".to_string());
        return Some(JobEvent::new(name, JobPhase::Failed).with_reason(reason));
    }
    if status.active.unwrap_or(0) > 0 {
        return Some(JobEvent::new(name, JobPhase::Running));
    }
    Some(JobEvent::new(name, JobPhase::Pending))
}
