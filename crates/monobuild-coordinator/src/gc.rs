//! Periodic garbage collection.
//!
//! Each tick: expired tasks lose their log object and catalog row, orphaned
//! log objects are swept, and all but the two most recent index manifests
//! are deleted. Safe to run while the coordinator is active: every delete
//! is preceded by a row existence check and deletes are idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use monobuild_core::logs::{LOG_PREFIX, log_file_key, parse_log_file_key};
use monobuild_core::{CATALOG_TIMEOUT, Error, Result};
use monobuild_db::Dao;
use monobuild_storage::{ManifestManager, ObjectStorage};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Gc {
    interval: Duration,
    retention: Duration,
    dao: Dao,
    storage: Arc<dyn ObjectStorage>,
    manifests: ManifestManager,
}

impl Gc {
    pub fn new(
        interval: Duration,
        retention: Duration,
        dao: Dao,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Gc {
            interval,
            retention,
            dao,
            storage: storage.clone(),
            manifests: ManifestManager::new(storage),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, retention = ?self.retention, "GC started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("GC stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "GC sweep failed");
                    }
                }
            }
        }
    }

    pub async fn sweep(&self) -> Result<()> {
        self.sweep_expired_tasks().await?;
        self.sweep_orphan_logs().await?;
        self.sweep_manifests().await?;
        Ok(())
    }

    async fn sweep_expired_tasks(&self) -> Result<()> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.retention)
                .map_err(|e| Error::Fatal(e.to_string()))?;
        let expired = self.catalog(self.dao.task.list_expired(cutoff)).await?;

        for task in expired {
            // The coordinator may have raced us; re-check before deleting.
            if !self.catalog(self.dao.task.exists(task.id)).await? {
                continue;
            }

            let key = task
                .log_file
                .clone()
                .unwrap_or_else(|| log_file_key(task.job_id, task.id));
            if let Err(e) = self.storage.delete(&key).await {
                warn!(task = task.id, key = %key, error = %e, "Failed to delete log object");
                continue;
            }
            self.catalog(self.dao.task.delete(task.id)).await?;
            debug!(task = task.id, key = %key, "Collected expired task");
        }
        Ok(())
    }

    /// Log objects matching the template but referencing no task row.
    async fn sweep_orphan_logs(&self) -> Result<()> {
        let objects = self
            .storage
            .list(LOG_PREFIX)
            .await
            .map_err(monobuild_core::Error::from)?;

        for object in objects {
            let Some((_, task_id)) = parse_log_file_key(&object.key) else {
                continue;
            };
            if self.catalog(self.dao.task.exists(task_id)).await? {
                continue;
            }
            if let Err(e) = self.storage.delete(&object.key).await {
                warn!(key = %object.key, error = %e, "Failed to delete orphan log");
            } else {
                debug!(key = %object.key, "Collected orphan log");
            }
        }
        Ok(())
    }

    async fn sweep_manifests(&self) -> Result<()> {
        let expired = self
            .manifests
            .find_expired()
            .await
            .map_err(monobuild_core::Error::from)?;
        for manifest in expired {
            self.manifests
                .delete(&manifest)
                .await
                .map_err(monobuild_core::Error::from)?;
            debug!(execution_key = manifest.execution_key, "Collected manifest");
        }
        Ok(())
    }

    async fn catalog<T>(
        &self,
        fut: impl Future<Output = monobuild_db::DbResult<T>>,
    ) -> Result<T> {
        tokio::time::timeout(CATALOG_TIMEOUT, fut)
            .await
            .map_err(|_| Error::Transient("catalog deadline exceeded".to_string()))?
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryCatalog, dao, memory_storage};
    use bytes::Bytes;
    use monobuild_core::manifest::Manifest;
    use monobuild_core::task::{BuildCommand, Job, Task, Via};
    use std::collections::BTreeMap;

    const HOUR: Duration = Duration::from_secs(3600);

    struct Fixture {
        catalog: Arc<MemoryCatalog>,
        storage: Arc<dyn ObjectStorage>,
        gc: Gc,
        job: Job,
    }

    fn fixture() -> Fixture {
        let catalog = Arc::new(MemoryCatalog::default());
        let repository = catalog.seed_repository(
            "mono",
            "https://github.com/f110/mono",
            "https://github.com/f110/mono.git",
        );
        let job = catalog.seed_job(Job {
            id: 0,
            repository_id: repository.id,
            command: BuildCommand::Build,
            target: "//...".to_string(),
            bazel_version: "6.0.0".to_string(),
            config_name: String::new(),
            all_revision: false,
            github_status: false,
            exclusive: false,
        });
        let storage = memory_storage();
        let gc = Gc::new(HOUR, HOUR, dao(&catalog), storage.clone());
        Fixture {
            catalog,
            storage,
            gc,
            job,
        }
    }

    async fn finished_task(f: &Fixture, age: Duration) -> Task {
        let task = f.catalog.insert_task(Task::new(&f.job, "abc123", Via::Webhook));
        let key = log_file_key(f.job.id, task.id);
        f.storage
            .put(&key, Bytes::from_static(b"log data"))
            .await
            .unwrap();

        let mut stored = f.catalog.task(task.id).unwrap();
        stored.set_success(true);
        stored.set_log_file(&key);
        stored.set_finished_at(Utc::now() - chrono::Duration::from_std(age).unwrap());
        use monobuild_db::repo::TaskRepo;
        TaskRepo::update(&*f.catalog, &mut stored).await.unwrap();
        f.catalog.task(task.id).unwrap()
    }

    #[tokio::test]
    async fn test_expired_task_swept_with_its_log() {
        let f = fixture();
        let old = finished_task(&f, 2 * HOUR).await;
        let recent = finished_task(&f, HOUR / 2).await;

        f.gc.sweep().await.unwrap();

        assert!(f.catalog.task(old.id).is_none());
        assert!(f.storage.get(old.log_file.as_deref().unwrap()).await.is_err());

        // Within retention: row and log untouched.
        assert!(f.catalog.task(recent.id).is_some());
        f.storage
            .get_bytes(recent.log_file.as_deref().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_orphan_log_swept_live_log_kept() {
        let f = fixture();
        let live = finished_task(&f, HOUR / 2).await;
        f.storage
            .put("logs/1/99.log", Bytes::from_static(b"orphan"))
            .await
            .unwrap();

        f.gc.sweep().await.unwrap();

        assert!(f.storage.get("logs/1/99.log").await.is_err());
        f.storage
            .get_bytes(live.log_file.as_deref().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_manifest_retention_keeps_two() {
        let f = fixture();
        let manager = ManifestManager::new(f.storage.clone());
        for key in [1, 2, 3] {
            manager
                .update(&Manifest::new(key, BTreeMap::new()))
                .await
                .unwrap();
        }

        f.gc.sweep().await.unwrap();

        assert!(manager.get(1).await.is_err());
        manager.get(2).await.unwrap();
        manager.get(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_is_idempotent() {
        let f = fixture();
        finished_task(&f, 2 * HOUR).await;

        f.gc.sweep().await.unwrap();
        f.gc.sweep().await.unwrap();
        assert!(f.catalog.tasks().is_empty());
    }
}
