//! Index manifest persistence.
//!
//! Manifests live next to the logs as `manifest_<execution_key>.json`.
//! Retention keeps the two most recent execution keys.

use std::sync::Arc;

use bytes::Bytes;
use monobuild_core::manifest::{Manifest, parse_execution_key};
use tracing::{debug, info};

use crate::error::StorageError;
use crate::ObjectStorage;

/// How many manifests survive a cleanup pass.
const RETAINED_MANIFESTS: usize = 2;

pub struct ManifestManager {
    storage: Arc<dyn ObjectStorage>,
}

impl ManifestManager {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        ManifestManager { storage }
    }

    pub async fn update(&self, manifest: &Manifest) -> Result<(), StorageError> {
        let body = serde_json::to_vec(manifest).map_err(|e| StorageError::Decode(e.to_string()))?;
        self.storage
            .put(&manifest.file_name(), Bytes::from(body))
            .await?;
        info!(name = %manifest.file_name(), "Uploaded manifest");
        Ok(())
    }

    pub async fn get(&self, execution_key: u64) -> Result<Manifest, StorageError> {
        let key = format!("manifest_{}.json", execution_key);
        let body = self.storage.get_bytes(&key).await?;
        serde_json::from_slice(&body).map_err(|e| StorageError::Decode(e.to_string()))
    }

    /// The manifest with the highest execution key.
    pub async fn get_latest(&self) -> Result<Manifest, StorageError> {
        let latest = self
            .execution_keys()
            .await?
            .into_iter()
            .max()
            .ok_or_else(|| StorageError::NotFound("no manifest stored".to_string()))?;
        self.get(latest).await
    }

    /// Manifests beyond the retained window, oldest last.
    pub async fn find_expired(&self) -> Result<Vec<Manifest>, StorageError> {
        let mut keys = self.execution_keys().await?;
        if keys.len() <= RETAINED_MANIFESTS {
            debug!("No manifest cleanup needed");
            return Ok(Vec::new());
        }
        keys.sort_unstable_by(|a, b| b.cmp(a));

        let mut expired = Vec::new();
        for key in keys.split_off(RETAINED_MANIFESTS) {
            expired.push(self.get(key).await?);
        }
        Ok(expired)
    }

    pub async fn delete(&self, manifest: &Manifest) -> Result<(), StorageError> {
        self.storage.delete(&manifest.file_name()).await
    }

    async fn execution_keys(&self) -> Result<Vec<u64>, StorageError> {
        let objects = self.storage.list("").await?;
        Ok(objects
            .iter()
            .filter_map(|o| parse_execution_key(&o.key))
            .collect())
    }
}
