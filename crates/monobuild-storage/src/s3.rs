//! S3-compatible backend.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use kube::Client;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, WriteMultipart};

use crate::error::StorageError;
use crate::{ByteStream, ObjectInfo, ObjectStorage};

/// Connection parameters for the bucket.
#[derive(Debug, Clone)]
pub struct S3Options {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_access_key: String,
}

impl S3Options {
    /// Reach an S3-compatible endpoint directly.
    pub fn via_endpoint(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        access_key: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        S3Options {
            endpoint: endpoint.into(),
            bucket: bucket.into(),
            access_key: access_key.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// Reach the storage service through the cluster. In dev mode a local
    /// port-forward to one of the service's pods is established; otherwise
    /// the in-cluster service DNS name is used.
    pub async fn via_service(
        client: Client,
        name: &str,
        namespace: &str,
        port: u16,
        bucket: impl Into<String>,
        access_key: impl Into<String>,
        secret_access_key: impl Into<String>,
        dev: bool,
    ) -> Result<Self, StorageError> {
        let endpoint = if dev {
            let addr = crate::forward::forward_service(client, namespace, name, port).await?;
            format!("http://{}", addr)
        } else {
            format!("http://{}.{}.svc:{}", name, namespace, port)
        };

        Ok(S3Options {
            endpoint,
            bucket: bucket.into(),
            access_key: access_key.into(),
            secret_access_key: secret_access_key.into(),
        })
    }

    pub fn build(&self) -> Result<S3Storage, StorageError> {
        let store = AmazonS3Builder::new()
            .with_endpoint(&self.endpoint)
            .with_bucket_name(&self.bucket)
            .with_access_key_id(&self.access_key)
            .with_secret_access_key(&self.secret_access_key)
            .with_region("us-east-1")
            .with_allow_http(true)
            .build()?;

        Ok(S3Storage::new(Arc::new(store)))
    }
}

/// [`ObjectStorage`] over any `object_store` backend.
pub struct S3Storage {
    store: Arc<dyn ObjectStore>,
}

impl S3Storage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        S3Storage { store }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError> {
        self.store.put(&Path::from(key), data.into()).await?;
        Ok(())
    }

    async fn put_stream(
        &self,
        key: &str,
        mut stream: ByteStream,
        _size: Option<u64>,
    ) -> Result<(), StorageError> {
        let upload = self.store.put_multipart(&Path::from(key)).await?;
        let mut writer = WriteMultipart::new(upload);
        while let Some(chunk) = stream.next().await {
            writer.write(&chunk?);
        }
        writer.finish().await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let result = self.store.get(&Path::from(key)).await?;
        Ok(result.into_stream().map_err(StorageError::from).boxed())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match self.store.delete(&Path::from(key)).await {
            Ok(()) => Ok(()),
            // Deletes are idempotent.
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let path = if prefix.is_empty() {
            None
        } else {
            Some(Path::from(prefix))
        };
        let objects: Vec<_> = self.store.list(path.as_ref()).try_collect().await?;

        Ok(objects
            .into_iter()
            .map(|meta| ObjectInfo {
                key: meta.location.to_string(),
                size: meta.size as u64,
                last_modified: meta.last_modified,
            })
            .collect())
    }
}
