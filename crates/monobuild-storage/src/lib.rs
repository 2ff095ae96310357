//! Object storage facade.
//!
//! A uniform capability over an S3-compatible bucket: put, streaming put,
//! get, delete, list. Two first-class ways to reach the service: a direct
//! endpoint, or the in-cluster service resolved through the kube API (with
//! a local port-forward in dev mode). Both obey identical semantics.

pub mod error;
mod forward;
pub mod manifest;
pub mod s3;

pub use error::StorageError;
pub use manifest::ManifestManager;
pub use s3::{S3Options, S3Storage};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;

/// Stream of object bytes.
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

/// Metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Uniform object-store capability. Keys are `/`-separated logical paths.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StorageError>;

    /// Streaming upload. The total size may be unknown at call time.
    async fn put_stream(
        &self,
        key: &str,
        stream: ByteStream,
        size: Option<u64>,
    ) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError>;

    /// Convenience wrapper collecting the whole object into memory.
    async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let mut stream = self.get(key).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;
}
