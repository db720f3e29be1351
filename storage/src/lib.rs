//! Object storage facade for pgvault.
//!
//! This library provides a uniform interface over S3-compatible object
//! stores and a local filesystem backend. Backup and WAL archive code
//! depends only on the [`StorageProvider`] trait and the [`StorageFolder`]
//! wrapper, which joins the configured server prefix onto every key.

mod error;
pub mod providers;
mod retry;
mod types;

pub use error::StorageError;
pub use retry::{with_retries, MAX_RETRIES};
pub use types::ObjectListing;

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tokio::io::AsyncRead;

/// Byte stream handed out by [`StorageProvider::get`].
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Largest number of keys a single delete request may carry.
pub const DELETE_BATCH_SIZE: usize = 1000;

/// Core storage interface for backup archives.
///
/// Keys are path-like with `/` separators and never start with `/`.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    /// Returns the name of the storage provider.
    fn name(&self) -> &str;

    /// Checks if an object exists.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Returns the ETag of an object.
    async fn etag(&self, key: &str) -> Result<String, StorageError>;

    /// Opens an object for reading.
    async fn get(&self, key: &str) -> Result<ByteStream, StorageError>;

    /// Uploads an object from memory.
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        storage_class: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Uploads an object from a local file.
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        storage_class: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Lists objects under `prefix`. With a delimiter, only objects whose
    /// remaining key contains no delimiter are returned; grouped prefixes
    /// are dropped.
    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ObjectListing>, StorageError>;

    /// Deletes objects in batches of at most [`DELETE_BATCH_SIZE`] keys.
    /// Missing keys are not an error.
    async fn delete(&self, keys: &[String]) -> Result<(), StorageError>;
}

/// A lazy, restartable source of object bytes.
///
/// `reader` must produce a fresh stream on every call: the restore
/// extractor re-enters partitions after transient failures.
#[async_trait]
pub trait ReaderMaker: Send + Sync {
    /// Key of the object this maker reads.
    fn path(&self) -> &str;

    /// Opens a new read stream from the beginning of the object.
    async fn reader(&self) -> Result<ByteStream, StorageError>;
}

struct FolderReaderMaker {
    folder: StorageFolder,
    key: String,
}

#[async_trait]
impl ReaderMaker for FolderReaderMaker {
    fn path(&self) -> &str {
        &self.key
    }

    async fn reader(&self) -> Result<ByteStream, StorageError> {
        self.folder.provider.get(&self.key).await
    }
}

/// A storage provider scoped to a server prefix.
///
/// All backup layout paths (`basebackups_005/`, `wal_005/`) are joined
/// under the prefix here so the rest of the system deals in relative keys.
#[derive(Clone)]
pub struct StorageFolder {
    provider: Arc<dyn StorageProvider>,
    server: String,
}

impl StorageFolder {
    pub fn new(provider: Arc<dyn StorageProvider>, server: impl Into<String>) -> Self {
        let server = server.into();
        let server = server.trim_matches('/').to_string();
        StorageFolder { provider, server }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Joins a relative path onto the server prefix.
    pub fn key(&self, rel: &str) -> String {
        let rel = rel.trim_start_matches('/');
        if self.server.is_empty() {
            rel.to_string()
        } else {
            format!("{}/{}", self.server, rel)
        }
    }

    pub async fn exists(&self, rel: &str) -> Result<bool, StorageError> {
        self.provider.exists(&self.key(rel)).await
    }

    pub async fn etag(&self, rel: &str) -> Result<String, StorageError> {
        self.provider.etag(&self.key(rel)).await
    }

    pub async fn get(&self, rel: &str) -> Result<ByteStream, StorageError> {
        self.provider.get(&self.key(rel)).await
    }

    /// Uploads with exponential-backoff retry on transient failures.
    pub async fn put(
        &self,
        rel: &str,
        body: Bytes,
        storage_class: Option<&str>,
    ) -> Result<(), StorageError> {
        let key = self.key(rel);
        with_retries(&format!("put {key}"), || {
            self.provider.put(&key, body.clone(), storage_class).boxed()
        })
        .await
    }

    /// Uploads a local file with exponential-backoff retry. The file is
    /// re-read from the start on every attempt.
    pub async fn put_file(
        &self,
        rel: &str,
        path: &Path,
        storage_class: Option<&str>,
    ) -> Result<(), StorageError> {
        let key = self.key(rel);
        with_retries(&format!("put {key}"), || {
            self.provider.put_file(&key, path, storage_class).boxed()
        })
        .await
    }

    /// Lists objects under the prefix; returned keys are relative to the
    /// server prefix again.
    pub async fn list(
        &self,
        rel_prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ObjectListing>, StorageError> {
        let full = self.key(rel_prefix);
        let strip = if self.server.is_empty() {
            String::new()
        } else {
            format!("{}/", self.server)
        };
        let mut listing = self.provider.list(&full, delimiter).await?;
        for obj in &mut listing {
            if let Some(rest) = obj.key.strip_prefix(&strip) {
                obj.key = rest.to_string();
            }
        }
        Ok(listing)
    }

    pub async fn delete(&self, rels: &[String]) -> Result<(), StorageError> {
        let keys: Vec<String> = rels.iter().map(|r| self.key(r)).collect();
        self.provider.delete(&keys).await
    }

    /// Returns a restartable reader factory for one object.
    pub fn reader_maker(&self, rel: &str) -> Arc<dyn ReaderMaker> {
        Arc::new(FolderReaderMaker {
            folder: self.clone(),
            key: self.key(rel),
        })
    }
}

/// Builds a provider from a location URL and splits off the server prefix.
///
/// Supported schemes: `s3://bucket/server`, `file:///base/dir`.
pub async fn folder_from_url(url: &str) -> Result<StorageFolder, StorageError> {
    if let Some(rest) = url.strip_prefix("s3://").or_else(|| url.strip_prefix("aws://")) {
        let (bucket, server) = match rest.split_once('/') {
            Some((b, s)) => (b, s),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(StorageError::Configuration(format!(
                "missing bucket in storage url '{url}'"
            )));
        }
        let provider = providers::aws::S3Provider::new(bucket).await?;
        Ok(StorageFolder::new(Arc::new(provider), server))
    } else if let Some(root) = url.strip_prefix("file://") {
        if root.is_empty() {
            return Err(StorageError::Configuration(format!(
                "missing directory in storage url '{url}'"
            )));
        }
        let provider = providers::file::FileProvider::new(root)?;
        Ok(StorageFolder::new(Arc::new(provider), ""))
    } else {
        Err(StorageError::Configuration(format!(
            "unsupported storage url '{url}' (expected s3:// or file://)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_joins_server_prefix() {
        let provider = Arc::new(providers::file::FileProvider::new("/tmp").unwrap());
        let folder = StorageFolder::new(provider.clone(), "pg/cluster-a");
        assert_eq!(folder.key("wal_005/seg.lz4"), "pg/cluster-a/wal_005/seg.lz4");

        let bare = StorageFolder::new(provider, "");
        assert_eq!(bare.key("wal_005/seg.lz4"), "wal_005/seg.lz4");
    }
}
