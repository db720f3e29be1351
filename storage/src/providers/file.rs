use crate::{ByteStream, ObjectListing, StorageError, StorageProvider, DELETE_BATCH_SIZE};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::debug;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Local filesystem storage provider.
///
/// Keys map directly onto paths under the root directory. Used for
/// `file://` prefixes and by the test suite.
pub struct FileProvider {
    root: PathBuf,
}

impl FileProvider {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Writes through a temp file in the destination directory so readers
    /// never observe a partial object.
    fn write_atomic(&self, key: &str, contents: &[u8]) -> Result<(), StorageError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::Fatal(format!("bad object key '{key}'")))?;
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.object_path(key).is_file())
    }

    async fn etag(&self, key: &str) -> Result<String, StorageError> {
        let path = self.object_path(key);
        let contents = fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::Io(e),
        })?;
        Ok(format!("\"{:x}\"", md5::compute(&contents)))
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let path = self.object_path(key);
        let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::Io(e),
        })?;
        Ok(Box::pin(file))
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        _storage_class: Option<&str>,
    ) -> Result<(), StorageError> {
        debug!("writing {} bytes at '{key}'", body.len());
        self.write_atomic(key, &body)
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        _storage_class: Option<&str>,
    ) -> Result<(), StorageError> {
        let contents = fs::read(path)?;
        self.write_atomic(key, &contents)
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ObjectListing>, StorageError> {
        let mut listing = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') && name.ends_with(".tmp") {
                continue;
            }
            let rel = match entry.path().strip_prefix(&self.root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(delim) = delimiter {
                if key[prefix.len()..].contains(delim) {
                    continue;
                }
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);
            listing.push(ObjectListing {
                key,
                last_modified: modified,
            });
        }
        listing.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listing)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        for chunk in keys.chunks(DELETE_BATCH_SIZE) {
            for key in chunk {
                let path = self.object_path(key);
                let result = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match result {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(StorageError::Io(e)),
                }
            }
        }
        Ok(())
    }
}
