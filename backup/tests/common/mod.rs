//! Shared fixtures for the pipeline integration tests: a stub database,
//! a file-backed storage folder and a fault-injecting provider.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use backup::config::Config;
use backup::lsn::wal_segment_name;
use backup::queryrunner::{BackupDatabase, BackupStart, BackupStop};
use storage::providers::FileProvider;
use storage::{ByteStream, ObjectListing, StorageError, StorageFolder, StorageProvider};

pub const TEST_PG_VERSION: i32 = 150004;

/// Stands in for a running cluster: hands out fixed LSNs and label files.
pub struct StubDatabase {
    pub lsn: u64,
    pub finish_lsn: u64,
    pub timeline: u32,
    pub report_timeline_change: bool,
}

impl StubDatabase {
    pub fn at_lsn(lsn: u64) -> Self {
        StubDatabase {
            lsn,
            finish_lsn: lsn + 0x100,
            timeline: 1,
            report_timeline_change: false,
        }
    }
}

#[async_trait]
impl BackupDatabase for StubDatabase {
    async fn start_backup(&mut self, _label: &str) -> backup::Result<BackupStart> {
        let segment = wal_segment_name(self.timeline, self.lsn);
        Ok(BackupStart {
            backup_name: format!("base_{segment}"),
            lsn: self.lsn,
            pg_version: TEST_PG_VERSION,
            timeline: self.timeline,
        })
    }

    async fn stop_backup(&mut self) -> backup::Result<BackupStop> {
        Ok(BackupStop {
            backup_label: format!("START WAL LOCATION: 0/{:X}\n", self.lsn),
            tablespace_map: String::new(),
            finish_lsn: self.finish_lsn,
        })
    }

    async fn timeline_changed(&mut self, _since: u32) -> backup::Result<bool> {
        Ok(self.report_timeline_change)
    }
}

pub fn test_folder(root: &Path) -> StorageFolder {
    let provider = Arc::new(FileProvider::new(root).expect("file provider"));
    StorageFolder::new(provider, "pg")
}

/// Small-threshold config so a handful of files spreads over partitions.
pub fn test_config(tar_size_threshold: u64, delta_max_steps: u32) -> Config {
    Config {
        tar_size_threshold,
        delta_max_steps,
        ..Config::default()
    }
}

/// Delegates to a file provider but fails uploads whose key contains a
/// marker substring.
pub struct FlakyProvider {
    inner: FileProvider,
    fail_substring: String,
}

impl FlakyProvider {
    pub fn new(root: &Path, fail_substring: &str) -> Self {
        FlakyProvider {
            inner: FileProvider::new(root).expect("file provider"),
            fail_substring: fail_substring.to_string(),
        }
    }
}

#[async_trait]
impl StorageProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn etag(&self, key: &str) -> Result<String, StorageError> {
        self.inner.etag(key).await
    }

    async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        storage_class: Option<&str>,
    ) -> Result<(), StorageError> {
        if key.contains(&self.fail_substring) {
            return Err(StorageError::Fatal(format!("injected failure for '{key}'")));
        }
        self.inner.put(key, body, storage_class).await
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        storage_class: Option<&str>,
    ) -> Result<(), StorageError> {
        if key.contains(&self.fail_substring) {
            return Err(StorageError::Fatal(format!("injected failure for '{key}'")));
        }
        self.inner.put_file(key, path, storage_class).await
    }

    async fn list(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> Result<Vec<ObjectListing>, StorageError> {
        self.inner.list(prefix, delimiter).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StorageError> {
        self.inner.delete(keys).await
    }
}
