//! Tar partition writing and uploading.
//!
//! Each partition spools `tar -> compress -> encrypt` into a scratch file
//! and uploads from disk once closed. A tar entry is never split across
//! partitions. Upload failures flip a shared success flag; the sentinel is
//! only uploaded while the flag still reads true.

use std::fs::Metadata;
use std::io::Read;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, error, info};
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;

use crate::codec::{Codec, Crypter, FinishWrite, SinkWriter};
use crate::sentinel::BackupSentinelDto;
use crate::{BackupError, Result, BASE_BACKUP_PATH, SENTINEL_SUFFIX};
use storage::StorageFolder;

/// Shared upload state for all partitions of one backup.
#[derive(Clone)]
pub struct TarUploader {
    folder: StorageFolder,
    storage_class: Option<String>,
    success: Arc<AtomicBool>,
}

impl TarUploader {
    pub fn new(folder: StorageFolder, storage_class: Option<String>) -> Self {
        TarUploader {
            folder,
            storage_class,
            success: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn folder(&self) -> &StorageFolder {
        &self.folder
    }

    /// True until any upload of this backup has failed.
    pub fn is_successful(&self) -> bool {
        self.success.load(Ordering::SeqCst)
    }

    async fn upload_spool(&self, key: String, spool: NamedTempFile) {
        if let Err(err) = self
            .folder
            .put_file(&key, spool.path(), self.storage_class.as_deref())
            .await
        {
            error!("upload: could not upload '{key}': {err}");
            self.success.store(false, Ordering::SeqCst);
        }
    }

    /// Uploads the sentinel manifest, but only if every partition upload
    /// succeeded and the backup was not invalidated. This is the
    /// atomicity hinge of the whole push.
    pub async fn finish_backup(
        &self,
        backup_name: &str,
        sentinel: Option<&BackupSentinelDto>,
    ) -> Result<()> {
        if !self.is_successful() {
            error!("could not complete upload of backup '{backup_name}'");
            return Err(BackupError::UploadFailed);
        }
        let sentinel = match sentinel {
            Some(sentinel) => sentinel,
            None => {
                return Err(BackupError::SentinelNotUploaded(
                    "timeline changed during backup".into(),
                ))
            }
        };
        let body = serde_json::to_vec(sentinel)
            .map_err(|e| BackupError::Archive(format!("failed to encode sentinel: {e}")))?;
        let key = format!("{BASE_BACKUP_PATH}/{backup_name}{SENTINEL_SUFFIX}");
        self.folder
            .put(&key, Bytes::from(body), self.storage_class.as_deref())
            .await?;
        Ok(())
    }
}

/// Creates numbered partitions sharing one uploader.
pub struct TarPartitionMaker {
    number: usize,
    backup_name: String,
    uploader: TarUploader,
    codec: Arc<dyn Codec>,
    crypter: Arc<dyn Crypter>,
}

impl TarPartitionMaker {
    pub fn new(
        backup_name: impl Into<String>,
        uploader: TarUploader,
        codec: Arc<dyn Codec>,
        crypter: Arc<dyn Crypter>,
    ) -> Self {
        TarPartitionMaker {
            number: 0,
            backup_name: backup_name.into(),
            uploader,
            codec,
            crypter,
        }
    }

    pub fn make(&mut self) -> TarPartition {
        self.number += 1;
        TarPartition {
            number: self.number,
            size: 0,
            backup_name: self.backup_name.clone(),
            uploader: self.uploader.clone(),
            codec: self.codec.clone(),
            crypter: self.crypter.clone(),
            writer: None,
            upload: None,
        }
    }
}

struct OpenWriter {
    tar: tar::Builder<Box<dyn FinishWrite>>,
    spool: NamedTempFile,
    part_name: String,
}

/// One size-bounded tar archive of a backup.
pub struct TarPartition {
    number: usize,
    size: u64,
    backup_name: String,
    uploader: TarUploader,
    codec: Arc<dyn Codec>,
    crypter: Arc<dyn Crypter>,
    writer: Option<OpenWriter>,
    upload: Option<JoinHandle<()>>,
}

impl TarPartition {
    pub fn number(&self) -> usize {
        self.number
    }

    /// Logical bytes added so far (uncompressed entry sizes).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True once the writer chain exists; untouched partitions are
    /// discarded at queue finish.
    pub fn is_touched(&self) -> bool {
        self.writer.is_some() || self.upload.is_some()
    }

    /// Lazily builds the writer chain. `name` overrides the default
    /// `part_NNN.tar.<ext>` partition name (used for `pg_control`).
    pub fn set_up(&mut self, name: Option<&str>) -> Result<()> {
        if self.writer.is_some() {
            return Ok(());
        }
        let part_name = match name {
            Some(name) => name.to_string(),
            None => format!("part_{:03}.tar.{}", self.number, self.codec.extension()),
        };
        let spool = NamedTempFile::new()?;
        let sink: Box<dyn FinishWrite> = Box::new(SinkWriter(spool.reopen()?));
        let encrypted = self.crypter.encrypt(sink)?;
        let compressed = self.codec.compress(encrypted)?;
        self.writer = Some(OpenWriter {
            tar: tar::Builder::new(compressed),
            spool,
            part_name,
        });
        Ok(())
    }

    fn tar(&mut self) -> &mut tar::Builder<Box<dyn FinishWrite>> {
        &mut self
            .writer
            .as_mut()
            .expect("partition used before set_up")
            .tar
    }

    /// Appends one regular file under its backup-relative path.
    pub fn append_file(&mut self, rel: &Path, path: &Path, metadata: &Metadata) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(metadata, tar::HeaderMode::Complete);
        let file = std::fs::File::open(path)?;
        let limited = file.take(metadata.len());
        self.tar()
            .append_data(&mut header, rel, limited)
            .map_err(|e| BackupError::Archive(format!("failed to append '{}': {e}", rel.display())))?;
        self.size += metadata.len();
        Ok(())
    }

    /// Appends a directory header so restore reproduces the tree shape.
    pub fn append_dir(&mut self, rel: &Path, metadata: &Metadata) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_metadata_in_mode(metadata, tar::HeaderMode::Complete);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        self.tar()
            .append_data(&mut header, rel, std::io::empty())
            .map_err(|e| BackupError::Archive(format!("failed to append '{}': {e}", rel.display())))?;
        Ok(())
    }

    /// Appends a symbolic link entry.
    pub fn append_symlink(&mut self, rel: &Path, target: &Path, metadata: &Metadata) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(metadata.permissions().mode());
        header.set_mtime(metadata.mtime() as u64);
        self.tar()
            .append_link(&mut header, rel, target)
            .map_err(|e| BackupError::Archive(format!("failed to append '{}': {e}", rel.display())))?;
        Ok(())
    }

    /// Appends an in-memory payload (label files).
    pub fn append_bytes(&mut self, name: &str, mode: u32, contents: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(mode);
        header.set_size(contents.len() as u64);
        header.set_mtime(0);
        self.tar()
            .append_data(&mut header, name, contents)
            .map_err(|e| BackupError::Archive(format!("failed to append '{name}': {e}")))?;
        self.size += contents.len() as u64;
        Ok(())
    }

    /// Finishes the tar stream, flushes the codec chain and starts the
    /// upload in the background.
    pub fn close_tar(&mut self) -> Result<()> {
        let OpenWriter {
            tar,
            spool,
            part_name,
        } = self
            .writer
            .take()
            .expect("closing a partition that was never set up");
        let chain = tar
            .into_inner()
            .map_err(|e| BackupError::Archive(format!("failed to close tarball: {e}")))?;
        chain
            .finish()
            .map_err(|e| BackupError::Archive(format!("failed to flush tarball: {e}")))?;
        debug!("finished writing part {}", self.number);

        let key = format!(
            "{BASE_BACKUP_PATH}/{}/tar_partitions/{part_name}",
            self.backup_name
        );
        info!("starting upload of part {} -> '{key}'", self.number);
        let uploader = self.uploader.clone();
        self.upload = Some(tokio::spawn(async move {
            uploader.upload_spool(key, spool).await;
        }));
        Ok(())
    }

    /// Waits for this partition's in-flight upload, if any.
    pub async fn await_upload(&mut self) {
        if let Some(handle) = self.upload.take() {
            if handle.await.is_err() {
                error!("upload task for part {} panicked", self.number);
                self.uploader.success.store(false, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{default_codec, NoCrypter};
    use storage::providers::FileProvider;

    fn test_uploader(dir: &Path) -> TarUploader {
        let provider = Arc::new(FileProvider::new(dir).unwrap());
        TarUploader::new(StorageFolder::new(provider, ""), None)
    }

    #[tokio::test]
    async fn partition_names_are_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        let mut maker = TarPartitionMaker::new(
            "base_000000010000000000000002",
            test_uploader(dir.path()),
            default_codec(),
            Arc::new(NoCrypter),
        );
        let mut part = maker.make();
        part.set_up(None).unwrap();
        part.append_bytes("hello", 0o600, b"world").unwrap();
        part.close_tar().unwrap();
        part.await_upload().await;

        let expected = dir
            .path()
            .join("basebackups_005/base_000000010000000000000002/tar_partitions/part_001.tar.lz4");
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn untouched_partition_reports_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut maker = TarPartitionMaker::new(
            "base_000000010000000000000002",
            test_uploader(dir.path()),
            default_codec(),
            Arc::new(NoCrypter),
        );
        let part = maker.make();
        assert!(!part.is_touched());
    }

    #[tokio::test]
    async fn sentinel_is_withheld_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let uploader = test_uploader(dir.path());
        uploader.success.store(false, Ordering::SeqCst);
        let result = uploader
            .finish_backup("base_000000010000000000000002", Some(&Default::default()))
            .await;
        assert!(matches!(result, Err(BackupError::UploadFailed)));
        assert!(!dir
            .path()
            .join("basebackups_005/base_000000010000000000000002_backup_stop_sentinel.json")
            .exists());
    }
}
