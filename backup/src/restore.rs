//! Restore: walks a delta chain back to its full base and reconstructs
//! the data directory, extracting tar partitions in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::catalog;
use crate::codec::{codec_for_key, Crypter};
use crate::sentinel::BackupSentinelDto;
use crate::{BackupError, Result};
use storage::{ReaderMaker, StorageFolder};

const EXTRACT_ATTEMPTS: u32 = 3;

/// Unpacks downloaded tar partitions into the destination directory.
///
/// Partitions commute: no entry appears in two partitions, so extraction
/// order does not matter and partitions unpack concurrently.
#[derive(Clone)]
pub struct FileTarInterpreter {
    new_dir: PathBuf,
    crypter: Arc<dyn Crypter>,
}

impl FileTarInterpreter {
    pub fn new(new_dir: impl Into<PathBuf>, crypter: Arc<dyn Crypter>) -> Self {
        FileTarInterpreter {
            new_dir: new_dir.into(),
            crypter,
        }
    }

    /// Decrypts, decompresses and unpacks one spooled partition.
    fn interpret(&self, spool: &Path, key: &str) -> Result<()> {
        let codec = codec_for_key(key)
            .ok_or_else(|| BackupError::Archive(format!("no codec for partition '{key}'")))?;
        let file = std::fs::File::open(spool)?;
        let decrypted = self.crypter.decrypt(Box::new(file))?;
        let reader = codec.decompress(decrypted)?;
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive
            .unpack(&self.new_dir)
            .map_err(|e| BackupError::Archive(format!("failed to unpack '{key}': {e}")))?;
        Ok(())
    }
}

fn is_retryable(err: &BackupError) -> bool {
    match err {
        BackupError::Storage(storage_err) => storage_err.is_transient(),
        BackupError::Io(_) => true,
        _ => false,
    }
}

async fn extract_one(interpreter: FileTarInterpreter, maker: Arc<dyn ReaderMaker>) -> Result<()> {
    let mut attempt = 0;
    loop {
        let result = try_extract(&interpreter, maker.as_ref()).await;
        match result {
            Ok(()) => return Ok(()),
            Err(err) if is_retryable(&err) && attempt + 1 < EXTRACT_ATTEMPTS => {
                warn!(
                    "extraction of '{}' failed ({err}), retrying",
                    maker.path()
                );
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn try_extract(interpreter: &FileTarInterpreter, maker: &dyn ReaderMaker) -> Result<()> {
    // The maker restarts from the beginning of the object, so each
    // attempt spools a complete fresh copy before touching the tree.
    let mut reader = maker.reader().await.map_err(BackupError::Storage)?;
    let spool = tempfile::NamedTempFile::new()?;
    let mut spool_file = tokio::fs::File::from_std(spool.reopen()?);
    tokio::io::copy(&mut reader, &mut spool_file).await?;
    tokio::io::AsyncWriteExt::flush(&mut spool_file).await?;

    let interpreter = interpreter.clone();
    let key = maker.path().to_string();
    tokio::task::spawn_blocking(move || interpreter.interpret(spool.path(), &key))
        .await
        .map_err(|e| BackupError::Archive(format!("extraction task failed: {e}")))?
}

/// Extracts every partition through its restartable reader, at most
/// `concurrency` at a time.
pub async fn extract_all(
    interpreter: &FileTarInterpreter,
    makers: Vec<Arc<dyn ReaderMaker>>,
    concurrency: usize,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();
    for maker in makers {
        let interpreter = interpreter.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("extract semaphore closed");
            extract_one(interpreter, maker).await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|e| BackupError::Archive(format!("extraction task panicked: {e}")))??;
    }
    Ok(())
}

/// Fetches a backup (or `LATEST`) into `dest`, restoring its delta chain
/// base-first.
pub async fn backup_fetch(
    folder: &StorageFolder,
    backup_name: &str,
    dest: &Path,
    download_concurrency: usize,
    crypter: Arc<dyn Crypter>,
) -> Result<()> {
    let resolved = catalog::resolve_backup_name(folder, backup_name).await?;

    // Collect the chain head-first; a broken link surfaces before any
    // filesystem mutation happens.
    let mut chain: Vec<(String, BackupSentinelDto)> = Vec::new();
    let mut current = resolved;
    loop {
        let sentinel = catalog::fetch_sentinel(folder, &current).await?;
        sentinel.check_supported()?;
        let base = if sentinel.is_incremental() {
            sentinel.increment_from.clone()
        } else {
            None
        };
        chain.push((current, sentinel));
        match base {
            Some(base) => current = base,
            None => break,
        }
    }

    for (name, sentinel) in chain.iter().rev() {
        if sentinel.is_incremental() {
            info!(
                "delta from {} at LSN {:X}",
                sentinel.increment_from.as_deref().unwrap_or_default(),
                sentinel.increment_from_lsn.unwrap_or_default()
            );
        }
        unwrap_backup(folder, name, sentinel, dest, download_concurrency, crypter.clone()).await?;
        info!("{name} fetched");
    }
    Ok(())
}

/// Restores a single chain step on top of the destination directory.
async fn unwrap_backup(
    folder: &StorageFolder,
    name: &str,
    sentinel: &BackupSentinelDto,
    dest: &Path,
    download_concurrency: usize,
    crypter: Arc<dyn Crypter>,
) -> Result<()> {
    let increment_base = dest.join("increment_base");

    if !sentinel.is_incremental() {
        std::fs::create_dir_all(dest)?;
        if std::fs::read_dir(dest)?.next().is_some() {
            return Err(BackupError::Archive(format!(
                "restore destination '{}' must be empty",
                dest.display()
            )));
        }
    } else {
        // Move the previous chain step aside, then bring the files this
        // step skipped back into place before unpacking on top.
        std::fs::create_dir_all(&increment_base)?;
        let existing: Vec<_> = std::fs::read_dir(dest)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .filter(|e| e.file_name() != "increment_base")
            .collect();
        for entry in existing {
            std::fs::rename(entry.path(), increment_base.join(entry.file_name()))?;
        }

        for (path, description) in &sentinel.files {
            if !description.is_skipped {
                continue;
            }
            debug!("carried over skipped file {path}");
            move_file_and_create_dirs(&increment_base.join(path), &dest.join(path)).map_err(
                |e| {
                    BackupError::Archive(format!(
                        "failed to carry skipped file '{path}' from the delta base: {e}"
                    ))
                },
            )?;
        }
    }

    let keys = catalog::tar_partition_keys(folder, name).await?;
    let (data_keys, control_key) = catalog::split_control_partition(keys);

    let interpreter = FileTarInterpreter::new(dest, crypter);
    let makers: Vec<Arc<dyn ReaderMaker>> = data_keys
        .iter()
        .map(|key| folder.reader_maker(key))
        .collect();
    extract_all(&interpreter, makers, download_concurrency).await?;

    // Modern backups upload pg_control in its own partition, extracted
    // last; its absence means the push never completed.
    if !catalog::is_legacy_name(name) || sentinel.is_incremental() {
        let control_key = control_key.ok_or_else(|| {
            BackupError::Corrupt(format!("missing pg_control partition in backup '{name}'"))
        })?;
        extract_all(&interpreter, vec![folder.reader_maker(&control_key)], 1).await?;
    }

    if sentinel.is_incremental() {
        std::fs::remove_dir_all(&increment_base)?;
    }
    Ok(())
}

/// Renames `from` to `to`, creating any missing parent directories.
fn move_file_and_create_dirs(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(from, to)
}
