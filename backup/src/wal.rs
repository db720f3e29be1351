//! WAL segment archiving: push with a background uploader, fetch with a
//! prefetch staging area.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};

use crate::codec::{codec_priority, default_codec, Codec, Crypter, SharedBuffer};
use crate::config::Config;
use crate::lsn;
use crate::{BackupError, Result, WAL_MAGIC_FLOOR, WAL_PATH, WAL_SEGMENT_SIZE};
use storage::{StorageError, StorageFolder};

/// Hard cap on segments one background uploader run may push.
const BG_UPLOAD_LIMIT: usize = 1024;

/// How long the prefetched-file poll sleeps between size samples.
const PREFETCH_POLL: Duration = Duration::from_millis(50);

/// Uploads one WAL segment and, meanwhile, any ready segments the
/// archiver has queued up next to it.
pub async fn wal_push(
    folder: &StorageFolder,
    wal_path: &Path,
    config: &Config,
    crypter: Arc<dyn Crypter>,
    verify: bool,
) -> Result<()> {
    let background = BgUploader::start(
        folder.clone(),
        wal_path,
        config.upload_concurrency.saturating_sub(1),
        config.storage_class.clone(),
        crypter.clone(),
        verify,
    );

    let result = upload_wal_file(
        folder,
        wal_path,
        config.storage_class.as_deref(),
        crypter,
        verify,
    )
    .await;

    if let Some(background) = background {
        background.stop().await;
    }
    result.map(|_| ())
}

/// Compresses, optionally encrypts and uploads a single segment.
/// With `verify`, an MD5 of the compressed bytes is checked against the
/// object ETag after upload.
pub async fn upload_wal_file(
    folder: &StorageFolder,
    wal_path: &Path,
    storage_class: Option<&str>,
    crypter: Arc<dyn Crypter>,
    verify: bool,
) -> Result<String> {
    let file_name = wal_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| BackupError::Archive(format!("bad WAL path '{}'", wal_path.display())))?;
    let contents = std::fs::read(wal_path)?;

    let codec = default_codec();
    let compressed = compress_in_memory(codec.as_ref(), crypter.as_ref(), &contents)?;
    let checksum = verify.then(|| format!("{:x}", md5::compute(&compressed)));

    let key = format!("{WAL_PATH}/{file_name}.{}", codec.extension());
    folder
        .put(&key, Bytes::from(compressed), storage_class)
        .await?;
    info!("uploaded WAL segment to '{key}'");

    if let Some(checksum) = checksum {
        let etag = folder.etag(&key).await?;
        let etag = etag.trim_matches('"');
        if checksum != etag {
            return Err(BackupError::Corrupt(format!(
                "WAL verification failed for '{key}': md5 {checksum}, ETag {etag}"
            )));
        }
        debug!("verified '{key}' against ETag {etag}");
    }
    Ok(key)
}

fn compress_in_memory(
    codec: &dyn Codec,
    crypter: &dyn Crypter,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    let buffer = SharedBuffer::new();
    let encrypted = crypter.encrypt(Box::new(buffer.clone()))?;
    let mut writer = codec.compress(encrypted)?;
    writer.write_all(plaintext)?;
    writer.finish()?;
    Ok(buffer.take())
}

/// Pushes ready segments from `archive_status/` concurrently with the
/// foreground upload, marking each `.ready` file `.done` on success.
pub struct BgUploader {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl BgUploader {
    pub fn start(
        folder: StorageFolder,
        foreground: &Path,
        parallel: usize,
        storage_class: Option<String>,
        crypter: Arc<dyn Crypter>,
        verify: bool,
    ) -> Option<BgUploader> {
        if parallel == 0 {
            return None;
        }
        let wal_dir = foreground.parent()?.to_path_buf();
        let foreground_name = foreground.file_name()?.to_string_lossy().into_owned();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = tokio::spawn(async move {
            run_bg_uploads(
                folder,
                wal_dir,
                foreground_name,
                parallel,
                storage_class,
                crypter,
                verify,
                stop_flag,
            )
            .await;
        });
        Some(BgUploader { stop, handle })
    }

    /// Stops launching new uploads and waits for in-flight ones.
    pub async fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_bg_uploads(
    folder: StorageFolder,
    wal_dir: PathBuf,
    foreground_name: String,
    parallel: usize,
    storage_class: Option<String>,
    crypter: Arc<dyn Crypter>,
    verify: bool,
    stop: Arc<AtomicBool>,
) {
    let status_dir = wal_dir.join("archive_status");
    let entries = match std::fs::read_dir(&status_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let semaphore = Arc::new(Semaphore::new(parallel));
    let mut tasks = JoinSet::new();
    let mut launched = 0usize;

    for entry in entries.flatten() {
        if stop.load(Ordering::SeqCst) || launched >= BG_UPLOAD_LIMIT {
            break;
        }
        let marker_name = entry.file_name().to_string_lossy().into_owned();
        let segment_name = match marker_name.strip_suffix(".ready") {
            Some(name) => name.to_string(),
            None => continue,
        };
        if segment_name == foreground_name {
            continue;
        }
        let segment_path = wal_dir.join(&segment_name);
        if !segment_path.is_file() {
            continue;
        }

        launched += 1;
        let folder = folder.clone();
        let crypter = crypter.clone();
        let storage_class = storage_class.clone();
        let semaphore = semaphore.clone();
        let marker_path = entry.path();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("bg upload semaphore closed");
            match upload_wal_file(
                &folder,
                &segment_path,
                storage_class.as_deref(),
                crypter,
                verify,
            )
            .await
            {
                Ok(_) => {
                    let done = marker_path.with_extension("done");
                    if let Err(err) = std::fs::rename(&marker_path, &done) {
                        warn!(
                            "failed to mark '{}' done: {err}",
                            marker_path.display()
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        "background upload of '{}' failed: {err}",
                        segment_path.display()
                    );
                }
            }
        });
    }

    while tasks.join_next().await.is_some() {}
}

/// Staging paths for a segment: the in-progress download and the
/// completed prefetch.
fn prefetch_locations(wal_dir: &Path, segment: &str) -> (PathBuf, PathBuf) {
    let base = wal_dir.join(".pgvault").join("prefetch");
    (base.join("running").join(segment), base.join(segment))
}

/// First four little-endian bytes must clear the magic floor; anything
/// below is not WAL.
pub fn check_wal_magic(path: &Path) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if u32::from_le_bytes(magic) < WAL_MAGIC_FLOOR {
        return Err(BackupError::Corrupt(format!(
            "WAL segment '{}' has invalid magic",
            path.display()
        )));
    }
    Ok(())
}

/// Fetches one segment into `dest`, preferring a completed prefetch and
/// waiting briefly on one that is still downloading.
pub async fn wal_fetch(
    folder: &StorageFolder,
    segment: &str,
    dest: &Path,
    download_concurrency: usize,
    crypter: Arc<dyn Crypter>,
    trigger_prefetch: bool,
) -> Result<()> {
    let wal_dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let (running, prefetched) = prefetch_locations(wal_dir, segment);

    let mut seen_size: Option<u64> = None;
    loop {
        match std::fs::metadata(&prefetched) {
            Ok(meta) => {
                if meta.len() != WAL_SEGMENT_SIZE {
                    warn!(
                        "prefetched '{segment}' has wrong size {}, re-downloading",
                        meta.len()
                    );
                    let _ = std::fs::remove_file(&prefetched);
                    break;
                }
                std::fs::rename(&prefetched, dest)?;
                match check_wal_magic(dest) {
                    Ok(()) => {
                        if trigger_prefetch {
                            fork_prefetch(segment, dest, download_concurrency);
                        }
                        return Ok(());
                    }
                    Err(err) => {
                        warn!("prefetched '{segment}' is corrupt ({err}), re-downloading");
                        let _ = std::fs::remove_file(dest);
                        break;
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        // Another process may be downloading this segment right now. As
        // long as its file grows we wait; one stalled interval and we
        // take over.
        match std::fs::metadata(&running) {
            Ok(meta) => {
                let observed = meta.len();
                if seen_size.is_some_and(|seen| observed <= seen) {
                    let _ = std::fs::remove_file(&running);
                    let _ = std::fs::remove_file(&prefetched);
                    break;
                }
                seen_size = Some(observed);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => break,
            Err(_) => break,
        }
        tokio::time::sleep(PREFETCH_POLL).await;
    }

    download_wal_file(folder, segment, dest, crypter).await?;
    if trigger_prefetch {
        fork_prefetch(segment, dest, download_concurrency);
    }
    Ok(())
}

/// Downloads a segment directly, probing codec extensions in priority
/// order, and validates size and magic.
pub async fn download_wal_file(
    folder: &StorageFolder,
    segment: &str,
    dest: &Path,
    crypter: Arc<dyn Crypter>,
) -> Result<()> {
    for codec in codec_priority() {
        let key = format!("{WAL_PATH}/{segment}.{}", codec.extension());
        if !folder.exists(&key).await? {
            continue;
        }

        let mut reader = folder.get(&key).await?;
        let mut compressed = Vec::new();
        reader.read_to_end(&mut compressed).await?;

        let crypter = crypter.clone();
        let codec = codec.clone();
        let dest_path = dest.to_path_buf();
        let size = tokio::task::spawn_blocking(move || -> Result<u64> {
            let decrypted = crypter.decrypt(Box::new(Cursor::new(compressed)))?;
            let mut plaintext = codec.decompress(decrypted)?;
            let mut file = std::fs::File::create(&dest_path)?;
            Ok(std::io::copy(&mut plaintext, &mut file)?)
        })
        .await
        .map_err(|e| BackupError::Archive(format!("WAL decompression task failed: {e}")))??;

        if size != WAL_SEGMENT_SIZE {
            let _ = std::fs::remove_file(dest);
            return Err(BackupError::Corrupt(format!(
                "downloaded WAL segment '{segment}' has wrong size {size}"
            )));
        }
        if let Err(err) = check_wal_magic(dest) {
            warn!("downloaded WAL segment '{segment}' failed the magic check");
            let _ = std::fs::remove_file(dest);
            return Err(err);
        }
        return Ok(());
    }
    Err(BackupError::Storage(StorageError::NotFound(format!(
        "WAL segment '{segment}'"
    ))))
}

/// Downloads one segment into the prefetch staging area. Used by the
/// detached helper processes `wal-fetch` forks.
pub async fn wal_prefetch(
    folder: &StorageFolder,
    segment: &str,
    dest: &Path,
    crypter: Arc<dyn Crypter>,
) -> Result<()> {
    let wal_dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let (running, prefetched) = prefetch_locations(wal_dir, segment);
    if prefetched.exists() || running.exists() {
        debug!("'{segment}' already prefetched or in progress");
        return Ok(());
    }
    if let Some(parent) = running.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match download_wal_file(folder, segment, &running, crypter).await {
        Ok(()) => {
            std::fs::rename(&running, &prefetched)?;
            debug!("prefetched '{segment}'");
            Ok(())
        }
        Err(BackupError::Storage(StorageError::NotFound(_))) => {
            // The archiver has not produced this segment yet.
            let _ = std::fs::remove_file(&running);
            Ok(())
        }
        Err(err) => {
            let _ = std::fs::remove_file(&running);
            Err(err)
        }
    }
}

/// Spawns detached `wal-prefetch` helpers for the segments following the
/// one just fetched, so the next `wal-fetch` is a rename.
fn fork_prefetch(segment: &str, dest: &Path, count: usize) {
    // Timeline history files and other non-segment names are not
    // prefetchable.
    let following = match lsn::following_segments(segment, count) {
        Ok(following) => following,
        Err(_) => return,
    };
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(err) => {
            warn!("cannot locate own binary for prefetch: {err}");
            return;
        }
    };
    for next in following {
        let location = dest.with_file_name(&next);
        let spawned = std::process::Command::new(&exe)
            .arg("wal-prefetch")
            .arg(&next)
            .arg(&location)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn();
        if let Err(err) = spawned {
            warn!("failed to fork prefetch for '{next}': {err}");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_floor_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good");
        std::fs::write(&good, [0x61, 0xD0, 0x00, 0x00, 0xFF]).unwrap();
        assert!(check_wal_magic(&good).is_ok());

        let bad = dir.path().join("bad");
        std::fs::write(&bad, [0x00, 0x00, 0x00, 0x00]).unwrap();
        assert!(matches!(
            check_wal_magic(&bad),
            Err(BackupError::Corrupt(_))
        ));

        // 0xD060 is one below the floor.
        let below = dir.path().join("below");
        std::fs::write(&below, [0x60, 0xD0, 0x00, 0x00]).unwrap();
        assert!(check_wal_magic(&below).is_err());
    }

    #[test]
    fn prefetch_paths_are_segment_scoped() {
        let (running, prefetched) =
            prefetch_locations(Path::new("/wal"), "000000010000000000000042");
        assert_eq!(
            running,
            Path::new("/wal/.pgvault/prefetch/running/000000010000000000000042")
        );
        assert_eq!(
            prefetched,
            Path::new("/wal/.pgvault/prefetch/000000010000000000000042")
        );
    }

    #[test]
    fn compression_roundtrip_through_crypter() {
        use crate::codec::{Lz4Codec, NoCrypter};
        let payload = vec![0xA5u8; 4096];
        let compressed =
            compress_in_memory(&Lz4Codec, &NoCrypter, &payload).unwrap();
        assert!(!compressed.is_empty());
        let mut reader = Lz4Codec
            .decompress(Box::new(Cursor::new(compressed)))
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }
}
