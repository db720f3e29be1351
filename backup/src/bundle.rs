//! Directory walking and the tar partition queue protocol.
//!
//! The walker runs in one task. It borrows idle partition writers from
//! `tarball_queue`, packs entries until a partition crosses the size
//! threshold, then closes it onto `upload_queue` and fabricates a fresh
//! writer. `upload_queue` is drained down to its high-water mark so
//! in-flight network I/O stays bounded while the walker keeps packing.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::sentinel::{BackupFileDescription, FileList};
use crate::tarball::{TarPartition, TarPartitionMaker};
use crate::{BackupError, Result};

/// Directory and file names excluded from every backup, matched at any
/// depth. Directories in this set are never descended into.
pub const EXCLUDED_NAMES: &[&str] = &[
    "pg_log",
    "pg_xlog",
    "pg_wal",
    "pgsql_tmp",
    "postgresql.auto.conf.tmp",
    "postmaster.pid",
    "postmaster.opts",
    "recovery.conf",
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_stat_tmp",
    "pg_snapshots",
    "pg_subtrans",
];

fn is_excluded(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| EXCLUDED_NAMES.contains(&n))
}

/// `pg_control` is noticed during the walk but packed separately at the
/// very end: its partition is the restore-side completeness marker.
struct DeferredControlFile {
    path: PathBuf,
    rel: PathBuf,
}

/// The directory being backed up, plus the queue state of its partitions.
pub struct Bundle {
    min_size: u64,
    increment_from_lsn: Option<u64>,
    increment_from_files: FileList,
    files: Arc<DashMap<String, BackupFileDescription>>,
    control_file: Option<DeferredControlFile>,

    maker: TarPartitionMaker,
    parallel_tarballs: usize,
    max_upload_queue: usize,
    tarball_tx: Option<mpsc::Sender<TarPartition>>,
    tarball_rx: Option<mpsc::Receiver<TarPartition>>,
    upload_queue: VecDeque<TarPartition>,
    started: bool,
}

impl Bundle {
    pub fn new(
        maker: TarPartitionMaker,
        min_size: u64,
        increment_from_lsn: Option<u64>,
        increment_from_files: FileList,
    ) -> Self {
        Bundle {
            min_size,
            increment_from_lsn,
            increment_from_files,
            files: Arc::new(DashMap::new()),
            control_file: None,
            maker,
            parallel_tarballs: 0,
            max_upload_queue: 0,
            tarball_tx: None,
            tarball_rx: None,
            upload_queue: VecDeque::new(),
            started: false,
        }
    }

    /// Freezes the walked file map into a sorted list for the sentinel.
    pub fn file_list(&self) -> FileList {
        self.files
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Prepares the writer pool. Panics when called twice: a restarted
    /// queue would interleave partitions of two walks.
    pub fn start_queue(&mut self, parallel_tarballs: usize, max_upload_queue: usize) {
        if self.started {
            panic!("trying to start an already started tarball queue");
        }
        self.parallel_tarballs = parallel_tarballs.max(1);
        self.max_upload_queue = max_upload_queue;
        let (tx, rx) = mpsc::channel(self.parallel_tarballs);
        for _ in 0..self.parallel_tarballs {
            let partition = self.maker.make();
            if tx.try_send(partition).is_err() {
                panic!("fresh tarball queue cannot be full");
            }
        }
        self.tarball_tx = Some(tx);
        self.tarball_rx = Some(rx);
        self.started = true;
    }

    async fn deque(&mut self) -> TarPartition {
        if !self.started {
            panic!("trying to deque from a queue that was not started");
        }
        self.tarball_rx
            .as_mut()
            .expect("queue started")
            .recv()
            .await
            .expect("tarball queue closed while walking")
    }

    /// Returns a writer to the pool, closing it out first if it crossed
    /// the size threshold.
    async fn check_size_and_enqueue_back(&mut self, mut partition: TarPartition) -> Result<()> {
        if partition.size() > self.min_size {
            partition.close_tar()?;
            self.upload_queue.push_back(partition);
            while self.upload_queue.len() > self.max_upload_queue {
                if let Some(mut oldest) = self.upload_queue.pop_front() {
                    oldest.await_upload().await;
                }
            }
            partition = self.maker.make();
        }
        let sent = self
            .tarball_tx
            .as_ref()
            .expect("queue started")
            .send(partition)
            .await;
        if sent.is_err() {
            panic!("tarball queue closed while walking");
        }
        Ok(())
    }

    /// Drains every in-flight upload and closes out the writer pool.
    /// After this returns, the shared success flag is stable.
    pub async fn finish_queue(&mut self) -> Result<()> {
        if !self.started {
            panic!("trying to finish a queue that was not started");
        }
        self.started = false;

        while let Some(mut partition) = self.upload_queue.pop_front() {
            partition.await_upload().await;
        }

        // Exactly parallel_tarballs writers are owed back to the pool.
        let mut rx = self.tarball_rx.take().expect("queue started");
        self.tarball_tx.take();
        for _ in 0..self.parallel_tarballs {
            let mut partition = rx.recv().await.expect("writer pool drained early");
            if !partition.is_touched() {
                continue;
            }
            partition.close_tar()?;
            partition.await_upload().await;
        }
        Ok(())
    }

    /// Walks the data directory in filesystem order, packing entries into
    /// partitions and recording per-file metadata for future deltas.
    pub async fn walk(&mut self, base: &Path, cancel: &CancellationToken) -> Result<()> {
        // Even an empty data directory yields a part_001: a backup with
        // no data partitions at all would be indistinguishable from one
        // whose parts were lost.
        let mut first = self.deque().await;
        first.set_up(None)?;
        self.check_size_and_enqueue_back(first).await?;

        let walker = walkdir::WalkDir::new(base)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_excluded(e.file_name()));

        for entry in walker {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let entry = entry.map_err(|e| {
                BackupError::Archive(format!("walk failed under '{}': {e}", base.display()))
            })?;
            let rel = entry
                .path()
                .strip_prefix(base)
                .expect("walked path is under base")
                .to_path_buf();
            self.handle_entry(base, &rel, &entry).await?;
        }
        Ok(())
    }

    async fn handle_entry(
        &mut self,
        base: &Path,
        rel: &Path,
        entry: &walkdir::DirEntry,
    ) -> Result<()> {
        let file_type = entry.file_type();
        let metadata = entry.metadata().map_err(|e| {
            BackupError::Archive(format!("stat failed for '{}': {e}", entry.path().display()))
        })?;

        if file_type.is_file() && entry.file_name().to_str() == Some("pg_control") {
            self.control_file = Some(DeferredControlFile {
                path: entry.path().to_path_buf(),
                rel: rel.to_path_buf(),
            });
            return Ok(());
        }

        if file_type.is_file() {
            let mtime: DateTime<Utc> = metadata.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
            let rel_str = rel.to_string_lossy().into_owned();

            if self.is_unchanged_since_base(&rel_str, mtime) {
                debug!("skipped unchanged file {rel_str}");
                self.files.insert(
                    rel_str,
                    BackupFileDescription {
                        is_incremented: false,
                        is_skipped: true,
                        mtime,
                    },
                );
                return Ok(());
            }

            let mut partition = self.deque().await;
            partition.set_up(None)?;
            partition.append_file(rel, entry.path(), &metadata)?;
            self.files.insert(
                rel_str,
                BackupFileDescription {
                    is_incremented: false,
                    is_skipped: false,
                    mtime,
                },
            );
            self.check_size_and_enqueue_back(partition).await?;
        } else if file_type.is_dir() {
            let mut partition = self.deque().await;
            partition.set_up(None)?;
            partition.append_dir(rel, &metadata)?;
            self.check_size_and_enqueue_back(partition).await?;
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            let mut partition = self.deque().await;
            partition.set_up(None)?;
            partition.append_symlink(rel, &target, &metadata)?;
            self.check_size_and_enqueue_back(partition).await?;
        } else {
            warn!("skipping special file '{}'", base.join(rel).display());
        }
        Ok(())
    }

    /// Delta decision: a file whose mtime equals the base backup's
    /// recorded mtime is not packed again.
    fn is_unchanged_since_base(&self, rel: &str, mtime: DateTime<Utc>) -> bool {
        if self.increment_from_lsn.is_none() {
            return false;
        }
        self.increment_from_files
            .get(rel)
            .map(|desc| desc.mtime == mtime)
            .unwrap_or(false)
    }

    /// Packs `pg_control` into its own final partition under a fixed
    /// name. Runs only after every data partition upload was started and
    /// awaited; the partition's presence is the restore-side proof that
    /// the data partitions are complete.
    pub async fn handle_control_file(&mut self, extension: &str) -> Result<()> {
        let mut partition = self.maker.make();
        let part_name = format!("pg_control.tar.{extension}");
        partition.set_up(Some(&part_name))?;
        if let Some(control) = self.control_file.take() {
            let metadata = std::fs::metadata(&control.path)?;
            partition.append_file(&control.rel, &control.path, &metadata)?;
            info!("{}", control.rel.display());
        }
        partition.close_tar()?;
        partition.await_upload().await;
        Ok(())
    }

    /// Packs `backup_label` and `tablespace_map` into one dedicated
    /// partition, strictly after the database reported backup stop.
    pub async fn handle_label_files(
        &mut self,
        pg_version: i32,
        backup_label: &str,
        tablespace_map: &str,
    ) -> Result<()> {
        // Nonexclusive backups (9.6+) return label contents instead of
        // leaving files in the data directory.
        if pg_version < 90600 {
            return Ok(());
        }
        let mut partition = self.maker.make();
        partition.set_up(None)?;
        partition.append_bytes("backup_label", 0o600, backup_label.as_bytes())?;
        partition.append_bytes("tablespace_map", 0o600, tablespace_map.as_bytes())?;
        partition.close_tar()?;
        partition.await_upload().await;
        Ok(())
    }
}
