//! The backup-push pipeline: delta policy, walk, and the end-of-backup
//! protocol that decides whether a sentinel may be uploaded.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use log::info;
use tokio_util::sync::CancellationToken;

use crate::bundle::Bundle;
use crate::catalog;
use crate::codec::{Codec, Crypter};
use crate::config::{Config, DeltaOrigin};
use crate::queryrunner::BackupDatabase;
use crate::sentinel::{BackupSentinelDto, FileList};
use crate::tarball::{TarPartitionMaker, TarUploader};
use crate::{BackupError, Result};
use storage::StorageFolder;

struct DeltaBase {
    name: String,
    sentinel: BackupSentinelDto,
}

/// Decides whether this push is a delta and which backup it builds on.
async fn select_delta_base(folder: &StorageFolder, config: &Config) -> Result<Option<DeltaBase>> {
    if config.delta_max_steps == 0 {
        return Ok(None);
    }
    let head = match catalog::latest_backup(folder).await {
        Ok(name) => name,
        Err(BackupError::NoBackups) => return Ok(None),
        Err(err) => return Err(err),
    };
    let head_sentinel = catalog::fetch_sentinel(folder, &head).await?;

    // Chain length is measured from the head even when rebasing onto the
    // full backup, so LATEST_FULL chains still roll over to a new full.
    // A full backup counts as step one.
    let steps_from_head = head_sentinel.increment_count.unwrap_or(1) + 1;
    if steps_from_head > config.delta_max_steps {
        info!("reached max delta steps, doing full backup");
        return Ok(None);
    }
    if head_sentinel.lsn.is_none() {
        info!("latest backup carries no LSN marker, falling back to full backup");
        return Ok(None);
    }

    let (name, sentinel) =
        if config.delta_origin == DeltaOrigin::LatestFull && head_sentinel.is_incremental() {
            let full = head_sentinel
                .increment_full_name
                .clone()
                .expect("incremental sentinel has DeltaFullName");
            info!("delta will be made from full backup {full}");
            let full_sentinel = catalog::fetch_sentinel(folder, &full).await?;
            (full, full_sentinel)
        } else {
            (head, head_sentinel)
        };
    sentinel.check_supported()?;
    info!(
        "delta backup from {name} at LSN {:X}",
        sentinel.lsn.expect("delta base has an LSN")
    );
    Ok(Some(DeltaBase { name, sentinel }))
}

/// Runs a complete base backup push. Returns the backup name on success.
///
/// The sentinel is uploaded last and only when every partition upload
/// succeeded, the walk was not cancelled, and the timeline did not move.
pub async fn backup_push(
    folder: &StorageFolder,
    db: &mut dyn BackupDatabase,
    data_dir: &Path,
    config: &Config,
    codec: Arc<dyn Codec>,
    crypter: Arc<dyn Crypter>,
    cancel: &CancellationToken,
) -> Result<String> {
    let data_dir = data_dir.canonicalize()?;

    let delta_base = select_delta_base(folder, config).await?;

    let label = format!("pgvault {}", Utc::now().to_rfc3339());
    let start = db.start_backup(&label).await?;

    let mut backup_name = start.backup_name.clone();
    if let Some(base) = &delta_base {
        backup_name = format!(
            "{backup_name}_D_{}",
            catalog::strip_wal_file_name(&base.name)
        );
    }

    let uploader = TarUploader::new(folder.clone(), config.storage_class.clone());
    let maker =
        TarPartitionMaker::new(backup_name.as_str(), uploader.clone(), codec.clone(), crypter);
    let (increment_lsn, increment_files) = match &delta_base {
        Some(base) => (base.sentinel.lsn, base.sentinel.files.clone()),
        None => (None, FileList::new()),
    };
    let mut bundle = Bundle::new(
        maker,
        config.tar_size_threshold,
        increment_lsn,
        increment_files,
    );

    bundle.start_queue(config.upload_disk_concurrency, config.max_upload_queue);
    info!("walking {}", data_dir.display());
    bundle.walk(&data_dir, cancel).await?;
    bundle.finish_queue().await?;

    bundle.handle_control_file(codec.extension()).await?;

    let stop = db.stop_backup().await?;
    bundle
        .handle_label_files(start.pg_version, &stop.backup_label, &stop.tablespace_map)
        .await?;

    if cancel.is_cancelled() {
        // On disk this run is indistinguishable from an unfinished one.
        return Err(BackupError::Cancelled);
    }

    let sentinel = if db.timeline_changed(start.timeline).await? {
        None
    } else {
        let mut dto = BackupSentinelDto {
            lsn: Some(start.lsn),
            pg_version: start.pg_version,
            finish_lsn: Some(stop.finish_lsn),
            files: bundle.file_list(),
            user_data: config.sentinel_user_data.clone(),
            ..Default::default()
        };
        if let Some(base) = &delta_base {
            dto.increment_from_lsn = base.sentinel.lsn;
            dto.increment_from = Some(base.name.clone());
            dto.increment_full_name = Some(if base.sentinel.is_incremental() {
                base.sentinel
                    .increment_full_name
                    .clone()
                    .expect("incremental sentinel has DeltaFullName")
            } else {
                base.name.clone()
            });
            dto.increment_count = Some(base.sentinel.increment_count.unwrap_or(1) + 1);
        }
        Some(dto)
    };

    uploader.finish_backup(&backup_name, sentinel.as_ref()).await?;
    info!("uploaded backup '{backup_name}'");
    Ok(backup_name)
}
