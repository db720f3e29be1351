//! The backup catalog: listing, ordering and name resolution.
//!
//! A backup appears in the catalog if and only if its sentinel object
//! exists; in-progress and failed pushes leave orphaned tar partitions
//! that listings never show (retention treats them as garbage).

use chrono::{DateTime, Utc};
use log::debug;
use tokio::io::AsyncReadExt;

use crate::sentinel::BackupSentinelDto;
use crate::{BackupError, Result, BASE_BACKUP_PATH, SENTINEL_SUFFIX};
use storage::StorageFolder;

/// One catalog row.
#[derive(Debug, Clone)]
pub struct BackupTime {
    pub name: String,
    pub last_modified: DateTime<Utc>,
    /// WAL segment at which the backup started, extracted from the name.
    pub wal_file_name: String,
}

/// Extracts the starting WAL segment from a backup name
/// (`base_<walseg>` or `base_<walseg>_D_<walseg>`).
pub fn strip_wal_file_name(backup_name: &str) -> String {
    backup_name
        .trim_start_matches("base_")
        .split('_')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Pre-delta archive generations embedded `pg_control` inside a regular
/// partition; such names carry two underscore-separated fields after the
/// prefix. Restore uses this to skip the dedicated `pg_control` step.
pub fn is_legacy_name(backup_name: &str) -> bool {
    let mut parts = backup_name.splitn(3, '_');
    matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(first), Some(second), Some(_)) if !first.is_empty() && !second.is_empty()
    )
}

/// Lists finished backups, sorted ascending by modification time. The
/// last element is the LATEST backup.
pub async fn list_backups(folder: &StorageFolder) -> Result<Vec<BackupTime>> {
    let prefix = format!("{BASE_BACKUP_PATH}/");
    let listing = folder.list(&prefix, Some("/")).await?;
    let mut backups: Vec<BackupTime> = listing
        .into_iter()
        .filter(|obj| obj.key.ends_with(SENTINEL_SUFFIX))
        .map(|obj| {
            let name = obj
                .file_name()
                .trim_end_matches(SENTINEL_SUFFIX)
                .to_string();
            let wal_file_name = strip_wal_file_name(&name);
            BackupTime {
                name,
                last_modified: obj.last_modified,
                wal_file_name,
            }
        })
        .collect();
    backups.sort_by_key(|b| b.last_modified);
    Ok(backups)
}

/// Name of the most recent finished backup.
pub async fn latest_backup(folder: &StorageFolder) -> Result<String> {
    let backups = list_backups(folder).await?;
    backups
        .last()
        .map(|b| b.name.clone())
        .ok_or(BackupError::NoBackups)
}

/// Expands `LATEST` and verifies that a concrete name exists.
pub async fn resolve_backup_name(folder: &StorageFolder, name: &str) -> Result<String> {
    if name == "LATEST" {
        let latest = latest_backup(folder).await?;
        debug!("LATEST resolved to '{latest}'");
        return Ok(latest);
    }
    let sentinel_key = format!("{BASE_BACKUP_PATH}/{name}{SENTINEL_SUFFIX}");
    if !folder.exists(&sentinel_key).await? {
        return Err(BackupError::BackupNotFound(name.to_string()));
    }
    Ok(name.to_string())
}

/// Downloads and decodes a backup's sentinel manifest.
pub async fn fetch_sentinel(folder: &StorageFolder, name: &str) -> Result<BackupSentinelDto> {
    let key = format!("{BASE_BACKUP_PATH}/{name}{SENTINEL_SUFFIX}");
    let mut reader = folder.get(&key).await?;
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    let sentinel: BackupSentinelDto = serde_json::from_slice(&body)
        .map_err(|e| BackupError::Corrupt(format!("undecodable sentinel for '{name}': {e}")))?;
    Ok(sentinel)
}

/// Keys of every tar partition object of a backup, including the
/// `pg_control` partition.
pub async fn tar_partition_keys(folder: &StorageFolder, name: &str) -> Result<Vec<String>> {
    let prefix = format!("{BASE_BACKUP_PATH}/{name}/tar_partitions/");
    let listing = folder.list(&prefix, None).await?;
    let mut keys: Vec<String> = listing.into_iter().map(|obj| obj.key).collect();
    keys.sort();
    Ok(keys)
}

/// Splits partition keys into data partitions and the `pg_control`
/// partition. Filtering is by explicit file-name prefix, never by
/// position in the listing.
pub fn split_control_partition(keys: Vec<String>) -> (Vec<String>, Option<String>) {
    let mut data = Vec::with_capacity(keys.len());
    let mut control = None;
    for key in keys {
        let file_name = key.rsplit('/').next().unwrap_or(&key);
        if file_name.starts_with("pg_control.tar.") {
            control = Some(key);
        } else {
            data.push(key);
        }
    }
    (data, control)
}
