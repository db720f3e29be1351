//! Retention: `delete before <time|name>` and `delete retain N [--full]`.
//!
//! Planning is a pure function over the catalog and its sentinels so the
//! chain rules are testable; execution deletes partitions, then the
//! sentinel, then the folder marker, and finally trims the WAL archive.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::catalog::{self, BackupTime};
use crate::sentinel::BackupSentinelDto;
use crate::{BackupError, Result, BASE_BACKUP_PATH, SENTINEL_SUFFIX, WAL_PATH};
use storage::StorageFolder;

#[derive(Debug, Clone)]
pub enum DeleteTarget {
    /// Delete backups finished strictly before a point in time.
    BeforeTime(DateTime<Utc>),
    /// Delete backups strictly older than a named backup.
    BeforeName(String),
    /// Keep the newest `count` backups; with `full`, count only full
    /// backups and keep every delta stacked between them.
    Retain { count: usize, full: bool },
}

/// The outcome of retention planning.
#[derive(Debug, Default)]
pub struct DeletePlan {
    /// Backups to drop, oldest first.
    pub delete: Vec<String>,
    /// Backups that survive.
    pub keep: Vec<String>,
    /// WAL segments strictly before this segment name are dropped.
    pub wal_boundary: Option<String>,
}

impl DeletePlan {
    fn noop(backups: &[BackupTime]) -> Self {
        DeletePlan {
            keep: backups.iter().map(|b| b.name.clone()).collect(),
            ..Default::default()
        }
    }
}

/// Computes which backups a delete command removes.
///
/// A backup older than the boundary survives if it is still a delta base
/// (direct or transitive) for a kept backup; anything unreachable is
/// eligible.
pub fn plan_delete(
    backups: &[BackupTime],
    sentinels: &HashMap<String, BackupSentinelDto>,
    target: &DeleteTarget,
) -> Result<DeletePlan> {
    if backups.is_empty() {
        return Ok(DeletePlan::default());
    }

    if let DeleteTarget::Retain { count: 0, .. } = target {
        return Err(BackupError::ConfigInvalid(
            "retain count must be positive".into(),
        ));
    }

    let boundary = match target {
        DeleteTarget::BeforeTime(time) => {
            match backups.iter().position(|b| b.last_modified >= *time) {
                Some(idx) => idx,
                None => {
                    return Err(BackupError::ConfigInvalid(format!(
                        "refusing to delete every backup (none newer than {time})"
                    )))
                }
            }
        }
        DeleteTarget::BeforeName(name) => backups
            .iter()
            .position(|b| &b.name == name)
            .ok_or_else(|| BackupError::BackupNotFound(name.clone()))?,
        DeleteTarget::Retain { count, full: false } => {
            if backups.len() <= *count {
                info!("have only {} backups", backups.len());
                return Ok(DeletePlan::noop(backups));
            }
            backups.len() - count
        }
        DeleteTarget::Retain { count, full: true } => {
            let mut left = *count;
            let mut boundary = None;
            for (idx, backup) in backups.iter().enumerate().rev() {
                let sentinel = sentinel_of(sentinels, &backup.name)?;
                if !sentinel.is_incremental() {
                    left -= 1;
                    if left == 0 {
                        boundary = Some(idx);
                        break;
                    }
                }
            }
            match boundary {
                Some(idx) => idx,
                None => {
                    warn!("scanned all backups but did not find {count} full");
                    return Ok(DeletePlan::noop(backups));
                }
            }
        }
    };

    let mut kept: HashSet<String> = backups[boundary..].iter().map(|b| b.name.clone()).collect();

    // Walk delta chains of kept backups; referenced ancestors survive.
    let known: HashSet<&str> = backups.iter().map(|b| b.name.as_str()).collect();
    let mut frontier: Vec<String> = kept.iter().cloned().collect();
    while let Some(name) = frontier.pop() {
        let sentinel = sentinel_of(sentinels, &name)?;
        if sentinel.is_incremental() {
            let base = sentinel
                .increment_from
                .clone()
                .expect("incremental sentinel has DeltaFrom");
            if known.contains(base.as_str()) && kept.insert(base.clone()) {
                frontier.push(base);
            }
        }
    }

    let delete: Vec<String> = backups[..boundary]
        .iter()
        .filter(|b| !kept.contains(&b.name))
        .map(|b| b.name.clone())
        .collect();
    let keep: Vec<String> = backups
        .iter()
        .filter(|b| kept.contains(&b.name))
        .map(|b| b.name.clone())
        .collect();
    let wal_boundary = backups
        .iter()
        .filter(|b| kept.contains(&b.name))
        .map(|b| b.wal_file_name.clone())
        .min();

    Ok(DeletePlan {
        delete,
        keep,
        wal_boundary,
    })
}

fn sentinel_of<'a>(
    sentinels: &'a HashMap<String, BackupSentinelDto>,
    name: &str,
) -> Result<&'a BackupSentinelDto> {
    sentinels
        .get(name)
        .ok_or_else(|| BackupError::Archive(format!("missing sentinel for backup '{name}'")))
}

/// Runs a delete command against the archive.
pub async fn handle_delete(
    folder: &StorageFolder,
    target: DeleteTarget,
    dry_run: bool,
) -> Result<()> {
    let backups = catalog::list_backups(folder).await?;
    if backups.is_empty() {
        info!("no backups found, nothing to delete");
        return Ok(());
    }

    let mut sentinels = HashMap::new();
    for backup in &backups {
        let sentinel = catalog::fetch_sentinel(folder, &backup.name).await?;
        sentinels.insert(backup.name.clone(), sentinel);
    }

    let plan = plan_delete(&backups, &sentinels, &target)?;
    if plan.delete.is_empty() {
        info!("nothing to delete");
        return Ok(());
    }

    for name in &plan.delete {
        if dry_run {
            println!("would delete {name}");
        } else {
            drop_backup(folder, name).await?;
            info!("deleted backup {name}");
        }
    }

    if let Some(boundary) = &plan.wal_boundary {
        if dry_run {
            println!("would delete WAL segments before {boundary}");
        } else {
            delete_wal_before(folder, boundary).await?;
        }
    }
    Ok(())
}

/// Removes a backup's objects: tar partitions first, then the sentinel,
/// then the folder marker. Dying midway leaves orphaned tar parts with no
/// sentinel, which a later retention run collects.
pub async fn drop_backup(folder: &StorageFolder, name: &str) -> Result<()> {
    let partition_keys = catalog::tar_partition_keys(folder, name).await?;
    folder.delete(&partition_keys).await?;
    folder
        .delete(&[format!("{BASE_BACKUP_PATH}/{name}{SENTINEL_SUFFIX}")])
        .await?;
    folder
        .delete(&[format!("{BASE_BACKUP_PATH}/{name}")])
        .await?;
    Ok(())
}

/// Deletes archived WAL segments strictly older than `boundary`.
pub async fn delete_wal_before(folder: &StorageFolder, boundary: &str) -> Result<()> {
    let listing = folder.list(&format!("{WAL_PATH}/"), None).await?;
    let keys: Vec<String> = listing
        .into_iter()
        .filter(|obj| {
            let segment = obj.file_name().split('.').next().unwrap_or_default();
            !segment.is_empty() && segment < boundary
        })
        .map(|obj| obj.key)
        .collect();
    if keys.is_empty() {
        return Ok(());
    }
    info!("deleting {} WAL segments before {boundary}", keys.len());
    folder.delete(&keys).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backup_time(name: &str, minute: u32) -> BackupTime {
        BackupTime {
            name: name.to_string(),
            last_modified: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            wal_file_name: catalog::strip_wal_file_name(name),
        }
    }

    fn full_sentinel(lsn: u64) -> BackupSentinelDto {
        BackupSentinelDto {
            lsn: Some(lsn),
            pg_version: 150004,
            finish_lsn: Some(lsn + 0x100),
            ..Default::default()
        }
    }

    fn delta_sentinel(lsn: u64, from: &str, full: &str, count: u32) -> BackupSentinelDto {
        BackupSentinelDto {
            lsn: Some(lsn),
            increment_from_lsn: Some(lsn - 0x100_0000),
            increment_from: Some(from.to_string()),
            increment_full_name: Some(full.to_string()),
            increment_count: Some(count),
            pg_version: 150004,
            finish_lsn: Some(lsn + 0x100),
            ..Default::default()
        }
    }

    /// History F1 D1 D2 F2 D3 F3, names carrying their start segments.
    fn history() -> (Vec<BackupTime>, HashMap<String, BackupSentinelDto>) {
        let f1 = "base_000000010000000000000002";
        let d1 = "base_000000010000000000000003_D_000000010000000000000002";
        let d2 = "base_000000010000000000000004_D_000000010000000000000003";
        let f2 = "base_000000010000000000000005";
        let d3 = "base_000000010000000000000006_D_000000010000000000000005";
        let f3 = "base_000000010000000000000007";

        let backups = vec![
            backup_time(f1, 0),
            backup_time(d1, 1),
            backup_time(d2, 2),
            backup_time(f2, 3),
            backup_time(d3, 4),
            backup_time(f3, 5),
        ];
        let mut sentinels = HashMap::new();
        sentinels.insert(f1.to_string(), full_sentinel(0x2000000));
        sentinels.insert(d1.to_string(), delta_sentinel(0x3000000, f1, f1, 2));
        sentinels.insert(d2.to_string(), delta_sentinel(0x4000000, d1, f1, 3));
        sentinels.insert(f2.to_string(), full_sentinel(0x5000000));
        sentinels.insert(d3.to_string(), delta_sentinel(0x6000000, f2, f2, 2));
        sentinels.insert(f3.to_string(), full_sentinel(0x7000000));
        (backups, sentinels)
    }

    #[test]
    fn retain_two_full_keeps_trailing_chain() {
        let (backups, sentinels) = history();
        let plan = plan_delete(
            &backups,
            &sentinels,
            &DeleteTarget::Retain {
                count: 2,
                full: true,
            },
        )
        .unwrap();

        assert_eq!(
            plan.delete,
            vec![
                "base_000000010000000000000002",
                "base_000000010000000000000003_D_000000010000000000000002",
                "base_000000010000000000000004_D_000000010000000000000003",
            ]
        );
        assert_eq!(
            plan.keep,
            vec![
                "base_000000010000000000000005",
                "base_000000010000000000000006_D_000000010000000000000005",
                "base_000000010000000000000007",
            ]
        );
        assert_eq!(
            plan.wal_boundary.as_deref(),
            Some("000000010000000000000005")
        );
    }

    #[test]
    fn retain_preserves_delta_bases_outside_the_window() {
        let (backups, sentinels) = history();
        // Keep the newest two backups: D3 and F3. D3 needs F2.
        let plan = plan_delete(
            &backups,
            &sentinels,
            &DeleteTarget::Retain {
                count: 2,
                full: false,
            },
        )
        .unwrap();
        assert!(plan.keep.contains(&"base_000000010000000000000005".to_string()));
        assert!(!plan.delete.contains(&"base_000000010000000000000005".to_string()));
        assert_eq!(plan.delete.len(), 3);
    }

    #[test]
    fn retain_more_than_available_is_a_noop() {
        let (backups, sentinels) = history();
        let plan = plan_delete(
            &backups,
            &sentinels,
            &DeleteTarget::Retain {
                count: 10,
                full: false,
            },
        )
        .unwrap();
        assert!(plan.delete.is_empty());
        assert_eq!(plan.keep.len(), 6);
    }

    #[test]
    fn before_time_keeps_chain_bases() {
        let (backups, sentinels) = history();
        // Cut between D2 and F2; D2's chain reaches back to F1 but no
        // kept backup references it, so the whole old chain goes.
        let cut = Utc.with_ymd_and_hms(2024, 5, 1, 12, 3, 0).unwrap();
        let plan = plan_delete(&backups, &sentinels, &DeleteTarget::BeforeTime(cut)).unwrap();
        assert_eq!(plan.delete.len(), 3);
        assert_eq!(plan.keep.len(), 3);

        // Cut between D1 and D2: D2 survives, so its bases D1 and F1 must too.
        let cut = Utc.with_ymd_and_hms(2024, 5, 1, 12, 2, 0).unwrap();
        let plan = plan_delete(&backups, &sentinels, &DeleteTarget::BeforeTime(cut)).unwrap();
        assert!(plan.delete.is_empty());
        assert_eq!(plan.keep.len(), 6);
    }

    #[test]
    fn refusing_to_delete_everything() {
        let (backups, sentinels) = history();
        let cut = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert!(plan_delete(&backups, &sentinels, &DeleteTarget::BeforeTime(cut)).is_err());
    }

    #[test]
    fn before_unknown_name_fails() {
        let (backups, sentinels) = history();
        let err = plan_delete(
            &backups,
            &sentinels,
            &DeleteTarget::BeforeName("base_nope".into()),
        )
        .unwrap_err();
        assert!(matches!(err, BackupError::BackupNotFound(_)));
    }
}
