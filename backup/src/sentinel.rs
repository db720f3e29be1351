//! The per-backup JSON manifest.
//!
//! The sentinel is written last, after every tar partition upload has
//! succeeded, and its presence is what marks a backup valid. Field names
//! are part of the on-store contract and must not change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Properties of one file captured in a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFileDescription {
    /// Reserved for block-level delta mode; never produced by this
    /// implementation. Mutually exclusive with `is_skipped`.
    #[serde(rename = "IsIncremented")]
    pub is_incremented: bool,
    /// The file is absent from this backup's partitions and must be
    /// pulled from the predecessor during restore.
    #[serde(rename = "IsSkipped")]
    pub is_skipped: bool,
    #[serde(rename = "MTime")]
    pub mtime: DateTime<Utc>,
}

/// Map of relative path to file properties, sorted for stable JSON.
pub type FileList = BTreeMap<String, BackupFileDescription>;

/// The sentinel manifest for one backup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSentinelDto {
    #[serde(rename = "LSN")]
    pub lsn: Option<u64>,

    #[serde(rename = "DeltaFromLSN", skip_serializing_if = "Option::is_none")]
    pub increment_from_lsn: Option<u64>,
    #[serde(rename = "DeltaFrom", skip_serializing_if = "Option::is_none")]
    pub increment_from: Option<String>,
    #[serde(rename = "DeltaFullName", skip_serializing_if = "Option::is_none")]
    pub increment_full_name: Option<String>,
    #[serde(rename = "DeltaCount", skip_serializing_if = "Option::is_none")]
    pub increment_count: Option<u32>,

    #[serde(rename = "Files")]
    pub files: FileList,

    #[serde(rename = "PgVersion")]
    pub pg_version: i32,
    #[serde(rename = "FinishLSN", skip_serializing_if = "Option::is_none")]
    pub finish_lsn: Option<u64>,

    #[serde(rename = "UserData", skip_serializing_if = "Option::is_none")]
    pub user_data: Option<serde_json::Value>,
}

impl BackupSentinelDto {
    /// True when this sentinel describes a delta backup.
    ///
    /// Panics on a half-filled delta header: restoring from one would
    /// silently corrupt the destination, so the process aborts instead.
    pub fn is_incremental(&self) -> bool {
        if self.increment_from.is_some() {
            if self.increment_from_lsn.is_none()
                || self.increment_full_name.is_none()
                || self.increment_count.is_none()
            {
                panic!("inconsistent backup sentinel: delta header is partially filled");
            }
        } else if self.increment_from_lsn.is_some()
            || self.increment_full_name.is_some()
            || self.increment_count.is_some()
        {
            panic!("inconsistent backup sentinel: delta fields present without DeltaFrom");
        }
        self.increment_from.is_some()
    }

    /// Rejects manifests produced by a delta mode this implementation
    /// does not understand.
    pub fn check_supported(&self) -> crate::Result<()> {
        if let Some((path, _)) = self.files.iter().find(|(_, d)| d.is_incremented) {
            return Err(crate::BackupError::Corrupt(format!(
                "file '{path}' uses unsupported block-level increments"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn desc(skipped: bool) -> BackupFileDescription {
        BackupFileDescription {
            is_incremented: false,
            is_skipped: skipped,
            mtime: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn full_backup_is_not_incremental() {
        let dto = BackupSentinelDto {
            lsn: Some(0x2000028),
            ..Default::default()
        };
        assert!(!dto.is_incremental());
    }

    #[test]
    fn delta_backup_is_incremental() {
        let dto = BackupSentinelDto {
            lsn: Some(0x3000028),
            increment_from_lsn: Some(0x2000028),
            increment_from: Some("base_000000010000000000000002".into()),
            increment_full_name: Some("base_000000010000000000000002".into()),
            increment_count: Some(1),
            ..Default::default()
        };
        assert!(dto.is_incremental());
    }

    #[test]
    #[should_panic(expected = "inconsistent backup sentinel")]
    fn partial_delta_header_panics() {
        let dto = BackupSentinelDto {
            increment_from: Some("base_000000010000000000000002".into()),
            ..Default::default()
        };
        dto.is_incremental();
    }

    #[test]
    #[should_panic(expected = "inconsistent backup sentinel")]
    fn stray_delta_count_panics() {
        let dto = BackupSentinelDto {
            increment_count: Some(2),
            ..Default::default()
        };
        dto.is_incremental();
    }

    #[test]
    fn json_uses_contract_field_names() {
        let mut files = FileList::new();
        files.insert("base/1/2654".into(), desc(true));
        let dto = BackupSentinelDto {
            lsn: Some(40),
            increment_from_lsn: Some(20),
            increment_from: Some("prev".into()),
            increment_full_name: Some("prev".into()),
            increment_count: Some(1),
            files,
            pg_version: 150004,
            finish_lsn: Some(60),
            user_data: None,
        };
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["LSN"], 40);
        assert_eq!(json["DeltaFrom"], "prev");
        assert_eq!(json["DeltaFullName"], "prev");
        assert_eq!(json["DeltaCount"], 1);
        assert_eq!(json["Files"]["base/1/2654"]["IsSkipped"], true);
        assert_eq!(json["Files"]["base/1/2654"]["IsIncremented"], false);
        assert_eq!(json["PgVersion"], 150004);
        assert_eq!(json["FinishLSN"], 60);
        // Omitted optional fields must be absent, not null.
        assert!(json.get("UserData").is_none());
    }

    #[test]
    fn full_backup_omits_delta_fields() {
        let dto = BackupSentinelDto {
            lsn: Some(40),
            pg_version: 150004,
            finish_lsn: Some(60),
            ..Default::default()
        };
        let json = serde_json::to_value(&dto).unwrap();
        assert!(json.get("DeltaFrom").is_none());
        assert!(json.get("DeltaFromLSN").is_none());
        assert!(json.get("DeltaFullName").is_none());
        assert!(json.get("DeltaCount").is_none());
    }

    #[test]
    fn unknown_fields_are_tolerated_on_read() {
        let parsed: BackupSentinelDto = serde_json::from_str(
            r#"{"LSN": 40, "PgVersion": 90600, "Files": {}, "CompressedSize": 12345}"#,
        )
        .unwrap();
        assert_eq!(parsed.lsn, Some(40));
        assert_eq!(parsed.pg_version, 90600);
    }

    #[test]
    fn incremented_files_are_rejected() {
        let mut files = FileList::new();
        files.insert(
            "base/1/2654".into(),
            BackupFileDescription {
                is_incremented: true,
                is_skipped: false,
                mtime: Utc::now(),
            },
        );
        let dto = BackupSentinelDto {
            files,
            ..Default::default()
        };
        assert!(dto.check_supported().is_err());
    }
}
