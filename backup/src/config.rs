//! Environment-driven configuration.

use std::sync::Arc;

use crate::codec::{Crypter, NoCrypter};
use crate::{BackupError, Result};
use storage::StorageFolder;

/// Which backup a new delta builds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaOrigin {
    /// Stack on the latest backup, whatever kind it is.
    #[default]
    Latest,
    /// Always rebase onto the latest chain's full base.
    LatestFull,
}

/// Knobs read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Parallel upload streams for WAL archiving.
    pub upload_concurrency: usize,
    /// Number of tar partition writers prepared in the pool.
    pub upload_disk_concurrency: usize,
    /// High-water mark of closed, in-flight partition uploads.
    pub max_upload_queue: usize,
    /// Parallel partition downloads during restore and WAL prefetch width.
    pub download_concurrency: usize,
    /// Minimum size of a non-final tar partition, in bytes.
    pub tar_size_threshold: u64,
    /// Maximum delta chain length; zero disables deltas.
    pub delta_max_steps: u32,
    pub delta_origin: DeltaOrigin,
    /// Storage class applied to uploaded objects.
    pub storage_class: Option<String>,
    /// Opaque JSON recorded verbatim in each sentinel.
    pub sentinel_user_data: Option<serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            upload_concurrency: 10,
            upload_disk_concurrency: 1,
            max_upload_queue: 2,
            download_concurrency: 10,
            tar_size_threshold: 1_000_000_000,
            delta_max_steps: 0,
            delta_origin: DeltaOrigin::Latest,
            storage_class: None,
            sentinel_user_data: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Some(n) = parse_env("WALG_UPLOAD_CONCURRENCY")? {
            config.upload_concurrency = n;
        }
        if let Some(n) = parse_env("WALG_UPLOAD_DISK_CONCURRENCY")? {
            config.upload_disk_concurrency = n;
        }
        if let Some(n) = parse_env("WALG_UPLOAD_QUEUE")? {
            config.max_upload_queue = n;
        }
        if let Some(n) = parse_env("WALG_DOWNLOAD_CONCURRENCY")? {
            config.download_concurrency = n;
        }
        if let Some(n) = parse_env("WALG_TAR_SIZE_THRESHOLD")? {
            config.tar_size_threshold = n;
        }
        if let Some(n) = parse_env("WALG_DELTA_MAX_STEPS")? {
            config.delta_max_steps = n;
        }
        if let Ok(origin) = std::env::var("WALG_DELTA_ORIGIN") {
            config.delta_origin = match origin.as_str() {
                "LATEST" => DeltaOrigin::Latest,
                "LATEST_FULL" => DeltaOrigin::LatestFull,
                other => {
                    return Err(BackupError::ConfigInvalid(format!(
                        "unknown WALG_DELTA_ORIGIN '{other}'"
                    )))
                }
            };
        }
        config.storage_class = std::env::var("WALG_S3_STORAGE_CLASS").ok();
        if let Ok(raw) = std::env::var("WALG_SENTINEL_USER_DATA") {
            let value = serde_json::from_str(&raw).map_err(|e| {
                BackupError::ConfigInvalid(format!("WALG_SENTINEL_USER_DATA is not valid JSON: {e}"))
            })?;
            config.sentinel_user_data = Some(value);
        }
        if config.upload_disk_concurrency == 0 || config.upload_concurrency == 0 {
            return Err(BackupError::ConfigInvalid(
                "concurrency settings must be positive".into(),
            ));
        }
        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| BackupError::ConfigInvalid(format!("failed to parse {name} '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Resolves the archive location from the environment and connects the
/// storage provider behind it.
pub async fn folder_from_env() -> Result<StorageFolder> {
    let url = std::env::var("WALG_S3_PREFIX")
        .or_else(|_| std::env::var("WALE_S3_PREFIX"))
        .or_else(|_| std::env::var("WALG_FILE_PREFIX").map(|p| {
            if p.contains("://") {
                p
            } else {
                format!("file://{p}")
            }
        }))
        .map_err(|_| {
            BackupError::ConfigInvalid(
                "no storage prefix configured; set WALG_S3_PREFIX or WALG_FILE_PREFIX".into(),
            )
        })?;
    Ok(storage::folder_from_url(&url).await?)
}

/// Returns the configured crypter.
///
/// The OpenPGP implementation lives outside this binary; configuring a key
/// without one linked in is an error rather than a silently unencrypted
/// backup.
pub fn crypter_from_env() -> Result<Arc<dyn Crypter>> {
    if std::env::var("WALG_GPG_KEY_ID").is_ok() {
        return Err(BackupError::ConfigInvalid(
            "WALG_GPG_KEY_ID is set but this build carries no OpenPGP crypter".into(),
        ));
    }
    Ok(Arc::new(NoCrypter))
}
