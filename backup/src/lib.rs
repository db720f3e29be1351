//! Base backup and WAL archive pipeline.
//!
//! A backup is a set of size-bounded tar partitions plus a JSON sentinel
//! manifest; the sentinel's presence marks the backup complete and
//! restorable. WAL segments are archived one object per segment. Both
//! pipelines share the codec/crypter machinery and the storage facade.

pub mod bundle;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod delete;
pub mod lsn;
pub mod push;
pub mod queryrunner;
pub mod restore;
pub mod sentinel;
pub mod tarball;
pub mod wal;

use thiserror::Error;

/// Object-layout constants. The numeric suffix is the archive format
/// generation and is part of the on-store contract.
pub const BASE_BACKUP_PATH: &str = "basebackups_005";
pub const WAL_PATH: &str = "wal_005";
pub const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";

/// Fixed WAL segment size.
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Anything whose first four little-endian bytes decode below this is not
/// a WAL segment.
pub const WAL_MAGIC_FLOOR: u32 = 0xD061;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("no backups found")]
    NoBackups,

    #[error("backup '{0}' does not exist")]
    BackupNotFound(String),

    #[error("corrupt backup: {0}")]
    Corrupt(String),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("sentinel was not uploaded: {0}")]
    SentinelNotUploaded(String),

    #[error("one or more partition uploads failed; sentinel withheld")]
    UploadFailed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("archive error: {0}")]
    Archive(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;

pub use bundle::{Bundle, EXCLUDED_NAMES};
pub use catalog::BackupTime;
pub use codec::{Codec, Crypter, NoCrypter};
pub use config::Config;
pub use sentinel::{BackupFileDescription, BackupSentinelDto, FileList};
