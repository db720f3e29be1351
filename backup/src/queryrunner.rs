//! The database side of a base backup: start/stop backup calls and
//! timeline-change detection.

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio_postgres::NoTls;

use crate::lsn::{parse_lsn, segment_timeline};
use crate::Result;

/// What the database reports when a backup starts.
pub struct BackupStart {
    /// `base_<walseg>`, derived from the start LSN's segment.
    pub backup_name: String,
    pub lsn: u64,
    pub pg_version: i32,
    pub timeline: u32,
}

/// What the database returns at backup stop.
pub struct BackupStop {
    pub backup_label: String,
    pub tablespace_map: String,
    pub finish_lsn: u64,
}

/// Seam between the push pipeline and the database, so tests can drive a
/// backup without a running server.
#[async_trait]
pub trait BackupDatabase: Send {
    async fn start_backup(&mut self, label: &str) -> Result<BackupStart>;

    async fn stop_backup(&mut self) -> Result<BackupStop>;

    /// True when the cluster's timeline diverged from `since` during the
    /// backup, which invalidates the run.
    async fn timeline_changed(&mut self, since: u32) -> Result<bool>;
}

/// Runs backup control queries over a live connection.
pub struct PgQueryRunner {
    client: tokio_postgres::Client,
    version: i32,
}

impl PgQueryRunner {
    /// Connects using the usual libpq environment variables.
    pub async fn connect() -> Result<Self> {
        let conn_string = connection_string_from_env();
        let (client, connection) = tokio_postgres::connect(&conn_string, NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!("connection error: {err}");
            }
        });

        let row = client.query_one("SHOW server_version_num", &[]).await?;
        let version_text: String = row.get(0);
        let version = version_text.trim().parse().map_err(|_| {
            crate::BackupError::Archive(format!("unparseable server version '{version_text}'"))
        })?;
        debug!("server version {version}");
        Ok(PgQueryRunner { client, version })
    }

    pub fn version(&self) -> i32 {
        self.version
    }
}

#[async_trait]
impl BackupDatabase for PgQueryRunner {
    async fn start_backup(&mut self, label: &str) -> Result<BackupStart> {
        let query = if self.version >= 150000 {
            "SELECT lsn::text, pg_walfile_name(lsn) FROM pg_backup_start($1, true) AS t(lsn)"
        } else {
            "SELECT lsn::text, pg_walfile_name(lsn) FROM pg_start_backup($1, true, false) AS t(lsn)"
        };
        let row = self.client.query_one(query, &[&label]).await?;
        let lsn_text: String = row.get(0);
        let wal_file_name: String = row.get(1);
        let lsn = parse_lsn(&lsn_text)?;
        let timeline = segment_timeline(&wal_file_name)?;
        Ok(BackupStart {
            backup_name: format!("base_{wal_file_name}"),
            lsn,
            pg_version: self.version,
            timeline,
        })
    }

    async fn stop_backup(&mut self) -> Result<BackupStop> {
        let query = if self.version >= 150000 {
            "SELECT lsn::text, labelfile, spcmapfile FROM pg_backup_stop(false)"
        } else {
            "SELECT lsn::text, labelfile, spcmapfile FROM pg_stop_backup(false)"
        };
        let row = self.client.query_one(query, &[]).await?;
        let lsn_text: String = row.get(0);
        let backup_label: String = row.get(1);
        let tablespace_map: Option<String> = row.get(2);
        Ok(BackupStop {
            backup_label,
            tablespace_map: tablespace_map.unwrap_or_default(),
            finish_lsn: parse_lsn(&lsn_text)?,
        })
    }

    async fn timeline_changed(&mut self, since: u32) -> Result<bool> {
        let row = self
            .client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
            .await?;
        let current: i32 = row.get(0);
        if current as u32 != since {
            warn!("timeline changed during backup: {since} -> {current}");
            return Ok(true);
        }
        Ok(false)
    }
}

fn connection_string_from_env() -> String {
    let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
    let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
    let user = std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string());
    let database = std::env::var("PGDATABASE").unwrap_or_else(|_| "postgres".to_string());
    let mut conn_string = format!("host={host} port={port} dbname={database} user={user}");
    if let Ok(password) = std::env::var("PGPASSWORD") {
        conn_string.push_str(&format!(" password={password}"));
    }
    conn_string
}
