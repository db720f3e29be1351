use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::warn;
use tokio_util::sync::CancellationToken;

use backup::config::{crypter_from_env, folder_from_env, Config};
use backup::queryrunner::PgQueryRunner;
use backup::{catalog, codec, delete, push, restore, wal};

#[derive(Parser, Debug)]
#[clap(
    name = "pgvault",
    about = "Continuous archiving and point-in-time recovery for PostgreSQL clusters",
    version
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream a base backup of the data directory into storage
    BackupPush {
        /// PostgreSQL data directory
        data_dir: PathBuf,
    },

    /// Fetch a backup (and its delta chain) into a directory
    BackupFetch {
        /// Destination directory
        target_dir: PathBuf,

        /// Backup name, or LATEST
        backup_name: String,
    },

    /// List finished backups
    BackupList,

    /// Archive one WAL segment
    WalPush {
        /// Path to the segment handed over by archive_command
        wal_path: PathBuf,

        /// Compare the uploaded object's ETag against a local checksum
        #[clap(long)]
        verify: bool,
    },

    /// Fetch one WAL segment for recovery
    WalFetch {
        /// Segment name
        wal_name: String,

        /// Destination path handed over by restore_command
        destination: PathBuf,
    },

    /// Download one WAL segment into the prefetch staging area
    WalPrefetch {
        /// Segment name
        wal_name: String,

        /// Destination path the segment will eventually be fetched to
        destination: PathBuf,
    },

    /// Clear old backups and WAL segments
    #[clap(subcommand)]
    Delete(DeleteCommands),
}

#[derive(Subcommand, Debug)]
enum DeleteCommands {
    /// Delete backups finished before a time (RFC3339) or a named backup
    Before {
        /// Cutoff: an RFC3339 timestamp or a backup name
        target: String,

        /// Print what would be deleted without deleting
        #[clap(long)]
        dry_run: bool,
    },

    /// Keep the newest N backups and delete the rest
    Retain {
        /// Number of backups to keep
        count: usize,

        /// Count full backups only; deltas between kept fulls survive
        #[clap(long)]
        full: bool,

        /// Print what would be deleted without deleting
        #[clap(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp(None)
        .format_level(true)
        .format_module_path(false)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(err) = run().await {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let folder = folder_from_env().await?;
    let config = Config::from_env()?;
    let crypter = crypter_from_env()?;

    match cli.command {
        Commands::BackupPush { data_dir } => {
            let cancel = CancellationToken::new();
            let signal_token = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("cancellation requested, withholding sentinel");
                    signal_token.cancel();
                }
            });

            let mut db = PgQueryRunner::connect()
                .await
                .context("failed to connect to the database")?;
            let name = push::backup_push(
                &folder,
                &mut db,
                &data_dir,
                &config,
                codec::default_codec(),
                crypter,
                &cancel,
            )
            .await?;
            println!("{name}");
        }

        Commands::BackupFetch {
            target_dir,
            backup_name,
        } => {
            restore::backup_fetch(
                &folder,
                &backup_name,
                &target_dir,
                config.download_concurrency,
                crypter,
            )
            .await?;
            println!("backup extraction complete");
        }

        Commands::BackupList => {
            let backups = catalog::list_backups(&folder).await?;
            println!(
                "{:<56} {:<26} {}",
                "name", "last_modified", "wal_segment_backup_start"
            );
            for backup in backups {
                println!(
                    "{:<56} {:<26} {}",
                    backup.name,
                    backup.last_modified.to_rfc3339(),
                    backup.wal_file_name
                );
            }
        }

        Commands::WalPush { wal_path, verify } => {
            wal::wal_push(&folder, &wal_path, &config, crypter, verify).await?;
        }

        Commands::WalFetch {
            wal_name,
            destination,
        } => {
            wal::wal_fetch(
                &folder,
                &wal_name,
                &destination,
                config.download_concurrency,
                crypter,
                true,
            )
            .await?;
        }

        Commands::WalPrefetch {
            wal_name,
            destination,
        } => {
            wal::wal_prefetch(&folder, &wal_name, &destination, crypter).await?;
        }

        Commands::Delete(delete_command) => {
            let (target, dry_run) = match delete_command {
                DeleteCommands::Before { target, dry_run } => {
                    (parse_before_target(&target), dry_run)
                }
                DeleteCommands::Retain {
                    count,
                    full,
                    dry_run,
                } => (delete::DeleteTarget::Retain { count, full }, dry_run),
            };
            delete::handle_delete(&folder, target, dry_run).await?;
        }
    }
    Ok(())
}

/// A `delete before` cutoff is a timestamp when it parses as one, and a
/// backup name otherwise.
fn parse_before_target(raw: &str) -> delete::DeleteTarget {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(time) => delete::DeleteTarget::BeforeTime(time.with_timezone(&Utc)),
        Err(_) => delete::DeleteTarget::BeforeName(raw.to_string()),
    }
}
