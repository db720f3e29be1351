//! Smoke tests for the pgvault CLI binary.
//! These tests check that the CLI parses arguments and responds to help/version commands.

use assert_cmd::Command;
use predicates::prelude::*;

/// Returns the path to the CLI binary (builds if needed)
fn cli_bin() -> Command {
    Command::cargo_bin("pgvault").expect("binary should build")
}

#[test]
fn prints_help() {
    let mut cmd = cli_bin();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn prints_version() {
    let mut cmd = cli_bin();
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("pgvault"));
}

#[test]
fn rejects_unknown_command() {
    let mut cmd = cli_bin();
    cmd.arg("not-a-real-command");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn backup_list_requires_a_storage_prefix() {
    let mut cmd = cli_bin();
    cmd.env_remove("WALG_S3_PREFIX")
        .env_remove("WALE_S3_PREFIX")
        .env_remove("WALG_FILE_PREFIX");
    cmd.arg("backup-list");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("storage prefix"));
}

#[test]
fn backup_list_works_against_a_file_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let mut cmd = cli_bin();
    cmd.env_remove("WALG_S3_PREFIX")
        .env_remove("WALE_S3_PREFIX")
        .env("WALG_FILE_PREFIX", dir.path().to_str().unwrap());
    cmd.arg("backup-list");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("name"));
}
