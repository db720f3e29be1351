//! Delta backups: skip decisions, chain metadata and chain restore.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{test_config, test_folder, StubDatabase};
use tokio_util::sync::CancellationToken;

use backup::codec::{codec_for_key, default_codec, NoCrypter};
use backup::config::DeltaOrigin;
use backup::{catalog, push, restore};
use storage::StorageFolder;

async fn do_push(
    folder: &StorageFolder,
    lsn: u64,
    data_dir: &Path,
    config: &backup::Config,
) -> String {
    let mut db = StubDatabase::at_lsn(lsn);
    push::backup_push(
        folder,
        &mut db,
        data_dir,
        config,
        default_codec(),
        Arc::new(NoCrypter),
        &CancellationToken::new(),
    )
    .await
    .expect("push should succeed")
}

fn partition_contains(store_root: &Path, key: &str, entry_name: &str) -> bool {
    let path = store_root.join("pg").join(key);
    let file = std::fs::File::open(path).unwrap();
    let codec = codec_for_key(key).unwrap();
    let reader = codec.decompress(Box::new(file)).unwrap();
    let mut archive = tar::Archive::new(reader);
    archive
        .entries()
        .unwrap()
        .any(|e| e.unwrap().path().unwrap() == Path::new(entry_name))
}

fn seed_data_dir(data: &Path) {
    std::fs::write(data.join("a"), vec![b'a'; 1024]).unwrap();
    std::fs::write(data.join("b"), vec![b'b'; 1024]).unwrap();
    std::fs::write(data.join("pg_control"), vec![0xC7; 512]).unwrap();
}

#[tokio::test]
async fn unchanged_files_are_skipped_in_the_delta() {
    let store = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    seed_data_dir(data.path());

    let folder = test_folder(store.path());
    let full = do_push(&folder, 0x2000028, data.path(), &test_config(1 << 30, 0)).await;

    // Only b changes between the two backups.
    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(data.path().join("b"), vec![b'B'; 2048]).unwrap();

    let delta = do_push(&folder, 0x3000028, data.path(), &test_config(1 << 30, 3)).await;
    assert_eq!(
        delta,
        "base_000000010000000000000003_D_000000010000000000000002"
    );

    let sentinel = catalog::fetch_sentinel(&folder, &delta).await.unwrap();
    assert!(sentinel.is_incremental());
    assert_eq!(sentinel.increment_from.as_deref(), Some(full.as_str()));
    assert_eq!(sentinel.increment_full_name.as_deref(), Some(full.as_str()));
    assert_eq!(sentinel.increment_count, Some(2));
    assert_eq!(sentinel.increment_from_lsn, Some(0x2000028));
    assert!(sentinel.files["a"].is_skipped);
    assert!(!sentinel.files["a"].is_incremented);
    assert!(!sentinel.files["b"].is_skipped);

    // The skipped file must not travel in any delta partition.
    let keys = catalog::tar_partition_keys(&folder, &delta).await.unwrap();
    for key in keys {
        assert!(
            !partition_contains(store.path(), &key, "a"),
            "'a' must not appear in {key}"
        );
    }

    // Restoring the delta reconstructs both files through the chain.
    let dest = tempfile::tempdir().unwrap();
    restore::backup_fetch(&folder, &delta, dest.path(), 4, Arc::new(NoCrypter))
        .await
        .unwrap();
    assert_eq!(std::fs::read(dest.path().join("a")).unwrap(), vec![b'a'; 1024]);
    assert_eq!(std::fs::read(dest.path().join("b")).unwrap(), vec![b'B'; 2048]);
    assert!(!dest.path().join("increment_base").exists());
}

#[tokio::test]
async fn three_step_chain_restores_like_sequential_restores() {
    let store = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    seed_data_dir(data.path());
    std::fs::write(data.path().join("c"), vec![b'c'; 256]).unwrap();

    let folder = test_folder(store.path());
    do_push(&folder, 0x2000028, data.path(), &test_config(1 << 30, 0)).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(data.path().join("b"), b"b from delta one").unwrap();
    do_push(&folder, 0x3000028, data.path(), &test_config(1 << 30, 5)).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(data.path().join("a"), b"a from delta two").unwrap();
    std::fs::write(data.path().join("d"), b"d is new").unwrap();
    let head = do_push(&folder, 0x4000028, data.path(), &test_config(1 << 30, 5)).await;

    let sentinel = catalog::fetch_sentinel(&folder, &head).await.unwrap();
    assert_eq!(sentinel.increment_count, Some(3));
    assert_eq!(
        sentinel.increment_full_name.as_deref(),
        Some("base_000000010000000000000002")
    );
    // b and c are unchanged relative to delta one.
    assert!(sentinel.files["b"].is_skipped);
    assert!(sentinel.files["c"].is_skipped);
    assert!(!sentinel.files["a"].is_skipped);
    assert!(!sentinel.files["d"].is_skipped);

    let dest = tempfile::tempdir().unwrap();
    restore::backup_fetch(&folder, "LATEST", dest.path(), 4, Arc::new(NoCrypter))
        .await
        .unwrap();
    assert_eq!(std::fs::read(dest.path().join("a")).unwrap(), b"a from delta two");
    assert_eq!(std::fs::read(dest.path().join("b")).unwrap(), b"b from delta one");
    assert_eq!(std::fs::read(dest.path().join("c")).unwrap(), vec![b'c'; 256]);
    assert_eq!(std::fs::read(dest.path().join("d")).unwrap(), b"d is new");
    assert!(!dest.path().join("increment_base").exists());
}

#[tokio::test]
async fn latest_full_origin_rebases_onto_the_full_backup() {
    let store = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    seed_data_dir(data.path());

    let folder = test_folder(store.path());
    let full = do_push(&folder, 0x2000028, data.path(), &test_config(1 << 30, 0)).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(data.path().join("b"), b"changed once").unwrap();
    do_push(&folder, 0x3000028, data.path(), &test_config(1 << 30, 5)).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(data.path().join("b"), b"changed twice").unwrap();
    let mut config = test_config(1 << 30, 5);
    config.delta_origin = DeltaOrigin::LatestFull;
    let rebased = do_push(&folder, 0x4000028, data.path(), &config).await;

    let sentinel = catalog::fetch_sentinel(&folder, &rebased).await.unwrap();
    assert_eq!(sentinel.increment_from.as_deref(), Some(full.as_str()));
    assert_eq!(sentinel.increment_count, Some(2));
    // Diffed against the full backup, so the twice-changed b travels.
    assert!(!sentinel.files["b"].is_skipped);
    assert!(sentinel.files["a"].is_skipped);
}

#[tokio::test]
async fn chain_rolls_over_to_full_at_max_steps() {
    let store = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    seed_data_dir(data.path());

    let folder = test_folder(store.path());
    do_push(&folder, 0x2000028, data.path(), &test_config(1 << 30, 2)).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(data.path().join("b"), b"delta payload").unwrap();
    let second = do_push(&folder, 0x3000028, data.path(), &test_config(1 << 30, 2)).await;
    assert!(second.contains("_D_"), "second backup should be a delta");

    // The chain is at the cap; the next push must be full again.
    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(data.path().join("b"), b"over the cap").unwrap();
    let third = do_push(&folder, 0x4000028, data.path(), &test_config(1 << 30, 2)).await;
    assert!(!third.contains("_D_"), "third backup should roll over to full");
    let sentinel = catalog::fetch_sentinel(&folder, &third).await.unwrap();
    assert!(!sentinel.is_incremental());
}
