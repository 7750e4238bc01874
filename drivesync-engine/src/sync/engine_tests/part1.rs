use super::*;
use crate::testutil::{FakeRemote, init_logs, rfc3339};
use tempfile::tempdir;

fn make_engine(remote: &Arc<FakeRemote>, root: &Path, policy: ConflictPolicy) -> Arc<SyncEngine> {
    let mut config = EngineConfig::new(root);
    config.policy = policy;
    config.poll_interval = std::time::Duration::from_secs(3600);
    SyncEngine::new(
        Arc::clone(remote) as Arc<dyn RemoteClient>,
        config,
        StatusSink::disconnected(),
    )
}

async fn write_local(root: &Path, relative: &str, bytes: &[u8]) {
    let abs = root.join(relative);
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(abs, bytes).await.unwrap();
}

#[tokio::test]
async fn empty_local_root_downloads_every_remote_file() {
    init_logs();
    let remote = Arc::new(FakeRemote::new());
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");
    remote.add_folder("d1", "Docs", None);
    remote.add_file("f2", "b.txt", Some("d1"), b"bravo", "2024-01-01T00:00:00Z");
    remote.add_folder("d2", "Sub", Some("d1"));
    remote.add_file("f3", "c.txt", Some("d2"), b"charlie", "2024-01-01T00:00:00Z");

    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    let stats = engine.full_sync().await.unwrap();

    assert_eq!(stats.downloaded, 3);
    assert_eq!(stats.uploaded, 0);
    assert_eq!(stats.conflicts, 0);
    assert_eq!(stats.folders, 2);

    assert_eq!(
        tokio::fs::read(dir.path().join("a.txt")).await.unwrap(),
        b"alpha"
    );
    assert_eq!(
        tokio::fs::read(dir.path().join("Docs/Sub/c.txt"))
            .await
            .unwrap(),
        b"charlie"
    );

    let mut store = engine.store.lock().await;
    for path in ["a.txt", "Docs/b.txt", "Docs/Sub/c.txt"] {
        assert!(store.get_tracked_file(path).await.is_some(), "{path}");
    }
}

#[tokio::test]
async fn second_full_sync_transfers_nothing() {
    let remote = Arc::new(FakeRemote::new());
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");
    remote.add_folder("d1", "Docs", None);
    remote.add_file("f2", "b.txt", Some("d1"), b"bravo", "2024-01-01T00:00:00Z");

    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    engine.full_sync().await.unwrap();
    let transfers_after_first = remote.transfer_count();

    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.downloaded, 0);
    assert_eq!(stats.uploaded, 0);
    assert_eq!(stats.conflicts, 0);
    assert_eq!(stats.skipped, 2);
    assert_eq!(remote.transfer_count(), transfers_after_first);
}

#[tokio::test]
async fn local_only_files_upload_with_mirrored_ancestors() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    write_local(dir.path(), "a.txt", b"alpha").await;
    write_local(dir.path(), "Docs/Sub/c.txt", b"charlie").await;

    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    let stats = engine.full_sync().await.unwrap();

    assert_eq!(stats.uploaded, 2);
    assert_eq!(stats.downloaded, 0);
    assert_eq!(remote.folder_create_count(), 2);
    assert_eq!(remote.bytes_at_path("a.txt").unwrap(), b"alpha");
    assert_eq!(
        remote.bytes_at_path("Docs/Sub/c.txt").unwrap(),
        b"charlie"
    );

    let mut store = engine.store.lock().await;
    assert!(store.get_tracked_file("Docs/Sub/c.txt").await.is_some());
}

#[tokio::test]
async fn identical_untracked_local_copy_is_adopted_without_transfer() {
    let remote = Arc::new(FakeRemote::new());
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");

    let dir = tempdir().unwrap();
    write_local(dir.path(), "a.txt", b"alpha").await;

    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    let stats = engine.full_sync().await.unwrap();

    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.downloaded, 0);
    assert_eq!(stats.conflicts, 0);
    assert_eq!(remote.download_count(), 0);

    let mut store = engine.store.lock().await;
    let tracked = store.get_tracked_file("a.txt").await.unwrap();
    assert_eq!(tracked.remote_id, "f1");
}

#[tokio::test]
async fn differing_copies_with_close_timestamps_are_treated_as_same_file() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    write_local(dir.path(), "a.txt", b"local variant").await;
    // Different bytes, but the remote stamp is within the 5 s window of the
    // local mtime.
    remote.add_file("f1", "a.txt", None, b"remote variant", &rfc3339(now_unix()));

    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    let stats = engine.full_sync().await.unwrap();

    assert_eq!(stats.conflicts, 0);
    assert_eq!(stats.skipped, 1);
    assert_eq!(remote.transfer_count(), 0);
    assert_eq!(
        tokio::fs::read(dir.path().join("a.txt")).await.unwrap(),
        b"local variant"
    );
}

#[tokio::test]
async fn tracked_file_missing_locally_is_restored_from_remote() {
    let remote = Arc::new(FakeRemote::new());
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");

    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    {
        let mut store = engine.store.lock().await;
        store.track_file(
            "a.txt",
            TrackedFile {
                remote_id: "f1".into(),
                modified: 1_700_000_000,
                size: 5,
                checksum: "0123456789abcdef0123456789abcdef".into(),
            },
        );
    }

    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.downloaded, 1);
    assert_eq!(
        tokio::fs::read(dir.path().join("a.txt")).await.unwrap(),
        b"alpha"
    );
}

#[tokio::test]
async fn tracked_path_gone_remotely_is_not_reuploaded_by_full_sync() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    write_local(dir.path(), "a.txt", b"alpha").await;

    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    {
        let mut store = engine.store.lock().await;
        store.track_file(
            "a.txt",
            TrackedFile {
                remote_id: "gone".into(),
                modified: 1_700_000_000,
                size: 5,
                checksum: "0123456789abcdef0123456789abcdef".into(),
            },
        );
    }

    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.uploaded, 0);
    assert_eq!(remote.create_count(), 0);
    // Deletion propagation is the remote poll's job; the file stays.
    assert!(dir.path().join("a.txt").exists());
}

#[tokio::test(start_paused = true)]
async fn local_wins_policy_deletes_remote_files_that_never_made_it_local() {
    let remote = Arc::new(FakeRemote::new());
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");
    // Every download attempt fails, so the file never lands locally and the
    // local-authoritative pass removes the remote copy.
    for _ in 0..3 {
        remote.fail_next(
            "download",
            drivesync_core::RemoteError::Transient {
                reason: "boom".into(),
            },
        );
    }

    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::LocalWins);
    let stats = engine.full_sync().await.unwrap();

    assert_eq!(stats.downloaded, 0);
    assert_eq!(remote.delete_count(), 1);
    assert!(remote.bytes_at_path("a.txt").is_none());
    let mut store = engine.store.lock().await;
    assert!(store.get_tracked_file("a.txt").await.is_none());
}

#[tokio::test]
async fn auth_failure_during_listing_halts_the_pass() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_next(
        "list",
        drivesync_core::RemoteError::Auth {
            reason: "invalid_grant".into(),
        },
    );

    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    let err = engine.start().await.unwrap_err();
    assert!(err.is_auth());
    assert!(!engine.is_active());
}
