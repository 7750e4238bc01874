use super::*;
use crate::sync::probe::md5_hex;
use crate::testutil::{FakeRemote, rfc3339};
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

/// Writes a local file and tracks it as the last synchronized revision.
async fn track_synced(engine: &Arc<SyncEngine>, root: &Path, relative: &str, bytes: &[u8], id: &str) {
    write_local(root, relative, bytes).await;
    let current = probe_file(&root.join(relative)).await.unwrap();
    let mut store = engine.store.lock().await;
    store.track_file(
        relative,
        TrackedFile {
            remote_id: id.into(),
            modified: current.modified,
            size: current.size,
            checksum: current.checksum,
        },
    );
}

async fn wait_for<F>(mut condition: F)
where
    F: AsyncFnMut() -> bool,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if condition().await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not met within timeout");
}

#[tokio::test]
async fn poll_downloads_unseen_remote_files() {
    let remote = Arc::new(FakeRemote::new());
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");
    remote.add_folder("d1", "Docs", None);
    remote.add_file("f2", "b.txt", Some("d1"), b"bravo", "2024-01-01T00:00:00Z");

    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    let changes = engine.poll_remote_once().await.unwrap();

    assert_eq!(changes, 2);
    assert_eq!(
        tokio::fs::read(dir.path().join("Docs/b.txt")).await.unwrap(),
        b"bravo"
    );
}

#[tokio::test]
async fn poll_updates_local_when_remote_is_newer_and_local_untouched() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    track_synced(&engine, dir.path(), "a.txt", b"old bytes", "f1").await;
    remote.add_file("f1", "a.txt", None, b"old bytes", "2024-01-01T00:00:00Z");

    // A quiet cycle first, then the remote copy is edited.
    assert_eq!(engine.poll_remote_once().await.unwrap(), 0);
    remote.set_file("f1", b"new bytes", &rfc3339(now_unix() + 100));

    let changes = engine.poll_remote_once().await.unwrap();
    assert_eq!(changes, 1);
    assert_eq!(
        tokio::fs::read(dir.path().join("a.txt")).await.unwrap(),
        b"new bytes"
    );
    let mut store = engine.store.lock().await;
    let tracked = store.get_tracked_file("a.txt").await.unwrap();
    assert_eq!(tracked.checksum, md5_hex(b"new bytes"));
}

#[tokio::test]
async fn poll_raises_a_conflict_when_both_sides_changed() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    write_local(dir.path(), "a.txt", b"local edit").await;
    {
        let mut store = engine.store.lock().await;
        store.track_file(
            "a.txt",
            TrackedFile {
                remote_id: "f1".into(),
                modified: now_unix() - 1000,
                size: 8,
                checksum: "0123456789abcdef0123456789abcdef".into(),
            },
        );
    }
    remote.add_file("f1", "a.txt", None, b"remote edit", &rfc3339(now_unix() + 100));

    let changes = engine.poll_remote_once().await.unwrap();
    assert_eq!(changes, 1);
    // Keep-both left the remote version at the canonical path and the local
    // version under a conflict name.
    assert_eq!(
        tokio::fs::read(dir.path().join("a.txt")).await.unwrap(),
        b"remote edit"
    );
    let renamed = remote
        .bytes_at_path(
            &engine
                .store
                .lock()
                .await
                .get_all_tracked_files()
                .await
                .into_iter()
                .find(|path| path.contains("(conflict"))
                .expect("conflict copy tracked"),
        )
        .expect("conflict copy uploaded");
    assert_eq!(renamed, b"local edit");
}

#[tokio::test]
async fn poll_restores_a_missing_local_copy() {
    let remote = Arc::new(FakeRemote::new());
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
                checksum: md5_hex(b"alpha"),
            },
        );
    }
    remote.add_file("f1", "a.txt", None, b"alpha", &rfc3339(now_unix() + 100));

    let changes = engine.poll_remote_once().await.unwrap();
    assert_eq!(changes, 1);
    assert_eq!(
        tokio::fs::read(dir.path().join("a.txt")).await.unwrap(),
        b"alpha"
    );
}

#[tokio::test]
async fn poll_removes_local_copy_when_remote_listing_drops_a_tracked_path() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    track_synced(&engine, dir.path(), "a.txt", b"alpha", "f1").await;
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");
    assert_eq!(engine.poll_remote_once().await.unwrap(), 0);

    remote.remove("f1");
    let changes = engine.poll_remote_once().await.unwrap();
    assert_eq!(changes, 1);
    assert!(!dir.path().join("a.txt").exists());
    let mut store = engine.store.lock().await;
    assert!(store.get_tracked_file("a.txt").await.is_none());
}

#[tokio::test]
async fn poll_leaves_a_missing_local_copy_alone_when_remote_is_unchanged() {
    // Deliberate asymmetry with the remote-newer case: without new remote
    // evidence the poll does not resurrect the file. The explicit deletion
    // signal is the watcher's delete event; full reconciliation restores it
    // otherwise.
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    track_synced(&engine, dir.path(), "a.txt", b"alpha", "f1").await;
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");
    tokio::fs::remove_file(dir.path().join("a.txt")).await.unwrap();

    let changes = engine.poll_remote_once().await.unwrap();
    assert_eq!(changes, 0);
    assert!(!dir.path().join("a.txt").exists());

    // The next full pass, with the remote copy still listed, restores it.
    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.downloaded, 1);
    assert_eq!(
        tokio::fs::read(dir.path().join("a.txt")).await.unwrap(),
        b"alpha"
    );
}

#[tokio::test]
async fn quiet_poll_cycle_applies_nothing() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    track_synced(&engine, dir.path(), "a.txt", b"alpha", "f1").await;
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");

    let changes = engine.poll_remote_once().await.unwrap();
    assert_eq!(changes, 0);
    assert_eq!(remote.transfer_count(), 0);
}

#[tokio::test]
async fn poll_surfaces_auth_failures_without_terminating_monitoring() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);

    remote.fail_next(
        "list",
        drivesync_core::RemoteError::Auth {
            reason: "invalid_token".into(),
        },
    );
    let err = engine.poll_remote_once().await.unwrap_err();
    assert!(err.is_auth());

    // The next cycle works again once credentials are refreshed upstream.
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");
    assert_eq!(engine.poll_remote_once().await.unwrap(), 1);
}

#[tokio::test]
async fn watcher_add_event_uploads_and_tracks() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    engine.start().await.unwrap();

    write_local(dir.path(), "Docs/new.txt", b"fresh").await;
    engine.enqueue_local_event(WatcherEvent {
        kind: WatcherEventKind::Add,
        path: "Docs/new.txt".into(),
    });

    wait_for(async || remote.bytes_at_path("Docs/new.txt").is_some()).await;
    wait_for(async || {
        engine
            .store
            .lock()
            .await
            .get_tracked_file("Docs/new.txt")
            .await
            .is_some()
    })
    .await;
    engine.stop().await;
}

#[tokio::test]
async fn watcher_change_event_updates_in_place_only_when_content_moved() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    engine.start().await.unwrap();
    track_synced(&engine, dir.path(), "a.txt", b"alpha", "f1").await;
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");

    // Same content: no remote call at all.
    engine.enqueue_local_event(WatcherEvent {
        kind: WatcherEventKind::Change,
        path: "a.txt".into(),
    });
    wait_for(async || engine.status_snapshot().await.active_workers == 0).await;
    assert_eq!(remote.update_count(), 0);

    // Real change: one in-place update.
    write_local(dir.path(), "a.txt", b"alpha v2").await;
    engine.enqueue_local_event(WatcherEvent {
        kind: WatcherEventKind::Change,
        path: "a.txt".into(),
    });
    wait_for(async || remote.update_count() == 1).await;
    wait_for(async || remote.file_bytes("f1").as_deref() == Some(b"alpha v2".as_slice())).await;
    engine.stop().await;
}

#[tokio::test]
async fn watcher_delete_event_deletes_remote_and_untracks() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    engine.start().await.unwrap();
    track_synced(&engine, dir.path(), "a.txt", b"alpha", "f1").await;
    remote.add_file("f1", "a.txt", None, b"alpha", "2024-01-01T00:00:00Z");
    tokio::fs::remove_file(dir.path().join("a.txt")).await.unwrap();

    engine.enqueue_local_event(WatcherEvent {
        kind: WatcherEventKind::Delete,
        path: "a.txt".into(),
    });

    wait_for(async || remote.file_bytes("f1").is_none()).await;
    wait_for(async || {
        engine
            .store
            .lock()
            .await
            .get_tracked_file("a.txt")
            .await
            .is_none()
    })
    .await;
    engine.stop().await;
}

#[tokio::test]
async fn deleting_an_already_deleted_remote_file_is_success() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    engine.start().await.unwrap();
    {
        let mut store = engine.store.lock().await;
        store.track_file(
            "ghost.txt",
            TrackedFile {
                remote_id: "never-existed".into(),
                modified: 1_700_000_000,
                size: 1,
                checksum: "00000000000000000000000000000000".into(),
            },
        );
    }

    engine.enqueue_local_event(WatcherEvent {
        kind: WatcherEventKind::Delete,
        path: "ghost.txt".into(),
    });

    wait_for(async || {
        engine
            .store
            .lock()
            .await
            .get_tracked_file("ghost.txt")
            .await
            .is_none()
    })
    .await;
    engine.stop().await;
}

#[tokio::test]
async fn stop_clears_the_queue_and_rejects_new_events() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    engine.start().await.unwrap();

    engine.stop().await;
    assert!(!engine.is_active());

    engine.enqueue_local_event(WatcherEvent {
        kind: WatcherEventKind::Add,
        path: "late.txt".into(),
    });
    let snapshot = engine.status_snapshot().await;
    assert_eq!(snapshot.queued, 0);
    assert_eq!(snapshot.active_workers, 0);
    assert!(!snapshot.active);
}

#[tokio::test]
async fn runtime_settings_are_clamped_and_applied() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);

    assert_eq!(engine.set_concurrency(99), 10);
    assert_eq!(engine.set_concurrency(0), 1);
    assert_eq!(engine.set_concurrency(4), 4);
    assert_eq!(engine.status_snapshot().await.concurrency, 4);

    assert_eq!(engine.policy(), ConflictPolicy::KeepBoth);
    engine.set_policy(ConflictPolicy::Ask);
    assert_eq!(engine.policy(), ConflictPolicy::Ask);
}
