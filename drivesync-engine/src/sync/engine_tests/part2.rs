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

/// Seeds the canonical divergence: a stale tracked revision, fresh local
/// bytes, and fresh remote bytes that all differ from each other.
async fn seed_conflict(remote: &Arc<FakeRemote>, engine: &Arc<SyncEngine>, root: &Path) {
    remote.add_folder("d1", "Docs", None);
    remote.add_file(
        "f1",
        "notes.txt",
        Some("d1"),
        b"remote edit",
        &rfc3339(now_unix() + 100),
    );
    write_local(root, "Docs/notes.txt", b"local edit").await;
    let mut store = engine.store.lock().await;
    store.track_file(
        "Docs/notes.txt",
        TrackedFile {
            remote_id: "f1".into(),
            modified: now_unix() - 1000,
            size: 8,
            checksum: "0123456789abcdef0123456789abcdef".into(),
        },
    );
}

#[tokio::test]
async fn keep_both_preserves_both_versions_everywhere() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    seed_conflict(&remote, &engine, dir.path()).await;

    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.conflicts, 1);

    // Canonical path now carries the remote version.
    assert_eq!(
        tokio::fs::read(dir.path().join("Docs/notes.txt"))
            .await
            .unwrap(),
        b"remote edit"
    );

    // The local version survived under a conflict name, locally and remotely.
    let mut entries = tokio::fs::read_dir(dir.path().join("Docs")).await.unwrap();
    let mut conflict_name = None;
    while let Some(entry) = entries.next_entry().await.unwrap() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains("(conflict") {
            conflict_name = Some(name);
        }
    }
    let conflict_name = conflict_name.expect("renamed local version should exist");
    assert!(conflict_name.starts_with("notes (conflict "));
    assert!(conflict_name.ends_with(".txt"));
    assert_eq!(
        remote
            .bytes_at_path(&format!("Docs/{conflict_name}"))
            .unwrap(),
        b"local edit"
    );

    let mut store = engine.store.lock().await;
    assert!(store.get_tracked_file("Docs/notes.txt").await.is_some());
    assert!(
        store
            .get_tracked_file(&format!("Docs/{conflict_name}"))
            .await
            .is_some()
    );
}

#[tokio::test]
async fn local_wins_overwrites_the_remote_copy() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::LocalWins);
    seed_conflict(&remote, &engine, dir.path()).await;

    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.conflicts, 1);
    assert_eq!(remote.update_count(), 1);
    assert_eq!(remote.file_bytes("f1").unwrap(), b"local edit");
    assert_eq!(
        tokio::fs::read(dir.path().join("Docs/notes.txt"))
            .await
            .unwrap(),
        b"local edit"
    );

    let mut store = engine.store.lock().await;
    let tracked = store.get_tracked_file("Docs/notes.txt").await.unwrap();
    assert_eq!(tracked.checksum, md5_hex(b"local edit"));
}

#[tokio::test]
async fn remote_wins_overwrites_the_local_copy() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::RemoteWins);
    seed_conflict(&remote, &engine, dir.path()).await;

    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.conflicts, 1);
    assert_eq!(remote.update_count(), 0);
    assert_eq!(
        tokio::fs::read(dir.path().join("Docs/notes.txt"))
            .await
            .unwrap(),
        b"remote edit"
    );

    let mut store = engine.store.lock().await;
    let tracked = store.get_tracked_file("Docs/notes.txt").await.unwrap();
    assert_eq!(tracked.checksum, md5_hex(b"remote edit"));
}

#[tokio::test]
async fn identical_content_on_both_sides_is_restamped_not_conflicted() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    write_local(dir.path(), "a.txt", b"same bytes").await;
    let remote_stamp = now_unix() + 100;
    remote.add_file("f1", "a.txt", None, b"same bytes", &rfc3339(remote_stamp));

    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    {
        let mut store = engine.store.lock().await;
        store.track_file(
            "a.txt",
            TrackedFile {
                remote_id: "f1".into(),
                modified: now_unix() - 1000,
                size: 10,
                checksum: md5_hex(b"same bytes"),
            },
        );
    }

    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.conflicts, 0);
    assert_eq!(stats.downloaded, 0);
    assert_eq!(stats.uploaded, 0);
    assert_eq!(remote.transfer_count(), 0);

    let mut store = engine.store.lock().await;
    let tracked = store.get_tracked_file("a.txt").await.unwrap();
    assert_eq!(tracked.modified, remote_stamp);
    assert_eq!(tracked.checksum, md5_hex(b"same bytes"));
}

#[tokio::test]
async fn ask_policy_applies_the_delivered_decision() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::Ask);
    seed_conflict(&remote, &engine, dir.path()).await;

    let resolver = Arc::clone(&engine);
    tokio::spawn(async move {
        loop {
            if resolver.resolve_conflict("Docs/notes.txt", AskDecision::Remote) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    });

    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.conflicts, 1);
    assert_eq!(
        tokio::fs::read(dir.path().join("Docs/notes.txt"))
            .await
            .unwrap(),
        b"remote edit"
    );
    assert!(engine.pending_conflicts().is_empty());
}

#[tokio::test]
async fn ask_skip_leaves_both_sides_untouched_and_snoozes_the_path() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    let engine = make_engine(&remote, dir.path(), ConflictPolicy::Ask);
    seed_conflict(&remote, &engine, dir.path()).await;

    let resolver = Arc::clone(&engine);
    tokio::spawn(async move {
        loop {
            if resolver.resolve_conflict("Docs/notes.txt", AskDecision::Skip) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    });

    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.conflicts, 1);
    assert_eq!(remote.transfer_count(), 0);
    assert_eq!(
        tokio::fs::read(dir.path().join("Docs/notes.txt"))
            .await
            .unwrap(),
        b"local edit"
    );

    // The next pass still flags the path but raises no new ask: with the
    // snooze in place the pass completes without any resolver running.
    let stats = engine.full_sync().await.unwrap();
    assert_eq!(stats.conflicts, 1);
    assert!(engine.pending_conflicts().is_empty());
}

#[tokio::test]
async fn untracked_copies_diverging_beyond_the_window_conflict() {
    let remote = Arc::new(FakeRemote::new());
    let dir = tempdir().unwrap();
    write_local(dir.path(), "a.txt", b"local edit").await;
    remote.add_file("f1", "a.txt", None, b"remote edit", "2024-01-01T00:00:00Z");

    let engine = make_engine(&remote, dir.path(), ConflictPolicy::KeepBoth);
    let stats = engine.full_sync().await.unwrap();

    assert_eq!(stats.conflicts, 1);
    assert_eq!(
        tokio::fs::read(dir.path().join("a.txt")).await.unwrap(),
        b"remote edit"
    );
}
