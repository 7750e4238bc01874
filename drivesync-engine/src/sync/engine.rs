use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use drivesync_core::{RemoteClient, RemoteError, RemoteItem, RemoteItemKind};
use log::{debug, info, warn};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;

use super::conflict::{
    self, AskDecision, AskError, ConflictCase, ConflictPolicy, Divergence, PendingDecisions,
    UntrackedOutcome,
};
use super::local_tree::scan_local_tree;
use super::local_watcher::{WatcherEvent, WatcherEventKind};
use super::paths::{PathError, local_path_for, split_segments};
use super::probe::{FileProbe, now_unix, probe_file};
use super::queue::{Operation, OperationKind, OperationQueue};
use super::remote_tree::scan_remote_tree;
use super::retry::with_retry;
use super::state_store::{FileStateStore, TrackedFile};
use crate::config::EngineConfig;
use crate::status::{StatusSink, SyncStats};

/// Remote items are processed in batches of this size with a state-store
/// checkpoint in between, bounding peak memory on very large trees.
const RECONCILE_BATCH_SIZE: usize = 50;

const PHASE_REMOTE: &str = "Syncing from remote";
const PHASE_LOCAL: &str = "Syncing to remote";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("timestamp parse error: {0}")]
    Time(#[from] time::error::Parse),
}

impl EngineError {
    pub fn is_auth(&self) -> bool {
        matches!(self, EngineError::Remote(err) if err.is_auth())
    }
}

/// Point-in-time view of the engine, for the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub active: bool,
    pub tracked_count: usize,
    pub last_sync: Option<i64>,
    pub queued: usize,
    pub active_workers: usize,
    pub concurrency: usize,
}

/// Bidirectional sync engine for one local root and one remote folder.
///
/// `start` runs a full reconciliation and then keeps the two sides
/// converging: watcher events drive the local→remote direction through a
/// bounded worker pool, a periodic remote poll drives remote→local. All
/// mutable state (active flag, queue, counters) lives on this struct; there
/// are no process-wide singletons, so `stop` tears everything down and a new
/// engine can be built afterwards.
pub struct SyncEngine {
    client: Arc<dyn RemoteClient>,
    store: Mutex<FileStateStore>,
    queue: OperationQueue,
    decisions: PendingDecisions,
    status: StatusSink,
    policy: StdMutex<ConflictPolicy>,
    active: AtomicBool,
    local_root: PathBuf,
    remote_root_id: Option<String>,
    poll_interval: std::time::Duration,
    /// Self-handle for spawning the poll loop and queue workers.
    this: Weak<SyncEngine>,
}

impl SyncEngine {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        config: EngineConfig,
        status: StatusSink,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            client,
            store: Mutex::new(FileStateStore::new(config.local_root.clone())),
            queue: OperationQueue::new(config.concurrency),
            decisions: PendingDecisions::new(config.ask_snooze),
            status,
            policy: StdMutex::new(config.policy),
            active: AtomicBool::new(false),
            local_root: config.local_root,
            remote_root_id: config.remote_root_id,
            poll_interval: config.poll_interval,
            this: this.clone(),
        })
    }

    /// Loads persisted state, runs the one-time full reconciliation, then
    /// spawns the periodic remote poll. Returns the initial pass's stats.
    /// Fails (and deactivates) only on an authentication failure or a broken
    /// local root; single-file errors are reported and skipped.
    pub async fn start(&self) -> Result<SyncStats, EngineError> {
        self.active.store(true, Ordering::SeqCst);
        {
            let mut store = self.store.lock().await;
            store.load().await;
        }

        let stats = match self.full_sync().await {
            Ok(stats) => stats,
            Err(err) => {
                self.active.store(false, Ordering::SeqCst);
                self.status.error(format!("Failed to start sync: {err}"));
                return Err(err);
            }
        };

        if let Some(engine) = self.this.upgrade() {
            tokio::spawn(async move {
                engine.run_poll_loop().await;
            });
        }
        self.status.success("Sync started");
        Ok(stats)
    }

    /// Clears the active flag, drops pending queue entries and conflict
    /// waiters, and flushes state. In-flight remote operations are not
    /// cancelled; they complete or fail on their own.
    pub async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.queue.clear();
        self.decisions.clear();
        let mut store = self.store.lock().await;
        store.save().await;
        self.status.info("Sync stopped");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn policy(&self) -> ConflictPolicy {
        *self.policy.lock().expect("policy lock")
    }

    pub fn set_policy(&self, policy: ConflictPolicy) {
        *self.policy.lock().expect("policy lock") = policy;
        self.status
            .success(format!("Conflict resolution set to {}", policy.as_str()));
    }

    /// Applies a new worker limit (clamped to 1..=10) and returns it.
    pub fn set_concurrency(&self, limit: usize) -> usize {
        let applied = self.queue.set_limit(limit);
        self.status
            .success(format!("Max concurrent operations set to {applied}"));
        applied
    }

    /// Delivers an external decision for a pending `ask` conflict. Returns
    /// `false` when nothing was waiting for that path.
    pub fn resolve_conflict(&self, path: &str, decision: AskDecision) -> bool {
        self.decisions.resolve(path, decision)
    }

    pub fn pending_conflicts(&self) -> Vec<String> {
        self.decisions.pending_paths()
    }

    pub async fn status_snapshot(&self) -> EngineStatus {
        let store = self.store.lock().await;
        EngineStatus {
            active: self.is_active(),
            tracked_count: store.tracked_count(),
            last_sync: store.last_sync(),
            queued: self.queue.len(),
            active_workers: self.queue.active(),
            concurrency: self.queue.limit(),
        }
    }

    // ------------------------------------------------------------------
    // Full reconciliation
    // ------------------------------------------------------------------

    /// Diffs both trees against tracked state and applies corrective
    /// transfers. Batched with a checkpoint every [`RECONCILE_BATCH_SIZE`]
    /// items; only authentication failures abort the pass.
    pub async fn full_sync(&self) -> Result<SyncStats, EngineError> {
        self.status.info("Fetching remote file listing...");
        let remote = scan_remote_tree(self.client.as_ref(), self.remote_root_id.as_deref()).await?;
        let local_paths = scan_local_tree(&self.local_root).await?;

        let mut store = self.store.lock().await;
        // Warm the full tracked view; per-item lookups stay cheap afterwards.
        let _ = store.get_all_tracked_files().await;

        let mut stats = SyncStats {
            folders: remote.counts.folders,
            ..SyncStats::default()
        };
        let total = remote.files.len() + local_paths.len();
        let mut processed = 0usize;
        self.status.info(format!(
            "Found {} remote files, {} local files ({} folders, {} virtual items skipped)",
            remote.files.len(),
            local_paths.len(),
            remote.counts.folders,
            remote.counts.virtual_items
        ));

        let remote_entries: Vec<(&String, &RemoteItem)> = remote.files.iter().collect();
        for batch in remote_entries.chunks(RECONCILE_BATCH_SIZE) {
            for &(path, item) in batch {
                processed += 1;
                self.status.progress(processed, total, PHASE_REMOTE, path);
                match self
                    .reconcile_remote_item(&mut store, path, item, &mut stats)
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_auth() => return Err(err),
                    Err(err) => {
                        warn!("full sync failed for {path}: {err}");
                        self.status.error(format!("Failed to sync {path}: {err}"));
                    }
                }
            }
            store.save().await;
        }

        for batch in local_paths.chunks(RECONCILE_BATCH_SIZE) {
            for path in batch {
                processed += 1;
                self.status.progress(processed, total, PHASE_LOCAL, path);
                if remote.files.contains_key(path) {
                    continue;
                }
                if store.get_tracked_file(path).await.is_some() {
                    // Tracked but gone remotely: deletion propagation belongs
                    // to the periodic poll, not this pass.
                    continue;
                }
                match self.upload_new_file(&mut store, path).await {
                    Ok(()) => {
                        stats.uploaded += 1;
                        self.status.success(format!("Uploaded: {path}"));
                    }
                    Err(err) if err.is_auth() => return Err(err),
                    Err(err) => {
                        warn!("upload failed for {path}: {err}");
                        self.status.error(format!("Failed to upload {path}: {err}"));
                    }
                }
            }
            store.save().await;
        }

        if self.policy() == ConflictPolicy::LocalWins {
            self.delete_remote_orphans(&mut store, &remote.files, &mut stats)
                .await?;
        }

        store.update_last_sync();
        store.save().await;

        self.status.send(
            crate::status::StatusUpdate::new(
                format!(
                    "Sync complete - Downloaded: {}, Uploaded: {}, Skipped: {}, Conflicts: {}",
                    stats.downloaded, stats.uploaded, stats.skipped, stats.conflicts
                ),
                crate::status::Severity::Success,
            )
            .with_stats(stats),
        );
        Ok(stats)
    }

    async fn reconcile_remote_item(
        &self,
        store: &mut FileStateStore,
        path: &str,
        item: &RemoteItem,
        stats: &mut SyncStats,
    ) -> Result<(), EngineError> {
        let abs = local_path_for(&self.local_root, path)?;
        let remote_modified = parse_modified(item.modified.as_deref())?.unwrap_or(0);

        if !tokio::fs::try_exists(&abs).await.unwrap_or(false) {
            // Covers both never-seen files and tracked files whose local
            // copy disappeared: the remote side is authoritative for
            // disappearance, so the content comes (back) down.
            self.download_and_track(store, path, item).await?;
            stats.downloaded += 1;
            self.status.success(format!("Downloaded: {path}"));
            return Ok(());
        }

        let local = probe_file(&abs).await?;
        let Some(tracked) = store.get_tracked_file(path).await else {
            match conflict::classify_untracked(&local, remote_modified, item.checksum.as_deref()) {
                UntrackedOutcome::Adopt => {
                    store.track_file(path, tracked_from(&item.id, &local));
                    stats.skipped += 1;
                    debug!("adopted existing local copy without transfer: {path}");
                }
                UntrackedOutcome::Conflict => {
                    stats.conflicts += 1;
                    self.handle_conflict(store, path, item, &local, remote_modified)
                        .await?;
                }
            }
            return Ok(());
        };

        match conflict::classify(&tracked, &local, remote_modified, item.checksum.as_deref()) {
            Divergence::Unchanged => {
                stats.skipped += 1;
            }
            Divergence::ClockSkewOnly => {
                restamp(store, path, &tracked, &local, remote_modified);
                stats.skipped += 1;
                debug!("clock-only change, tracked metadata re-stamped: {path}");
            }
            Divergence::RemoteNewer => {
                self.download_and_track(store, path, item).await?;
                stats.downloaded += 1;
                self.status.success(format!("Updated from remote: {path}"));
            }
            Divergence::LocalNewer => {
                self.update_remote_in_place(store, path, &item.id).await?;
                stats.uploaded += 1;
                self.status.success(format!("Updated remote copy: {path}"));
            }
            Divergence::Conflict => {
                stats.conflicts += 1;
                self.handle_conflict(store, path, item, &local, remote_modified)
                    .await?;
            }
        }
        Ok(())
    }

    /// The local-authoritative pass: every remote file still lacking a local
    /// counterpart is deleted remotely. Runs after the main pass, so a file
    /// that was just downloaded is its own counterpart and survives.
    async fn delete_remote_orphans(
        &self,
        store: &mut FileStateStore,
        remote_files: &std::collections::BTreeMap<String, RemoteItem>,
        stats: &mut SyncStats,
    ) -> Result<(), EngineError> {
        for (path, item) in remote_files {
            let abs = local_path_for(&self.local_root, path)?;
            if tokio::fs::try_exists(&abs).await.unwrap_or(false) {
                continue;
            }
            self.status
                .info(format!("Deleting remote copy (local authoritative): {path}"));
            match with_retry(&self.status, &format!("Delete {path}"), || {
                self.client.delete(&item.id)
            })
            .await
            {
                Ok(()) => {
                    store.untrack_file(path);
                    stats.uploaded += 1;
                }
                Err(err) if err.is_not_found() => {
                    store.untrack_file(path);
                }
                Err(err) if err.is_auth() => return Err(err.into()),
                Err(err) => {
                    self.status
                        .error(format!("Failed to delete remote copy of {path}: {err}"));
                }
            }
        }
        store.save().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Periodic remote poll
    // ------------------------------------------------------------------

    async fn run_poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately; the full sync
        // just ran, so skip it.
        ticker.tick().await;
        info!("remote poll started (every {:?})", self.poll_interval);

        loop {
            ticker.tick().await;
            if !self.is_active() {
                debug!("remote poll stopping: engine is no longer active");
                break;
            }
            match self.poll_remote_once().await {
                Ok(0) => debug!("remote poll: no changes"),
                Ok(applied) => self
                    .status
                    .success(format!("Remote poll: {applied} change(s) synced")),
                Err(err) if err.is_auth() => {
                    // Token refresh races are transient; keep monitoring and
                    // let the embedder swap credentials underneath us.
                    warn!("remote poll hit an authentication failure: {err}");
                    self.status
                        .error(format!("Authentication failed during remote poll: {err}"));
                }
                Err(err) => {
                    warn!("remote poll error: {err}");
                    self.status.error(format!("Remote poll error: {err}"));
                }
            }
        }
    }

    /// One incremental remote pass. Returns how many changes were applied;
    /// state is persisted only when that count is non-zero.
    pub async fn poll_remote_once(&self) -> Result<usize, EngineError> {
        let remote = scan_remote_tree(self.client.as_ref(), self.remote_root_id.as_deref()).await?;
        let mut store = self.store.lock().await;
        let tracked_paths = store.get_all_tracked_files().await;
        let mut changes = 0usize;

        for (path, item) in &remote.files {
            match self.poll_remote_item(&mut store, path, item).await {
                Ok(true) => changes += 1,
                Ok(false) => {}
                Err(err) if err.is_auth() => return Err(err),
                Err(err) => {
                    warn!("remote poll failed for {path}: {err}");
                    self.status.error(format!("Failed to sync {path}: {err}"));
                }
            }
        }

        for path in tracked_paths {
            if remote.files.contains_key(&path) {
                continue;
            }
            let abs = local_path_for(&self.local_root, &path)?;
            match tokio::fs::remove_file(&abs).await {
                Ok(()) => self.status.info(format!("File deleted from remote: {path}")),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    // Keep it tracked so the next cycle retries the removal.
                    self.status
                        .error(format!("Failed to remove local copy of {path}: {err}"));
                    continue;
                }
            }
            store.untrack_file(&path);
            changes += 1;
        }

        if changes > 0 {
            store.save().await;
        }
        Ok(changes)
    }

    async fn poll_remote_item(
        &self,
        store: &mut FileStateStore,
        path: &str,
        item: &RemoteItem,
    ) -> Result<bool, EngineError> {
        let Some(tracked) = store.get_tracked_file(path).await else {
            self.status.info(format!("New remote file: {path}"));
            self.download_and_track(store, path, item).await?;
            return Ok(true);
        };

        let remote_modified = parse_modified(item.modified.as_deref())?.unwrap_or(0);
        if remote_modified <= tracked.modified {
            return Ok(false);
        }

        let abs = local_path_for(&self.local_root, path)?;
        if !tokio::fs::try_exists(&abs).await.unwrap_or(false) {
            // A vanished local copy is treated as accidental loss, not an
            // intentional delete; the remote version is restored.
            self.status.info(format!("Restoring missing local file: {path}"));
            self.download_and_track(store, path, item).await?;
            return Ok(true);
        }

        let local = probe_file(&abs).await?;
        match conflict::classify(&tracked, &local, remote_modified, item.checksum.as_deref()) {
            Divergence::RemoteNewer => {
                self.status.info(format!("Updating from remote: {path}"));
                self.download_and_track(store, path, item).await?;
                Ok(true)
            }
            Divergence::Conflict => {
                self.handle_conflict(store, path, item, &local, remote_modified)
                    .await?;
                Ok(true)
            }
            Divergence::ClockSkewOnly => {
                restamp(store, path, &tracked, &local, remote_modified);
                Ok(true)
            }
            // Local-side changes reach the remote through the watcher queue.
            Divergence::LocalNewer | Divergence::Unchanged => Ok(false),
        }
    }

    // ------------------------------------------------------------------
    // Conflict resolution
    // ------------------------------------------------------------------

    async fn handle_conflict(
        &self,
        store: &mut FileStateStore,
        path: &str,
        item: &RemoteItem,
        local: &FileProbe,
        remote_modified: i64,
    ) -> Result<(), EngineError> {
        let case = ConflictCase {
            path: path.to_string(),
            local_modified: local.modified,
            remote_modified,
            local_size: local.size,
            remote_size: item.size.unwrap_or(0),
        };
        self.status.conflict(case);

        let resolution = match self.policy() {
            ConflictPolicy::LocalWins => AskDecision::Local,
            ConflictPolicy::RemoteWins => AskDecision::Remote,
            ConflictPolicy::KeepBoth => AskDecision::Both,
            ConflictPolicy::Ask => {
                let now = now_unix();
                if self.decisions.is_snoozed(path, now) {
                    self.status
                        .info(format!("Conflict for {path} left unresolved (snoozed)"));
                    return Ok(());
                }
                self.status
                    .info(format!("Waiting for conflict decision: {path}"));
                match self.decisions.ask(path, now).await {
                    Ok(decision) => decision,
                    Err(AskError::AskInFlight(_)) => {
                        self.status
                            .warning(format!("A conflict decision for {path} is already pending"));
                        return Ok(());
                    }
                    // The engine is stopping; leave the path untouched.
                    Err(AskError::Cancelled(_)) => return Ok(()),
                }
            }
        };

        match resolution {
            AskDecision::Local => {
                self.update_remote_in_place(store, path, &item.id).await?;
                self.status
                    .success(format!("Conflict resolved for {path}: kept local version"));
                Ok(())
            }
            AskDecision::Remote => {
                self.download_and_track(store, path, item).await?;
                self.status
                    .success(format!("Conflict resolved for {path}: kept remote version"));
                Ok(())
            }
            AskDecision::Both => self.resolve_keep_both(store, path, item, local).await,
            AskDecision::Skip => {
                self.status.info(format!("Skipped conflict: {path}"));
                Ok(())
            }
        }
    }

    /// Keep-both: the local file moves aside under a conflict name, the
    /// remote version lands at the canonical path, and the renamed copy is
    /// uploaded as an additional remote object. Both artifacts persist.
    async fn resolve_keep_both(
        &self,
        store: &mut FileStateStore,
        path: &str,
        item: &RemoteItem,
        local: &FileProbe,
    ) -> Result<(), EngineError> {
        let renamed = conflict::conflict_path(path, local.modified);
        let abs = local_path_for(&self.local_root, path)?;
        let renamed_abs = local_path_for(&self.local_root, &renamed)?;
        tokio::fs::rename(&abs, &renamed_abs).await?;
        self.status.info(format!("Saved local version as {renamed}"));

        self.download_and_track(store, path, item).await?;
        self.upload_new_file(store, &renamed).await?;
        self.status
            .success(format!("Conflict resolved for {path}: kept both versions"));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    /// Downloads a remote file to its local path (written via a `.partial`
    /// rename so a crash never leaves a torn file) and records the pairing.
    async fn download_and_track(
        &self,
        store: &mut FileStateStore,
        path: &str,
        item: &RemoteItem,
    ) -> Result<(), EngineError> {
        let bytes = with_retry(&self.status, &format!("Download {path}"), || {
            self.client.download(&item.id)
        })
        .await?;

        let abs = local_path_for(&self.local_root, path)?;
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&abs);
        tokio::fs::write(&partial, &bytes).await?;
        tokio::fs::rename(&partial, &abs).await?;

        let current = probe_file(&abs).await?;
        store.track_file(path, tracked_from(&item.id, &current));
        Ok(())
    }

    /// Uploads a local file as a new remote object, mirroring its folder
    /// ancestry, and records the pairing.
    async fn upload_new_file(
        &self,
        store: &mut FileStateStore,
        path: &str,
    ) -> Result<(), EngineError> {
        let (id, current) = self.push_new_file(path).await?;
        store.track_file(path, tracked_from(&id, &current));
        Ok(())
    }

    /// The store-free half of an upload, shared with the queue workers.
    async fn push_new_file(&self, path: &str) -> Result<(String, FileProbe), EngineError> {
        let abs = local_path_for(&self.local_root, path)?;
        let bytes = tokio::fs::read(&abs).await?;
        let parent = self.ensure_remote_ancestors(path).await?;
        let (_, name) = split_segments(path);
        let id = with_retry(&self.status, &format!("Upload {path}"), || {
            self.client.create_file(name, parent.as_deref(), &bytes)
        })
        .await?;
        let current = probe_file(&abs).await?;
        Ok((id, current))
    }

    /// Walks the folder segments of `path`, creating any remote folder that
    /// does not exist yet, and returns the id of the immediate parent.
    async fn ensure_remote_ancestors(&self, path: &str) -> Result<Option<String>, EngineError> {
        let (folders, _) = split_segments(path);
        let mut parent = self.remote_root_id.clone();
        for segment in folders {
            let children = with_retry(&self.status, &format!("List remote folder {segment}"), || {
                self.client.list(parent.as_deref())
            })
            .await?;
            match children
                .iter()
                .find(|child| child.kind == RemoteItemKind::Folder && child.name == segment)
            {
                Some(existing) => parent = Some(existing.id.clone()),
                None => {
                    let id =
                        with_retry(&self.status, &format!("Create remote folder {segment}"), || {
                            self.client.create_folder(segment, parent.as_deref())
                        })
                        .await?;
                    parent = Some(id);
                }
            }
        }
        Ok(parent)
    }

    /// Overwrites an existing remote file with the local bytes and re-tracks.
    async fn update_remote_in_place(
        &self,
        store: &mut FileStateStore,
        path: &str,
        remote_id: &str,
    ) -> Result<(), EngineError> {
        let abs = local_path_for(&self.local_root, path)?;
        let bytes = tokio::fs::read(&abs).await?;
        with_retry(&self.status, &format!("Update {path}"), || {
            self.client.update(remote_id, &bytes)
        })
        .await?;
        let current = probe_file(&abs).await?;
        store.track_file(path, tracked_from(remote_id, &current));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local-origin operations (watcher → queue → workers)
    // ------------------------------------------------------------------

    /// Intake from the local watcher. Ignored while the engine is stopped.
    pub fn enqueue_local_event(&self, event: WatcherEvent) {
        if !self.is_active() {
            return;
        }
        let kind = match event.kind {
            WatcherEventKind::Add => OperationKind::Add,
            WatcherEventKind::Change => OperationKind::Change,
            WatcherEventKind::Delete => OperationKind::Delete,
        };
        let depth = self.queue.enqueue(Operation {
            kind,
            path: event.path.clone(),
            enqueued_at: now_unix(),
        });
        debug!(
            "queued {} for {} ({depth} pending)",
            kind.as_str(),
            event.path
        );
        self.pump();
    }

    /// Drains the queue into spawned workers while slots are free. Called
    /// on enqueue and again as each worker finishes.
    fn pump(&self) {
        while let Some(op) = self.queue.try_claim() {
            let Some(engine) = self.this.upgrade() else {
                self.queue.complete();
                return;
            };
            tokio::spawn(async move {
                if let Err(err) = engine.run_operation(&op).await {
                    warn!("{} failed for {}: {err}", op.kind.as_str(), op.path);
                    engine
                        .status
                        .error(format!("{} failed for {}: {err}", op.kind.as_str(), op.path));
                }
                engine.queue.complete();
                if engine.is_active() {
                    engine.pump();
                }
            });
        }
    }

    async fn run_operation(&self, op: &Operation) -> Result<(), EngineError> {
        debug!("op start: {} {}", op.kind.as_str(), op.path);
        match op.kind {
            // Add and change collapse into one flow: an already-tracked add
            // is a change, an untracked change is an add.
            OperationKind::Add | OperationKind::Change => self.sync_local_path(&op.path).await,
            OperationKind::Delete => self.delete_remote_path(&op.path).await,
        }
    }

    async fn sync_local_path(&self, path: &str) -> Result<(), EngineError> {
        let tracked = {
            let mut store = self.store.lock().await;
            store.get_tracked_file(path).await
        };

        match tracked {
            None => match self.push_new_file(path).await {
                Ok((id, current)) => {
                    let mut store = self.store.lock().await;
                    store.track_file(path, tracked_from(&id, &current));
                    store.save().await;
                    self.status.success(format!("Uploaded: {path}"));
                    Ok(())
                }
                Err(EngineError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("local file vanished before upload: {path}");
                    Ok(())
                }
                Err(err) => Err(err),
            },
            Some(tracked) => {
                let changed = {
                    let mut store = self.store.lock().await;
                    store.has_changed(path).await
                };
                if !changed {
                    debug!("content unchanged, skipping upload: {path}");
                    return Ok(());
                }
                let abs = local_path_for(&self.local_root, path)?;
                let bytes = match tokio::fs::read(&abs).await {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        debug!("local file vanished before upload: {path}");
                        return Ok(());
                    }
                    Err(err) => return Err(err.into()),
                };
                with_retry(&self.status, &format!("Update {path}"), || {
                    self.client.update(&tracked.remote_id, &bytes)
                })
                .await?;
                let after = probe_file(&abs).await?;
                let mut store = self.store.lock().await;
                store.track_file(path, tracked_from(&tracked.remote_id, &after));
                store.save().await;
                self.status.success(format!("Updated: {path}"));
                Ok(())
            }
        }
    }

    async fn delete_remote_path(&self, path: &str) -> Result<(), EngineError> {
        let tracked = {
            let mut store = self.store.lock().await;
            store.get_tracked_file(path).await
        };
        let Some(tracked) = tracked else {
            return Ok(());
        };

        match with_retry(&self.status, &format!("Delete {path}"), || {
            self.client.delete(&tracked.remote_id)
        })
        .await
        {
            Ok(()) => {}
            // Already gone remotely: the deletion is a success.
            Err(err) if err.is_not_found() => {
                debug!("remote copy of {path} was already deleted");
            }
            Err(err) => return Err(err.into()),
        }

        let mut store = self.store.lock().await;
        store.untrack_file(path);
        store.save().await;
        self.status.success(format!("Deleted: {path}"));
        Ok(())
    }
}

fn tracked_from(remote_id: &str, current: &FileProbe) -> TrackedFile {
    TrackedFile {
        remote_id: remote_id.to_string(),
        modified: current.modified,
        size: current.size,
        checksum: current.checksum.clone(),
    }
}

/// Re-stamps tracked metadata after a clock-only change: content fields stay,
/// the timestamp advances past both observations.
fn restamp(
    store: &mut FileStateStore,
    path: &str,
    tracked: &TrackedFile,
    local: &FileProbe,
    remote_modified: i64,
) {
    store.track_file(
        path,
        TrackedFile {
            remote_id: tracked.remote_id.clone(),
            modified: local.modified.max(remote_modified),
            size: local.size,
            checksum: tracked.checksum.clone(),
        },
    );
}

fn parse_modified(value: Option<&str>) -> Result<Option<i64>, time::error::Parse> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok(Some(parsed.unix_timestamp()))
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
#[path = "engine_tests/part1.rs"]
mod part1;

#[cfg(test)]
#[path = "engine_tests/part2.rs"]
mod part2;

#[cfg(test)]
#[path = "engine_tests/part3.rs"]
mod part3;
