use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::PathBuf;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::paths::local_path_for;
use super::probe;

pub const STATE_DIR_NAME: &str = ".drivesync";
const META_FILE_NAME: &str = "meta.json";
const LEGACY_STATE_FILE_NAME: &str = ".drivesync-state.json";
const CHUNK_PREFIX: &str = "chunk-";
const CHUNK_SUFFIX: &str = ".json";
const MAX_LOADED_CHUNKS: usize = 20;
const META_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("state payload is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Last-known synchronized metadata for one relative path. Its presence
/// asserts both sides were observed equal at this revision once; it says
/// nothing about either side right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub remote_id: String,
    pub modified: i64,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateMeta {
    last_sync: Option<i64>,
    version: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LegacyState {
    #[serde(default)]
    files: BTreeMap<String, TrackedFile>,
    #[serde(default)]
    last_sync: Option<i64>,
}

/// Durable path→[`TrackedFile`] map, partitioned into chunk files so huge
/// trees never have to be fully resident. Chunks load lazily on lookup and
/// the least-recently-used clean ones are evicted past a fixed cap; a chunk
/// with unflushed mutations is never evicted.
///
/// Persistence failures are logged and swallowed: the store degrades to an
/// in-memory view for the session instead of failing the sync loop.
pub struct FileStateStore {
    local_root: PathBuf,
    state_dir: PathBuf,
    legacy_file: PathBuf,
    files: HashMap<String, TrackedFile>,
    last_sync: Option<i64>,
    loaded_chunks: HashMap<String, BTreeMap<String, TrackedFile>>,
    dirty: HashMap<String, bool>,
    access_order: VecDeque<String>,
    saved_once: bool,
}

impl FileStateStore {
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        let local_root = local_root.into();
        let state_dir = local_root.join(STATE_DIR_NAME);
        let legacy_file = local_root.join(LEGACY_STATE_FILE_NAME);
        Self {
            local_root,
            state_dir,
            legacy_file,
            files: HashMap::new(),
            last_sync: None,
            loaded_chunks: HashMap::new(),
            dirty: HashMap::new(),
            access_order: VecDeque::new(),
            saved_once: false,
        }
    }

    /// Derives the owning chunk file name for a relative path.
    ///
    /// A pure function of the path: separators and case are normalized, then
    /// the first segment picks the bucket: a shared `0-9` bucket for digit
    /// prefixes, `special` for non-alphanumeric prefixes, otherwise the first
    /// two characters (the whole segment when it has just one). The key is
    /// sanitized to a safe filename alphabet. Colocates sibling paths while
    /// bounding how many chunk files exist.
    pub fn chunk_name(relative: &str) -> String {
        let normalized = relative.replace('\\', "/").to_lowercase();
        let first = normalized.split('/').next().unwrap_or("");

        let key = if first.is_empty() {
            "root".to_string()
        } else if first.starts_with(|c: char| c.is_ascii_digit()) {
            "0-9".to_string()
        } else if first.starts_with(|c: char| !c.is_ascii_alphanumeric()) {
            "special".to_string()
        } else if first.chars().count() == 1 {
            first.to_string()
        } else {
            first.chars().take(2).collect()
        };

        let key: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{CHUNK_PREFIX}{key}{CHUNK_SUFFIX}")
    }

    /// Prepares the state directory and reads summary metadata. A legacy
    /// single-file blob, if present, is migrated into the chunked layout and
    /// removed. Chunk payloads stay on disk until requested.
    pub async fn load(&mut self) {
        if let Err(err) = self.try_load().await {
            warn!("state store load failed, starting with empty state: {err}");
            self.files.clear();
            self.loaded_chunks.clear();
            self.dirty.clear();
            self.access_order.clear();
            self.last_sync = None;
        }
    }

    async fn try_load(&mut self) -> Result<(), StateStoreError> {
        tokio::fs::create_dir_all(&self.state_dir).await?;

        if self.migrate_legacy().await? {
            return Ok(());
        }

        match tokio::fs::read(self.meta_path()).await {
            Ok(raw) => {
                let meta: StateMeta = serde_json::from_slice(&raw)?;
                self.last_sync = meta.last_sync;
                debug!(
                    "state store ready (format v{}), chunks load lazily",
                    meta.version
                );
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.last_sync = None;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    async fn migrate_legacy(&mut self) -> Result<bool, StateStoreError> {
        let raw = match tokio::fs::read(&self.legacy_file).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let legacy: LegacyState = match serde_json::from_slice(&raw) {
            Ok(state) => state,
            Err(err) => {
                warn!("legacy state file is malformed, ignoring it: {err}");
                return Ok(false);
            }
        };
        if legacy.files.is_empty() {
            return Ok(false);
        }

        info!(
            "migrating legacy single-file state ({} entries) into chunks",
            legacy.files.len()
        );
        self.files = legacy.files.into_iter().collect();
        self.last_sync = legacy.last_sync;
        self.try_save().await?;
        tokio::fs::remove_file(&self.legacy_file).await?;

        // Do not keep the whole migrated tree resident.
        self.files.clear();
        self.loaded_chunks.clear();
        self.access_order.clear();
        Ok(true)
    }

    pub async fn get_tracked_file(&mut self, relative: &str) -> Option<TrackedFile> {
        if let Some(found) = self.files.get(relative) {
            return Some(found.clone());
        }
        let chunk = Self::chunk_name(relative);
        self.load_chunk(&chunk).await;
        self.files.get(relative).cloned()
    }

    pub fn track_file(&mut self, relative: &str, file: TrackedFile) {
        let chunk = Self::chunk_name(relative);
        if let Some(payload) = self.loaded_chunks.get_mut(&chunk) {
            payload.insert(relative.to_string(), file.clone());
        }
        self.files.insert(relative.to_string(), file);
        self.dirty.insert(chunk, true);
    }

    pub fn untrack_file(&mut self, relative: &str) {
        let chunk = Self::chunk_name(relative);
        if let Some(payload) = self.loaded_chunks.get_mut(&chunk) {
            payload.remove(relative);
        }
        self.files.remove(relative);
        self.dirty.insert(chunk, true);
    }

    /// Flushes summary metadata and dirty chunks (every chunk on the very
    /// first save). A chunk whose payload became empty has its file removed.
    /// Failures are logged, never returned.
    pub async fn save(&mut self) {
        if let Err(err) = self.try_save().await {
            warn!("state store save failed, keeping in-memory state only: {err}");
        }
    }

    async fn try_save(&mut self) -> Result<(), StateStoreError> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let meta = StateMeta {
            last_sync: self.last_sync,
            version: META_VERSION,
        };
        tokio::fs::write(self.meta_path(), serde_json::to_vec_pretty(&meta)?).await?;

        // Regroup the flat map by chunk, then overlay loaded chunk payloads
        // covering entries already evicted from the flat map.
        let mut chunks: HashMap<String, BTreeMap<String, TrackedFile>> = HashMap::new();
        for (path, file) in &self.files {
            chunks
                .entry(Self::chunk_name(path))
                .or_default()
                .insert(path.clone(), file.clone());
        }
        for (chunk, payload) in &self.loaded_chunks {
            let merged = chunks.entry(chunk.clone()).or_default();
            for (path, file) in payload {
                merged.entry(path.clone()).or_insert_with(|| file.clone());
            }
        }

        let to_write: Vec<String> = if self.saved_once {
            self.dirty
                .iter()
                .filter(|(_, dirty)| **dirty)
                .map(|(chunk, _)| chunk.clone())
                .collect()
        } else {
            chunks.keys().cloned().collect()
        };

        for chunk in to_write {
            let path = self.state_dir.join(&chunk);
            match chunks.get(&chunk) {
                Some(payload) if !payload.is_empty() => {
                    tokio::fs::write(&path, serde_json::to_vec_pretty(payload)?).await?;
                }
                _ => match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                },
            }
        }

        for flag in self.dirty.values_mut() {
            *flag = false;
        }
        self.saved_once = true;
        Ok(())
    }

    /// Forces every chunk file on disk to load and returns the full set of
    /// tracked paths. O(total chunk count); full reconciliation only, never
    /// the hot local-event path.
    pub async fn get_all_tracked_files(&mut self) -> Vec<String> {
        let mut all: BTreeSet<String> = self.files.keys().cloned().collect();
        for chunk in self.chunk_files_on_disk().await {
            self.load_chunk(&chunk).await;
            if let Some(payload) = self.loaded_chunks.get(&chunk) {
                all.extend(payload.keys().cloned());
            }
        }
        all.into_iter().collect()
    }

    /// Whether the local copy of a tracked path differs from its tracked
    /// revision. Untracked paths count as changed; an unreadable local file
    /// does not.
    pub async fn has_changed(&mut self, relative: &str) -> bool {
        let Some(tracked) = self.get_tracked_file(relative).await else {
            return true;
        };
        let Ok(path) = local_path_for(&self.local_root, relative) else {
            return false;
        };
        match probe::probe_file(&path).await {
            Ok(current) => current.checksum != tracked.checksum || current.size != tracked.size,
            Err(_) => false,
        }
    }

    pub fn update_last_sync(&mut self) {
        self.last_sync = Some(probe::now_unix());
    }

    pub fn last_sync(&self) -> Option<i64> {
        self.last_sync
    }

    /// Number of currently resident tracked entries (a lower bound on the
    /// total once chunks have been evicted).
    pub fn tracked_count(&self) -> usize {
        self.files.len()
    }

    async fn load_chunk(&mut self, chunk: &str) {
        if self.loaded_chunks.contains_key(chunk) {
            self.touch(chunk);
            return;
        }

        let path = self.state_dir.join(chunk);
        let payload: BTreeMap<String, TrackedFile> = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice(&raw) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("chunk {chunk} is malformed, treating as empty: {err}");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!("failed to read chunk {chunk}: {err}");
                BTreeMap::new()
            }
        };

        // In-memory entries are newer than what is on disk; keep them.
        for (path, file) in &payload {
            self.files
                .entry(path.clone())
                .or_insert_with(|| file.clone());
        }
        self.loaded_chunks.insert(chunk.to_string(), payload);
        self.touch(chunk);
        self.evict_excess_chunks();
    }

    fn touch(&mut self, chunk: &str) {
        if let Some(pos) = self.access_order.iter().position(|name| name == chunk) {
            self.access_order.remove(pos);
        }
        self.access_order.push_back(chunk.to_string());
    }

    fn is_dirty(&self, chunk: &str) -> bool {
        self.dirty.get(chunk).copied().unwrap_or(false)
    }

    fn evict_excess_chunks(&mut self) {
        while self.loaded_chunks.len() > MAX_LOADED_CHUNKS {
            let evictable = self
                .access_order
                .iter()
                .position(|name| !self.is_dirty(name));
            let Some(pos) = evictable else {
                // Everything loaded is dirty; eviction would lose mutations.
                break;
            };
            let Some(chunk) = self.access_order.remove(pos) else {
                break;
            };
            if let Some(payload) = self.loaded_chunks.remove(&chunk) {
                for path in payload.keys() {
                    self.files.remove(path);
                }
            }
            debug!("evicted chunk from memory: {chunk}");
        }
    }

    async fn chunk_files_on_disk(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.state_dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(CHUNK_PREFIX) && name.ends_with(CHUNK_SUFFIX) {
                out.push(name);
            }
        }
        out.sort();
        out
    }

    fn meta_path(&self) -> PathBuf {
        self.state_dir.join(META_FILE_NAME)
    }

    #[cfg(test)]
    fn loaded_chunk_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.loaded_chunks.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tracked(id: &str) -> TrackedFile {
        TrackedFile {
            remote_id: id.to_string(),
            modified: 1_700_000_000,
            size: 12,
            checksum: "abc123".into(),
        }
    }

    #[test]
    fn chunk_name_is_deterministic_per_path() {
        for path in ["Docs/A.txt", "src/lib.rs", "1e-drafts/x", "#tmp/y", "a"] {
            assert_eq!(
                FileStateStore::chunk_name(path),
                FileStateStore::chunk_name(path)
            );
        }
    }

    #[test]
    fn chunk_name_buckets() {
        assert_eq!(FileStateStore::chunk_name("Docs/A.txt"), "chunk-do.json");
        assert_eq!(FileStateStore::chunk_name("docs/B.txt"), "chunk-do.json");
        assert_eq!(
            FileStateStore::chunk_name("Docs\\nested\\C.txt"),
            "chunk-do.json"
        );
        // Digit prefixes share one bucket, even single-character ones.
        assert_eq!(FileStateStore::chunk_name("2024/report.pdf"), "chunk-0-9.json");
        assert_eq!(FileStateStore::chunk_name("1"), "chunk-0-9.json");
        // Non-alphanumeric prefixes share another.
        assert_eq!(FileStateStore::chunk_name("#inbox/a"), "chunk-special.json");
        assert_eq!(FileStateStore::chunk_name("_tmp/a"), "chunk-special.json");
        // Single alphabetic segment keeps its own name.
        assert_eq!(FileStateStore::chunk_name("a"), "chunk-a.json");
        assert_eq!(FileStateStore::chunk_name("x/deep/file"), "chunk-x.json");
    }

    #[test]
    fn chunk_key_is_sanitized_to_safe_alphabet() {
        let name = FileStateStore::chunk_name("éclair/recipe.txt");
        assert_eq!(name, "chunk-special.json");
        let name = FileStateStore::chunk_name("aé/recipe.txt");
        assert_eq!(name, "chunk-a_.json");
    }

    #[tokio::test]
    async fn save_then_load_round_trips_tracked_files() {
        let dir = tempdir().unwrap();
        let mut store = FileStateStore::new(dir.path());
        store.load().await;
        store.track_file("Docs/A.txt", tracked("r1"));
        store.track_file("src/lib.rs", tracked("r2"));
        store.update_last_sync();
        store.save().await;
        let last_sync = store.last_sync();

        let mut reloaded = FileStateStore::new(dir.path());
        reloaded.load().await;
        assert_eq!(reloaded.last_sync(), last_sync);
        assert_eq!(
            reloaded.get_tracked_file("Docs/A.txt").await,
            Some(tracked("r1"))
        );
        assert_eq!(
            reloaded.get_tracked_file("src/lib.rs").await,
            Some(tracked("r2"))
        );
        assert_eq!(reloaded.get_tracked_file("missing").await, None);
    }

    #[tokio::test]
    async fn lookups_load_only_the_owning_chunk() {
        let dir = tempdir().unwrap();
        let mut store = FileStateStore::new(dir.path());
        store.load().await;
        store.track_file("Docs/A.txt", tracked("r1"));
        store.track_file("src/lib.rs", tracked("r2"));
        store.save().await;

        let mut reloaded = FileStateStore::new(dir.path());
        reloaded.load().await;
        assert!(reloaded.loaded_chunk_names().is_empty());
        reloaded.get_tracked_file("Docs/A.txt").await.unwrap();
        assert_eq!(reloaded.loaded_chunk_names(), vec!["chunk-do.json"]);
    }

    #[tokio::test]
    async fn untracking_last_entry_removes_chunk_file() {
        let dir = tempdir().unwrap();
        let mut store = FileStateStore::new(dir.path());
        store.load().await;
        store.track_file("Docs/A.txt", tracked("r1"));
        store.save().await;
        let chunk_path = dir.path().join(STATE_DIR_NAME).join("chunk-do.json");
        assert!(chunk_path.exists());

        store.untrack_file("Docs/A.txt");
        store.save().await;
        assert!(!chunk_path.exists());

        let mut reloaded = FileStateStore::new(dir.path());
        reloaded.load().await;
        assert_eq!(reloaded.get_tracked_file("Docs/A.txt").await, None);
    }

    #[tokio::test]
    async fn clean_saves_do_not_rewrite_untouched_chunks() {
        let dir = tempdir().unwrap();
        let mut store = FileStateStore::new(dir.path());
        store.load().await;
        store.track_file("Docs/A.txt", tracked("r1"));
        store.save().await;

        // Scribble over the chunk; a save with no dirty chunks must not
        // restore it, a save after a mutation must.
        let chunk_path = dir.path().join(STATE_DIR_NAME).join("chunk-do.json");
        tokio::fs::write(&chunk_path, b"scribble").await.unwrap();
        store.save().await;
        assert_eq!(tokio::fs::read(&chunk_path).await.unwrap(), b"scribble");

        store.track_file("Docs/B.txt", tracked("r2"));
        store.save().await;
        let restored = tokio::fs::read(&chunk_path).await.unwrap();
        assert_ne!(restored, b"scribble");
    }

    #[tokio::test]
    async fn migrates_legacy_single_file_state() {
        let dir = tempdir().unwrap();
        let mut files = BTreeMap::new();
        files.insert("Docs/A.txt".to_string(), tracked("r1"));
        files.insert("src/lib.rs".to_string(), tracked("r2"));
        let legacy = LegacyState {
            files,
            last_sync: Some(1_700_000_000),
        };
        let legacy_path = dir.path().join(LEGACY_STATE_FILE_NAME);
        tokio::fs::write(&legacy_path, serde_json::to_vec(&legacy).unwrap())
            .await
            .unwrap();

        let mut store = FileStateStore::new(dir.path());
        store.load().await;

        assert!(!legacy_path.exists());
        assert_eq!(store.last_sync(), Some(1_700_000_000));
        // The migrated copy is not kept resident.
        assert_eq!(store.tracked_count(), 0);
        assert_eq!(
            store.get_tracked_file("Docs/A.txt").await,
            Some(tracked("r1"))
        );
        assert!(
            dir.path()
                .join(STATE_DIR_NAME)
                .join("chunk-sr.json")
                .exists()
        );
    }

    #[tokio::test]
    async fn eviction_keeps_at_most_twenty_clean_chunks() {
        let dir = tempdir().unwrap();
        let mut store = FileStateStore::new(dir.path());
        store.load().await;
        let prefixes: Vec<String> = (b'a'..=b'z')
            .take(25)
            .map(|c| format!("q{}", c as char))
            .collect();
        for prefix in &prefixes {
            store.track_file(&format!("{prefix}/file.txt"), tracked("r"));
        }
        store.save().await;

        let mut reloaded = FileStateStore::new(dir.path());
        reloaded.load().await;
        for prefix in &prefixes {
            reloaded
                .get_tracked_file(&format!("{prefix}/file.txt"))
                .await
                .unwrap();
        }
        assert_eq!(reloaded.loaded_chunk_names().len(), MAX_LOADED_CHUNKS);
    }

    #[tokio::test]
    async fn dirty_chunks_survive_eviction() {
        let dir = tempdir().unwrap();
        let mut store = FileStateStore::new(dir.path());
        store.load().await;
        let prefixes: Vec<String> = (b'a'..=b'z')
            .take(25)
            .map(|c| format!("q{}", c as char))
            .collect();
        for prefix in &prefixes {
            store.track_file(&format!("{prefix}/file.txt"), tracked("r"));
        }
        store.save().await;

        let mut reloaded = FileStateStore::new(dir.path());
        reloaded.load().await;
        // Load the qa chunk and dirty it, then churn through the rest.
        reloaded.get_tracked_file("qa/file.txt").await.unwrap();
        reloaded.track_file("qa/new.txt", tracked("new"));
        for prefix in &prefixes[1..] {
            reloaded
                .get_tracked_file(&format!("{prefix}/file.txt"))
                .await
                .unwrap();
        }
        assert!(
            reloaded
                .loaded_chunk_names()
                .contains(&"chunk-qa.json".to_string())
        );
        assert_eq!(
            reloaded.get_tracked_file("qa/new.txt").await,
            Some(tracked("new"))
        );
    }

    #[tokio::test]
    async fn get_all_tracked_files_sees_every_chunk() {
        let dir = tempdir().unwrap();
        let mut store = FileStateStore::new(dir.path());
        store.load().await;
        let prefixes: Vec<String> = (b'a'..=b'z')
            .take(25)
            .map(|c| format!("q{}", c as char))
            .collect();
        for prefix in &prefixes {
            store.track_file(&format!("{prefix}/file.txt"), tracked("r"));
        }
        store.save().await;

        let mut reloaded = FileStateStore::new(dir.path());
        reloaded.load().await;
        let all = reloaded.get_all_tracked_files().await;
        assert_eq!(all.len(), prefixes.len());
        assert!(all.contains(&"qa/file.txt".to_string()));
        assert!(all.contains(&"qy/file.txt".to_string()));
    }

    #[tokio::test]
    async fn has_changed_compares_against_tracked_revision() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("Docs").join("A.txt");
        tokio::fs::create_dir_all(file_path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&file_path, b"hello").await.unwrap();

        let mut store = FileStateStore::new(dir.path());
        store.load().await;
        assert!(store.has_changed("Docs/A.txt").await);

        let probe = super::super::probe::probe_file(&file_path).await.unwrap();
        store.track_file(
            "Docs/A.txt",
            TrackedFile {
                remote_id: "r1".into(),
                modified: probe.modified,
                size: probe.size,
                checksum: probe.checksum,
            },
        );
        assert!(!store.has_changed("Docs/A.txt").await);

        tokio::fs::write(&file_path, b"changed content").await.unwrap();
        assert!(store.has_changed("Docs/A.txt").await);

        // An unreadable local copy is not reported as changed.
        tokio::fs::remove_file(&file_path).await.unwrap();
        assert!(!store.has_changed("Docs/A.txt").await);
    }
}
