//! Shared test doubles: an in-memory [`RemoteClient`] with per-operation
//! counters, scriptable failures, and helpers for building remote trees.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use drivesync_core::{RemoteClient, RemoteError, RemoteItem, RemoteItemKind};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::sync::probe::md5_hex;

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Formats a unix timestamp the way remote listings carry it.
pub fn rfc3339(unix: i64) -> String {
    OffsetDateTime::from_unix_timestamp(unix)
        .expect("valid unix timestamp")
        .format(&Rfc3339)
        .expect("rfc3339 formatting")
}

#[derive(Debug, Clone)]
struct FakeNode {
    name: String,
    kind: RemoteItemKind,
    bytes: Vec<u8>,
    modified: Option<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    nodes: HashMap<String, FakeNode>,
    /// parent key ("" = drive root) → child ids, in insertion order.
    children: HashMap<String, Vec<String>>,
    fail_next: HashMap<&'static str, Vec<RemoteError>>,
}

/// In-memory remote store. Ids are caller-chosen for seeded items and
/// generated (`gen-N`) for created ones.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
    next_id: AtomicUsize,
    downloads: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    folder_creates: AtomicUsize,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn parent_key(parent: Option<&str>) -> String {
        parent.unwrap_or("").to_string()
    }

    pub fn add_file(&self, id: &str, name: &str, parent: Option<&str>, bytes: &[u8], modified: &str) {
        let mut state = self.state.lock().expect("fake remote lock");
        state.nodes.insert(
            id.to_string(),
            FakeNode {
                name: name.to_string(),
                kind: RemoteItemKind::File,
                bytes: bytes.to_vec(),
                modified: Some(modified.to_string()),
            },
        );
        state
            .children
            .entry(Self::parent_key(parent))
            .or_default()
            .push(id.to_string());
    }

    pub fn add_folder(&self, id: &str, name: &str, parent: Option<&str>) {
        let mut state = self.state.lock().expect("fake remote lock");
        state.nodes.insert(
            id.to_string(),
            FakeNode {
                name: name.to_string(),
                kind: RemoteItemKind::Folder,
                bytes: Vec::new(),
                modified: None,
            },
        );
        state
            .children
            .entry(Self::parent_key(parent))
            .or_default()
            .push(id.to_string());
    }

    pub fn add_virtual(&self, id: &str, name: &str, parent: Option<&str>) {
        let mut state = self.state.lock().expect("fake remote lock");
        state.nodes.insert(
            id.to_string(),
            FakeNode {
                name: name.to_string(),
                kind: RemoteItemKind::Virtual,
                bytes: Vec::new(),
                modified: None,
            },
        );
        state
            .children
            .entry(Self::parent_key(parent))
            .or_default()
            .push(id.to_string());
    }

    /// Registers an existing node as a child of another parent as well.
    /// Only useful for building malformed graphs.
    pub fn link_child(&self, parent: &str, child: &str) {
        let mut state = self.state.lock().expect("fake remote lock");
        state
            .children
            .entry(parent.to_string())
            .or_default()
            .push(child.to_string());
    }

    pub fn set_file(&self, id: &str, bytes: &[u8], modified: &str) {
        let mut state = self.state.lock().expect("fake remote lock");
        if let Some(node) = state.nodes.get_mut(id) {
            node.bytes = bytes.to_vec();
            node.modified = Some(modified.to_string());
        }
    }

    pub fn remove(&self, id: &str) {
        let mut state = self.state.lock().expect("fake remote lock");
        state.nodes.remove(id);
        for children in state.children.values_mut() {
            children.retain(|child| child != id);
        }
    }

    /// Queues an error returned by the next calls of `op`
    /// (`"list" | "download" | "create_file" | "create_folder" | "update" | "delete"`).
    pub fn fail_next(&self, op: &'static str, err: RemoteError) {
        let mut state = self.state.lock().expect("fake remote lock");
        state.fail_next.entry(op).or_default().push(err);
    }

    fn take_failure(&self, op: &'static str) -> Option<RemoteError> {
        let mut state = self.state.lock().expect("fake remote lock");
        let queued = state.fail_next.get_mut(op)?;
        if queued.is_empty() { None } else { Some(queued.remove(0)) }
    }

    pub fn file_bytes(&self, id: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().expect("fake remote lock");
        state.nodes.get(id).map(|node| node.bytes.clone())
    }

    /// Resolves a `/`-separated path from the drive root to an item id.
    pub fn id_at_path(&self, path: &str) -> Option<String> {
        let state = self.state.lock().expect("fake remote lock");
        let mut parent = String::new();
        let mut current = None;
        for segment in path.split('/') {
            let children = state.children.get(&parent)?;
            let id = children
                .iter()
                .find(|id| state.nodes.get(*id).is_some_and(|n| n.name == segment))?
                .clone();
            parent = id.clone();
            current = Some(id);
        }
        current
    }

    pub fn bytes_at_path(&self, path: &str) -> Option<Vec<u8>> {
        let id = self.id_at_path(path)?;
        self.file_bytes(&id)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn folder_create_count(&self) -> usize {
        self.folder_creates.load(Ordering::SeqCst)
    }

    pub fn transfer_count(&self) -> usize {
        self.download_count() + self.create_count() + self.update_count()
    }
}

#[async_trait]
impl RemoteClient for FakeRemote {
    async fn list(&self, parent_id: Option<&str>) -> Result<Vec<RemoteItem>, RemoteError> {
        if let Some(err) = self.take_failure("list") {
            return Err(err);
        }
        let state = self.state.lock().expect("fake remote lock");
        let key = Self::parent_key(parent_id);
        let mut out = Vec::new();
        for id in state.children.get(&key).into_iter().flatten() {
            let Some(node) = state.nodes.get(id) else {
                continue;
            };
            out.push(RemoteItem {
                id: id.clone(),
                name: node.name.clone(),
                kind: node.kind,
                size: (node.kind == RemoteItemKind::File).then(|| node.bytes.len() as u64),
                modified: node.modified.clone(),
                checksum: (node.kind == RemoteItemKind::File).then(|| md5_hex(&node.bytes)),
                parents: vec![key.clone()],
            });
        }
        Ok(out)
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, RemoteError> {
        if let Some(err) = self.take_failure("download") {
            return Err(err);
        }
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().expect("fake remote lock");
        state
            .nodes
            .get(id)
            .map(|node| node.bytes.clone())
            .ok_or_else(|| RemoteError::NotFound { id: id.to_string() })
    }

    async fn create_file(
        &self,
        name: &str,
        parent_id: Option<&str>,
        bytes: &[u8],
    ) -> Result<String, RemoteError> {
        if let Some(err) = self.take_failure("create_file") {
            return Err(err);
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("gen-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.add_file(&id, name, parent_id, bytes, "2024-01-01T00:00:00Z");
        Ok(id)
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<String, RemoteError> {
        if let Some(err) = self.take_failure("create_folder") {
            return Err(err);
        }
        self.folder_creates.fetch_add(1, Ordering::SeqCst);
        let id = format!("gen-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.add_folder(&id, name, parent_id);
        Ok(id)
    }

    async fn update(&self, id: &str, bytes: &[u8]) -> Result<(), RemoteError> {
        if let Some(err) = self.take_failure("update") {
            return Err(err);
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("fake remote lock");
        match state.nodes.get_mut(id) {
            Some(node) => {
                node.bytes = bytes.to_vec();
                Ok(())
            }
            None => Err(RemoteError::NotFound { id: id.to_string() }),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        if let Some(err) = self.take_failure("delete") {
            return Err(err);
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().expect("fake remote lock");
        if state.nodes.remove(id).is_none() {
            return Err(RemoteError::NotFound { id: id.to_string() });
        }
        for children in state.children.values_mut() {
            children.retain(|child| child != id);
        }
        Ok(())
    }
}
