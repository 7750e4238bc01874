use std::collections::{BTreeMap, HashSet};

use drivesync_core::{RemoteClient, RemoteError, RemoteItem, RemoteItemKind};
use log::debug;

/// Flat view of the remote folder: every downloadable file keyed by its
/// relative path, plus counts for reporting.
#[derive(Debug, Default)]
pub struct RemoteIndex {
    pub files: BTreeMap<String, RemoteItem>,
    pub counts: ScanCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanCounts {
    pub files: usize,
    pub folders: usize,
    pub virtual_items: usize,
}

/// Enumerates the remote folder rooted at `root_id` (`None` for the drive
/// root) into a flat path→item index.
///
/// The traversal is an explicit stack of (folder id, path prefix) frames
/// with a visited set, so a cyclic or otherwise malformed parent graph
/// terminates instead of recursing forever: a folder id seen twice is simply
/// not expanded again. Folders are traversed but never emitted as files;
/// virtual items (no binary representation) are counted and skipped.
pub async fn scan_remote_tree(
    client: &dyn RemoteClient,
    root_id: Option<&str>,
) -> Result<RemoteIndex, RemoteError> {
    let mut index = RemoteIndex::default();
    let mut visited: HashSet<String> = HashSet::new();
    let mut stack: Vec<(Option<String>, String)> =
        vec![(root_id.map(str::to_string), String::new())];
    if let Some(id) = root_id {
        visited.insert(id.to_string());
    }

    while let Some((folder_id, prefix)) = stack.pop() {
        let children = client.list(folder_id.as_deref()).await?;
        for item in children {
            let path = if prefix.is_empty() {
                item.name.clone()
            } else {
                format!("{prefix}/{}", item.name)
            };
            match item.kind {
                RemoteItemKind::Folder => {
                    index.counts.folders += 1;
                    if visited.insert(item.id.clone()) {
                        stack.push((Some(item.id), path));
                    } else {
                        debug!("skipping already-visited remote folder at {path}");
                    }
                }
                RemoteItemKind::Virtual => {
                    index.counts.virtual_items += 1;
                }
                RemoteItemKind::File => {
                    index.counts.files += 1;
                    index.files.insert(path, item);
                }
            }
        }
    }

    Ok(index)
}
