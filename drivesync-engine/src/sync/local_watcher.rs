use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::local_tree::is_ignored_path;
use super::paths::to_relative;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherEventKind {
    Add,
    Change,
    Delete,
}

/// A debounced local filesystem event, with the path relative to the sync
/// root. Paths matching the ignore set never reach the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub kind: WatcherEventKind,
    pub path: String,
}

/// Watches `root` recursively and yields debounced [`WatcherEvent`]s.
///
/// Bursts of events for one path are coalesced within the debounce window;
/// the returned watcher must be kept alive for events to keep flowing. Must
/// be called from within a tokio runtime.
pub fn start_watcher(
    root: &Path,
    debounce: Duration,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<WatcherEvent>)> {
    let (raw_tx, raw_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let watch_root = root.to_path_buf();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for mapped in map_event(&watch_root, event) {
                let _ = raw_tx.send(mapped);
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;

    tokio::spawn(debounce_loop(raw_rx, out_tx, debounce));
    Ok((watcher, out_rx))
}

fn map_event(root: &Path, event: Event) -> Vec<WatcherEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2
                && let (Some(from), Some(to)) = (
                    usable_relative(root, &event.paths[0]),
                    usable_relative(root, &event.paths[1]),
                )
            {
                return vec![
                    WatcherEvent {
                        kind: WatcherEventKind::Delete,
                        path: from,
                    },
                    WatcherEvent {
                        kind: WatcherEventKind::Add,
                        path: to,
                    },
                ];
            }
            Vec::new()
        }
        EventKind::Create(_) => collect(root, event, WatcherEventKind::Add),
        EventKind::Modify(_) => collect(root, event, WatcherEventKind::Change),
        EventKind::Remove(_) => collect(root, event, WatcherEventKind::Delete),
        _ => Vec::new(),
    }
}

fn collect(root: &Path, event: Event, kind: WatcherEventKind) -> Vec<WatcherEvent> {
    event
        .paths
        .into_iter()
        .filter_map(|path| usable_relative(root, &path))
        .map(|path| WatcherEvent { kind, path })
        .collect()
}

fn usable_relative(root: &Path, path: &Path) -> Option<String> {
    let relative = to_relative(root, path)?;
    if is_ignored_path(&relative) {
        return None;
    }
    Some(relative)
}

async fn debounce_loop(
    mut rx: mpsc::UnboundedReceiver<WatcherEvent>,
    tx: mpsc::UnboundedSender<WatcherEvent>,
    window: Duration,
) {
    let mut pending: HashMap<String, (WatcherEventKind, Instant)> = HashMap::new();
    let tick = (window / 4).max(Duration::from_millis(25));

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => coalesce(&mut pending, event),
                    None => break,
                }
            }
            _ = tokio::time::sleep(tick) => {}
        }

        let now = Instant::now();
        let ready: Vec<String> = pending
            .iter()
            .filter(|(_, (_, seen))| now.duration_since(*seen) >= window)
            .map(|(path, _)| path.clone())
            .collect();
        for path in ready {
            if let Some((kind, _)) = pending.remove(&path) {
                let _ = tx.send(WatcherEvent { kind, path });
            }
        }
    }

    // Producer closed; flush whatever is still waiting out.
    for (path, (kind, _)) in pending.drain() {
        let _ = tx.send(WatcherEvent { kind, path });
    }
}

fn coalesce(pending: &mut HashMap<String, (WatcherEventKind, Instant)>, event: WatcherEvent) {
    let WatcherEvent { kind: new_kind, path } = event;
    let now = Instant::now();
    pending
        .entry(path)
        .and_modify(|(kind, seen)| {
            *kind = merge_kinds(*kind, new_kind);
            *seen = now;
        })
        .or_insert((new_kind, now));
}

fn merge_kinds(old: WatcherEventKind, new: WatcherEventKind) -> WatcherEventKind {
    match (old, new) {
        // A change right after a create is still a create as far as the
        // remote is concerned; a recreate after a delete is an add.
        (WatcherEventKind::Add, WatcherEventKind::Change) => WatcherEventKind::Add,
        (WatcherEventKind::Delete, WatcherEventKind::Add) => WatcherEventKind::Add,
        _ => new,
    }
}
