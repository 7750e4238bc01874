use std::io;
use std::path::Path;

use super::paths::to_relative;

/// Directory names excluded from scanning and watching, alongside every
/// dot-prefixed entry. Matches what the watcher contract guarantees: events
/// never fire for these.
pub const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    "dist",
    "build",
    "target",
    "__pycache__",
    "venv",
    "env",
    "coverage",
    "out",
    "tmp",
    "temp",
];

pub fn is_ignored_name(name: &str) -> bool {
    name.starts_with('.') || IGNORED_DIRS.contains(&name)
}

/// Whether any segment of a relative path is ignored.
pub fn is_ignored_path(relative: &str) -> bool {
    relative.split('/').any(is_ignored_name)
}

/// Enumerates every syncable file under `root` as sorted relative
/// `/`-separated paths. Iterative, so pathological nesting cannot overflow
/// the stack; ignore rules prune whole subtrees.
pub async fn scan_local_tree(root: &Path) -> io::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_ignored_name(&name) {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file()
                && let Some(relative) = to_relative(root, &entry.path())
            {
                out.push(relative);
            }
        }
    }

    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.unwrap();
        }
        tokio::fs::write(path, b"x").await.unwrap();
    }

    #[tokio::test]
    async fn scans_nested_files_as_relative_paths() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("a.txt")).await;
        touch(&dir.path().join("Docs/b.txt")).await;
        touch(&dir.path().join("Docs/Sub/c.txt")).await;

        let found = scan_local_tree(dir.path()).await.unwrap();
        assert_eq!(found, vec!["Docs/Sub/c.txt", "Docs/b.txt", "a.txt"]);
    }

    #[tokio::test]
    async fn ignores_dotfiles_and_build_directories() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("keep.txt")).await;
        touch(&dir.path().join(".hidden")).await;
        touch(&dir.path().join(".drivesync/meta.json")).await;
        touch(&dir.path().join("node_modules/pkg/index.js")).await;
        touch(&dir.path().join("target/debug/bin")).await;
        touch(&dir.path().join("src/.git/config")).await;

        let found = scan_local_tree(dir.path()).await.unwrap();
        assert_eq!(found, vec!["keep.txt"]);
    }

    #[test]
    fn ignore_predicate_covers_nested_segments() {
        assert!(is_ignored_path("node_modules/left-pad/index.js"));
        assert!(is_ignored_path("Docs/.secret/file"));
        assert!(is_ignored_path(".drivesync/chunk-do.json"));
        assert!(!is_ignored_path("Docs/file.txt"));
    }
}
