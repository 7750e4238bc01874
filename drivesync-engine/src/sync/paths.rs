use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component")]
    UnsupportedComponent,
}

/// Maps an engine-relative path ("Docs/A.txt", `/`-separated) onto the local
/// root. Rejects parent-dir and prefix components so a malformed remote name
/// can never escape the root.
pub fn local_path_for(local_root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = local_root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Converts an absolute path under `local_root` back to the engine-relative
/// `/`-separated form. Returns `None` for paths outside the root.
pub fn to_relative(local_root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(local_root).ok()?;
    let joined = relative.to_string_lossy().replace('\\', "/");
    if joined.is_empty() { None } else { Some(joined) }
}

/// Splits a relative path into its folder segments and the file name.
pub fn split_segments(relative: &str) -> (Vec<&str>, &str) {
    match relative.rsplit_once('/') {
        Some((dir, name)) => (dir.split('/').filter(|s| !s.is_empty()).collect(), name),
        None => (Vec::new(), relative),
    }
}
