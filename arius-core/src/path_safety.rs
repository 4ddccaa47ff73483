use std::path::{Component, Path, PathBuf};

use anyhow::Result;

use crate::error::ArchiveError;

/// Resolve a forward-slash relative name from a repository entry to a path
/// under `root`.
///
/// Rejects empty names, absolute paths, `..` and any existing symlink along
/// the way, so a hostile entry cannot make restore write outside `root`.
pub fn resolve(root: &Path, rel_name: &str) -> Result<PathBuf> {
    let rel = Path::new(rel_name);
    let unsafe_path = || ArchiveError::UnsafePath(rel.to_path_buf());
    if rel_name.is_empty() || rel.is_absolute() || rel_name.contains('\\') {
        return Err(unsafe_path().into());
    }
    let mut cur = root.to_path_buf();
    for comp in rel.components() {
        match comp {
            Component::Normal(part) => cur.push(part),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path().into())
            }
        }
        if let Ok(m) = std::fs::symlink_metadata(&cur) {
            if m.file_type().is_symlink() {
                return Err(unsafe_path().into());
            }
        }
    }
    Ok(cur)
}
