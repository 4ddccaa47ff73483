use std::fs::{self, File, FileTimes};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::hash::Hash;
use crate::model::{to_utc, BinaryFile, PointerFile};

/// Reserved suffix for pointer files.
pub const POINTER_SUFFIX: &str = ".pointer.arius";

pub fn is_pointer_name(name: &str) -> bool {
    name.ends_with(POINTER_SUFFIX) && name.len() > POINTER_SUFFIX.len()
}

/// Read a pointer file relative to `root`.
pub fn read(root: &Path, rel_path: &Path) -> Result<PointerFile> {
    let full = root.join(rel_path);
    let text = fs::read_to_string(&full).with_context(|| format!("read pointer {:?}", full))?;
    let hash: Hash = text.parse().with_context(|| format!("parse pointer {:?}", full))?;
    let modified = to_utc(fs::metadata(&full)?.modified()?);
    Ok(PointerFile { root: root.to_path_buf(), rel_path: rel_path.to_path_buf(), hash, modified })
}

/// Write (or overwrite) the pointer for `rel_binary`, stamping it with the
/// given modification time so later runs can fast-hash the pair.
pub fn write(
    root: &Path,
    rel_binary: &Path,
    hash: Hash,
    modified: Option<DateTime<Utc>>,
) -> Result<PointerFile> {
    let mut name = rel_binary.as_os_str().to_owned();
    name.push(POINTER_SUFFIX);
    let rel_path = std::path::PathBuf::from(name);
    let full = root.join(&rel_path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create dir {:?}", parent))?;
    }
    let mut f = File::create(&full).with_context(|| format!("create pointer {:?}", full))?;
    f.write_all(hash.to_hex().as_bytes())?;
    if let Some(m) = modified {
        f.set_times(FileTimes::new().set_modified(m.into()))?;
    }
    f.sync_all()?;
    drop(f);
    read(root, &rel_path)
}

/// Pointer for an archived binary, mirroring its modification time.
pub fn write_for_binary(binary: &BinaryFile, hash: Hash) -> Result<PointerFile> {
    write(&binary.root, &binary.rel_path, hash, Some(binary.modified))
}

/// Apply recorded timestamps to a restored binary.
pub fn stamp(path: &Path, modified: Option<DateTime<Utc>>) -> Result<()> {
    if let Some(m) = modified {
        let f = File::options().write(true).open(path).with_context(|| format!("open {:?}", path))?;
        f.set_times(FileTimes::new().set_modified(m.into()))?;
    }
    Ok(())
}
