use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::Result;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::model::{BinaryFile, FilePair, PointerFile};
use crate::pointer::{self, is_pointer_name, POINTER_SUFFIX};

/// OS and vendor artifacts never archived (compared case-insensitively).
const DENIED_FILES: &[&str] = &["autorun.ini", "thumbs.db", ".ds_store", "desktop.ini"];

/// NAS/sync metadata directories skipped with everything below them.
const DENIED_DIRS: &[&str] =
    &["@eadir", "eadir", "synoresource", "#recycle", "@recycle", "$recycle.bin", "system volume information", "#snapshot"];

/// Walks a root and yields [`FilePair`]s.
pub struct Indexer {
    root: PathBuf,
    denied_dirs: GlobSet,
}

impl Indexer {
    pub fn new(root: &Path) -> Result<Self> {
        let mut b = GlobSetBuilder::new();
        for pat in DENIED_DIRS {
            b.add(GlobBuilder::new(pat).case_insensitive(true).literal_separator(true).build()?);
        }
        Ok(Self { root: root.to_path_buf(), denied_dirs: b.build()? })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lazy walk; call again to restart from the top.
    ///
    /// Within a directory pairs come in name order, and all of a directory's
    /// files come before any of its subdirectories.
    pub fn pairs(&self) -> FilePairs<'_> {
        let denied = &self.denied_dirs;
        let root = self.root.clone();
        let dirs = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| {
                e.depth() == 0 || !e.file_type().is_dir() || !skip_dir(e.file_name(), denied)
            });
        FilePairs { root, dirs: Box::new(dirs), pending: VecDeque::new() }
    }
}

fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn skip_dir(name: &OsStr, denied: &GlobSet) -> bool {
    is_hidden(name) || denied.is_match(name)
}

fn skip_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    name.starts_with('.') || DENIED_FILES.contains(&lower.as_str())
}

pub struct FilePairs<'a> {
    root: PathBuf,
    dirs: Box<dyn Iterator<Item = walkdir::Result<walkdir::DirEntry>> + 'a>,
    pending: VecDeque<Result<FilePair>>,
}

impl FilePairs<'_> {
    /// Pair up the regular files directly inside `dir`.
    fn load_dir(&mut self, dir: &Path) {
        let rd = match std::fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                return;
            }
        };
        #[derive(Default)]
        struct Slot {
            binary: Option<PathBuf>,
            pointer: Option<PathBuf>,
        }
        let mut slots: BTreeMap<String, Slot> = BTreeMap::new();
        for ent in rd {
            let ent = match ent {
                Ok(e) => e,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            match ent.file_type() {
                Ok(ft) if ft.is_file() => {}
                _ => continue,
            }
            let name = ent.file_name().to_string_lossy().to_string();
            if skip_file(&name) {
                debug!(file = %name, "excluded");
                continue;
            }
            let rel = match pathdiff::diff_paths(ent.path(), &self.root) {
                Some(r) => r,
                None => continue,
            };
            if is_pointer_name(&name) {
                let key = name[..name.len() - POINTER_SUFFIX.len()].to_string();
                slots.entry(key).or_default().pointer = Some(rel);
            } else {
                slots.entry(name).or_default().binary = Some(rel);
            }
        }
        for (_, slot) in slots {
            let pair = match (slot.binary, slot.pointer) {
                (Some(b), None) => BinaryFile::from_path(&self.root, &b).map(FilePair::BinaryOnly),
                (None, Some(p)) => pointer::read(&self.root, &p).map(FilePair::PointerOnly),
                (Some(b), Some(p)) => BinaryFile::from_path(&self.root, &b).and_then(|binary| {
                    pointer::read(&self.root, &p).map(|pointer| FilePair::BinaryWithPointer { binary, pointer })
                }),
                (None, None) => continue,
            };
            self.pending.push_back(pair);
        }
    }
}

impl Iterator for FilePairs<'_> {
    type Item = Result<FilePair>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(p) = self.pending.pop_front() {
                return Some(p);
            }
            match self.dirs.next()? {
                Ok(ent) if ent.file_type().is_dir() => {
                    let dir = ent.path().to_path_buf();
                    self.load_dir(&dir);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping entry during walk"),
            }
        }
    }
}

/// Every readable pointer file under `root`, in walk order. Unreadable or
/// corrupt entries are logged and skipped.
pub fn pointers(root: &Path) -> Result<Vec<PointerFile>> {
    let mut out = Vec::new();
    for pair in Indexer::new(root)?.pairs() {
        match pair {
            Ok(FilePair::PointerOnly(p) | FilePair::BinaryWithPointer { pointer: p, .. }) => out.push(p),
            Ok(FilePair::BinaryOnly(_)) => {}
            Err(e) => warn!("skipping: {e:#}"),
        }
    }
    Ok(out)
}
