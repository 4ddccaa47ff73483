use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::pointer::POINTER_SUFFIX;

/// A local file that is not a pointer.
#[derive(Clone, Debug)]
pub struct BinaryFile {
    pub root: PathBuf,
    pub rel_path: PathBuf,
    pub len: u64,
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
}

impl BinaryFile {
    pub fn from_path(root: &Path, rel_path: &Path) -> Result<Self> {
        let full = root.join(rel_path);
        let md = std::fs::metadata(&full).with_context(|| format!("stat {:?}", full))?;
        Ok(Self {
            root: root.to_path_buf(),
            rel_path: rel_path.to_path_buf(),
            len: md.len(),
            created: md.created().ok().map(DateTime::<Utc>::from),
            modified: DateTime::<Utc>::from(md.modified()?),
        })
    }

    pub fn full_path(&self) -> PathBuf {
        self.root.join(&self.rel_path)
    }

    /// Forward-slash relative name as recorded in pointer entries.
    pub fn rel_name(&self) -> String {
        rel_name(&self.rel_path)
    }

    pub fn pointer_rel_path(&self) -> PathBuf {
        let mut s = self.rel_path.clone().into_os_string();
        s.push(POINTER_SUFFIX);
        PathBuf::from(s)
    }
}

/// A local stub standing in for an archived binary.
#[derive(Clone, Debug)]
pub struct PointerFile {
    pub root: PathBuf,
    pub rel_path: PathBuf,
    pub hash: Hash,
    pub modified: DateTime<Utc>,
}

impl PointerFile {
    pub fn full_path(&self) -> PathBuf {
        self.root.join(&self.rel_path)
    }

    /// Relative path of the binary this pointer stands for.
    pub fn binary_rel_path(&self) -> PathBuf {
        let s = self.rel_path.to_string_lossy();
        PathBuf::from(s.strip_suffix(POINTER_SUFFIX).unwrap_or(&s).to_string())
    }

    pub fn rel_name(&self) -> String {
        rel_name(&self.binary_rel_path())
    }
}

/// What the indexer found at one relative name.
#[derive(Clone, Debug)]
pub enum FilePair {
    BinaryOnly(BinaryFile),
    PointerOnly(PointerFile),
    BinaryWithPointer { binary: BinaryFile, pointer: PointerFile },
}

impl FilePair {
    pub fn rel_name(&self) -> String {
        match self {
            FilePair::BinaryOnly(b) | FilePair::BinaryWithPointer { binary: b, .. } => b.rel_name(),
            FilePair::PointerOnly(p) => p.rel_name(),
        }
    }
}

/// A content-addressed slice of a binary, materialized as a local artifact.
#[derive(Clone, Debug)]
pub struct Chunk {
    pub hash: Hash,
    pub path: PathBuf,
    pub len: u64,
    /// `path` is a scratch copy owned by the pipeline, not the user's binary.
    pub artifact: bool,
}

impl Chunk {
    /// Remove the scratch copy, if this chunk has one.
    pub fn discard(&self) -> Result<()> {
        if self.artifact {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e).with_context(|| format!("remove {:?}", self.path)),
            }
        }
        Ok(())
    }
}

/// Remote record: a binary hash and its ordered chunk hashes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ManifestRecord {
    pub hash: Hash,
    pub chunks: Vec<Hash>,
}

/// One version of the mapping from a relative path to a binary hash.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PointerFileEntry {
    pub hash: Hash,
    pub rel_path: String,
    pub version: DateTime<Utc>,
    pub is_deleted: bool,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
}

impl PointerFileEntry {
    pub fn for_binary(binary: &BinaryFile, hash: Hash, version: DateTime<Utc>) -> Self {
        Self {
            hash,
            rel_path: binary.rel_name(),
            version,
            is_deleted: false,
            created: binary.created.map(|t| t.trunc_subsecs(0)),
            modified: Some(binary.modified.trunc_subsecs(0)),
        }
    }

    pub fn for_pointer(pointer: &PointerFile, version: DateTime<Utc>) -> Self {
        Self {
            hash: pointer.hash,
            rel_path: pointer.rel_name(),
            version,
            is_deleted: false,
            created: None,
            modified: Some(pointer.modified.trunc_subsecs(0)),
        }
    }

    pub fn tombstone(&self, version: DateTime<Utc>) -> Self {
        Self { version, is_deleted: true, ..self.clone() }
    }

    /// Same mapping ignoring version and timestamps.
    pub fn same_mapping(&self, other: &PointerFileEntry) -> bool {
        self.hash == other.hash && self.rel_path == other.rel_path && self.is_deleted == other.is_deleted
    }
}

pub fn rel_name(p: &Path) -> String {
    p.to_string_lossy().replace('\\', "/")
}

pub fn to_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}

/// Timestamps compare at one-second resolution.
pub fn same_second(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.timestamp() == b.timestamp()
}
