//! The remote repository contract the pipelines are written against.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::model::PointerFileEntry;

/// Storage tier a chunk blob is uploaded to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Cool,
    #[default]
    Archive,
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(Tier::Hot),
            "cool" => Ok(Tier::Cool),
            "archive" => Ok(Tier::Archive),
            other => Err(format!("unknown tier {other:?} (expected hot, cool or archive)")),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Hot => "hot",
            Tier::Cool => "cool",
            Tier::Archive => "archive",
        })
    }
}

/// Readiness of a chunk blob for download.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlobState {
    /// Hot or cool tier; downloadable now.
    Online,
    /// Archive tier, no hydration requested yet.
    Archived,
    /// Archive tier, hydration requested but not finished.
    Hydrating,
    /// A rehydrated copy is downloadable.
    Hydrated,
}

/// A chunk blob as seen in the repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRef {
    pub hash: Hash,
    /// Encrypted size in bytes.
    pub len: u64,
    pub state: BlobState,
}

/// Operations the archive and restore pipelines need from remote storage.
///
/// Uploaded and downloaded files are encrypted artifacts named
/// `<hash>.ae`. Implementations must be safe to call from many workers.
pub trait RemoteRepository: Send + Sync {
    fn manifest_exists(&self, hash: &Hash) -> Result<bool>;

    fn chunk_exists(&self, hash: &Hash) -> Result<bool>;

    /// Bulk upload of encrypted chunk files.
    fn upload(&self, files: &[PathBuf], tier: Tier) -> Result<()>;

    fn chunk_blob(&self, hash: &Hash) -> Result<BlobRef>;

    /// Bulk download of downloadable blobs into `target_dir`.
    fn download(&self, blobs: &[BlobRef], target_dir: &Path) -> Result<Vec<PathBuf>>;

    /// Request promotion out of the archive tier. Returns immediately.
    fn hydrate(&self, blob: &BlobRef) -> Result<()>;

    fn add_manifest(&self, hash: &Hash, chunks: &[Hash]) -> Result<()>;

    fn get_chunk_hashes(&self, hash: &Hash) -> Result<Vec<Hash>>;

    /// Append `entry` unless the latest entry for its path already records
    /// the same mapping. Returns whether an entry was appended.
    fn create_pointer_file_entry_if_not_exists(&self, entry: &PointerFileEntry) -> Result<bool>;

    /// Latest entry per path, sorted by path.
    fn get_current_entries(&self, include_deleted: bool) -> Result<Vec<PointerFileEntry>>;

    fn create_deleted_pointer_file_entry(&self, entry: &PointerFileEntry, version: DateTime<Utc>) -> Result<()>;
}

/// Bulk file movement between local disk and a blob container.
pub trait BlobTransfer: Send + Sync {
    /// Copy every source into `dest_dir`, keeping file names.
    fn copy(&self, sources: &[PathBuf], dest_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Filesystem copy; each destination appears atomically.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsTransfer;

impl BlobTransfer for FsTransfer {
    fn copy(&self, sources: &[PathBuf], dest_dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dest_dir).with_context(|| format!("create dir {:?}", dest_dir))?;
        let mut out = Vec::with_capacity(sources.len());
        for src in sources {
            let name = src.file_name().with_context(|| format!("no file name in {:?}", src))?;
            let dest = dest_dir.join(name);
            let mut input = File::open(src).with_context(|| format!("open {:?}", src))?;
            let mut tmp = tempfile::NamedTempFile::new_in(dest_dir)?;
            std::io::copy(&mut input, tmp.as_file_mut()).with_context(|| format!("copy {:?}", src))?;
            tmp.as_file().sync_all()?;
            tmp.persist(&dest).map_err(|e| e.error).with_context(|| format!("persist {:?}", dest))?;
            out.push(dest);
        }
        Ok(out)
    }
}

/// Parse `<hash>.ae` back into the hash.
pub fn hash_from_artifact(path: &Path, suffix: &str) -> Result<Hash> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("bad artifact name {:?}", path))?;
    let stem = name.strip_suffix(suffix).with_context(|| format!("{:?} lacks {suffix}", path))?;
    stem.parse().with_context(|| format!("bad artifact hash in {:?}", path))
}
