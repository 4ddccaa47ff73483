//! Directory-backed repository.
//!
//! ```text
//! <repo>/repo.lock                 exclusive lock while open
//! <repo>/chunks/<hash>.ae          uploaded chunk blobs
//! <repo>/rehydrated/<hash>.ae      copies of archive-tier blobs after hydration
//! <repo>/manifests/<hash>.manifest.ae
//! <repo>/state/blobs.json          tier, size and hydration status per blob
//! <repo>/state/entries.jsonl       append-only pointer entry log
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::{write_atomic, Encrypter};
use crate::envelope::{CHUNK_SUFFIX, MANIFEST_SUFFIX};
use crate::error::ArchiveError;
use crate::hash::Hash;
use crate::model::{ManifestRecord, PointerFileEntry};
use crate::repository::{hash_from_artifact, BlobRef, BlobState, BlobTransfer, FsTransfer, RemoteRepository, Tier};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Hydration {
    Pending,
    Done,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct BlobMeta {
    tier: Tier,
    len: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hydration: Option<Hydration>,
}

impl BlobMeta {
    fn state(&self) -> BlobState {
        match (self.tier, self.hydration) {
            (Tier::Hot | Tier::Cool, _) => BlobState::Online,
            (Tier::Archive, None) => BlobState::Archived,
            (Tier::Archive, Some(Hydration::Pending)) => BlobState::Hydrating,
            (Tier::Archive, Some(Hydration::Done)) => BlobState::Hydrated,
        }
    }
}

#[derive(Default)]
struct State {
    blobs: BTreeMap<Hash, BlobMeta>,
    entries: Vec<PointerFileEntry>,
}

impl State {
    /// Latest entry for `rel_path`; on equal versions the later append wins.
    fn latest(&self, rel_path: &str) -> Option<&PointerFileEntry> {
        self.entries
            .iter()
            .filter(|e| e.rel_path == rel_path)
            .fold(None, |best: Option<&PointerFileEntry>, e| match best {
                Some(b) if b.version > e.version => Some(b),
                _ => Some(e),
            })
    }
}

pub struct LocalRepository {
    root: PathBuf,
    encrypter: Arc<dyn Encrypter>,
    transfer: Box<dyn BlobTransfer>,
    state: Mutex<State>,
    _lock: File,
}

impl LocalRepository {
    /// Open (creating if needed) the repository at `root`.
    pub fn open(root: &Path, encrypter: Arc<dyn Encrypter>) -> Result<Self> {
        for dir in ["chunks", "rehydrated", "manifests", "state"] {
            fs::create_dir_all(root.join(dir)).with_context(|| format!("create {:?}", root.join(dir)))?;
        }
        let lock_path = root.join("repo.lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("open {:?}", lock_path))?;
        lock.try_lock_exclusive()
            .with_context(|| format!("repository {:?} is in use by another process", root))?;

        let mut state = State::default();
        let blobs_path = root.join("state").join("blobs.json");
        if blobs_path.exists() {
            let data = fs::read(&blobs_path).with_context(|| format!("read {:?}", blobs_path))?;
            state.blobs = serde_json::from_slice(&data).with_context(|| format!("parse {:?}", blobs_path))?;
        }
        let entries_path = root.join("state").join("entries.jsonl");
        if entries_path.exists() {
            let f = File::open(&entries_path).with_context(|| format!("open {:?}", entries_path))?;
            for (n, line) in BufReader::new(f).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let entry = serde_json::from_str(&line)
                    .with_context(|| format!("{:?} line {}", entries_path, n + 1))?;
                state.entries.push(entry);
            }
        }
        debug!(blobs = state.blobs.len(), entries = state.entries.len(), "opened repository");
        Ok(Self {
            root: root.to_path_buf(),
            encrypter,
            transfer: Box::new(FsTransfer),
            state: Mutex::new(state),
            _lock: lock,
        })
    }

    pub fn with_transfer(mut self, transfer: Box<dyn BlobTransfer>) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chunks_dir(&self) -> PathBuf {
        self.root.join("chunks")
    }

    fn rehydrated_dir(&self) -> PathBuf {
        self.root.join("rehydrated")
    }

    fn manifest_path(&self, hash: &Hash) -> PathBuf {
        self.root.join("manifests").join(format!("{hash}{MANIFEST_SUFFIX}"))
    }

    fn save_blobs(&self, state: &State) -> Result<()> {
        let data = serde_json::to_vec_pretty(&state.blobs)?;
        write_atomic(&self.root.join("state").join("blobs.json"), &data)
    }

    fn append_entry(&self, state: &mut State, entry: PointerFileEntry) -> Result<()> {
        let path = self.root.join("state").join("entries.jsonl");
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {:?}", path))?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        f.write_all(&line)?;
        f.sync_data()?;
        state.entries.push(entry);
        Ok(())
    }

    /// Finish every pending hydration, as if the archive tier's retrieval
    /// window had elapsed. Returns how many blobs became downloadable.
    pub fn complete_hydrations(&self) -> Result<usize> {
        let pending: Vec<Hash> = {
            let state = self.state.lock().unwrap();
            state
                .blobs
                .iter()
                .filter(|(_, m)| m.hydration == Some(Hydration::Pending))
                .map(|(h, _)| *h)
                .collect()
        };
        if pending.is_empty() {
            return Ok(0);
        }
        let sources: Vec<PathBuf> =
            pending.iter().map(|h| self.chunks_dir().join(format!("{h}{CHUNK_SUFFIX}"))).collect();
        self.transfer.copy(&sources, &self.rehydrated_dir())?;
        let mut state = self.state.lock().unwrap();
        for h in &pending {
            if let Some(meta) = state.blobs.get_mut(h) {
                meta.hydration = Some(Hydration::Done);
            }
        }
        self.save_blobs(&state)?;
        info!(count = pending.len(), "hydration completed");
        Ok(pending.len())
    }

    pub fn pending_hydrations(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.blobs.values().filter(|m| m.hydration == Some(Hydration::Pending)).count()
    }

    /// Every entry ever appended for `rel_path`, oldest first.
    pub fn history(&self, rel_path: &str) -> Vec<PointerFileEntry> {
        let state = self.state.lock().unwrap();
        state.entries.iter().filter(|e| e.rel_path == rel_path).cloned().collect()
    }
}

impl RemoteRepository for LocalRepository {
    fn manifest_exists(&self, hash: &Hash) -> Result<bool> {
        Ok(self.manifest_path(hash).exists())
    }

    fn chunk_exists(&self, hash: &Hash) -> Result<bool> {
        Ok(self.state.lock().unwrap().blobs.contains_key(hash))
    }

    fn upload(&self, files: &[PathBuf], tier: Tier) -> Result<()> {
        let mut uploaded = Vec::with_capacity(files.len());
        for f in files {
            let hash = hash_from_artifact(f, CHUNK_SUFFIX)?;
            let len = fs::metadata(f).with_context(|| format!("stat {:?}", f))?.len();
            uploaded.push((hash, len));
        }
        self.transfer.copy(files, &self.chunks_dir())?;
        let mut state = self.state.lock().unwrap();
        for (hash, len) in uploaded {
            state.blobs.insert(hash, BlobMeta { tier, len, hydration: None });
        }
        self.save_blobs(&state)
    }

    fn chunk_blob(&self, hash: &Hash) -> Result<BlobRef> {
        let state = self.state.lock().unwrap();
        let Some(meta) = state.blobs.get(hash) else {
            bail!("chunk {hash} is not in the repository");
        };
        Ok(BlobRef { hash: *hash, len: meta.len, state: meta.state() })
    }

    fn download(&self, blobs: &[BlobRef], target_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut online = Vec::new();
        let mut hydrated = Vec::new();
        {
            let state = self.state.lock().unwrap();
            for b in blobs {
                let name = format!("{}{CHUNK_SUFFIX}", b.hash);
                match state.blobs.get(&b.hash).map(BlobMeta::state) {
                    Some(BlobState::Online) => online.push(self.chunks_dir().join(name)),
                    Some(BlobState::Hydrated) => hydrated.push(self.rehydrated_dir().join(name)),
                    Some(s) => bail!("chunk {} is not downloadable ({s:?})", b.hash),
                    None => bail!("chunk {} is not in the repository", b.hash),
                }
            }
        }
        let mut out = self.transfer.copy(&online, target_dir)?;
        out.extend(self.transfer.copy(&hydrated, target_dir)?);
        Ok(out)
    }

    fn hydrate(&self, blob: &BlobRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(meta) = state.blobs.get_mut(&blob.hash) else {
            bail!("chunk {} is not in the repository", blob.hash);
        };
        if meta.state() != BlobState::Archived {
            return Ok(());
        }
        meta.hydration = Some(Hydration::Pending);
        self.save_blobs(&state)?;
        info!(hash = %blob.hash.short(), "hydration requested");
        Ok(())
    }

    fn add_manifest(&self, hash: &Hash, chunks: &[Hash]) -> Result<()> {
        let record = ManifestRecord { hash: *hash, chunks: chunks.to_vec() };
        let sealed = self.encrypter.seal(&serde_json::to_vec(&record)?)?;
        write_atomic(&self.manifest_path(hash), &sealed)
    }

    fn get_chunk_hashes(&self, hash: &Hash) -> Result<Vec<Hash>> {
        let path = self.manifest_path(hash);
        let sealed = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArchiveError::UnknownManifest(*hash).into())
            }
            Err(e) => return Err(e).with_context(|| format!("read {:?}", path)),
        };
        let plain = self.encrypter.open(&sealed, &path)?;
        let record: ManifestRecord =
            serde_json::from_slice(&plain).with_context(|| format!("parse manifest {:?}", path))?;
        if record.hash != *hash {
            return Err(ArchiveError::CorruptEnvelope {
                path,
                reason: format!("manifest records {} instead", record.hash),
            }
            .into());
        }
        Ok(record.chunks)
    }

    fn create_pointer_file_entry_if_not_exists(&self, entry: &PointerFileEntry) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.latest(&entry.rel_path).is_some_and(|l| l.same_mapping(entry)) {
            return Ok(false);
        }
        self.append_entry(&mut state, entry.clone())?;
        Ok(true)
    }

    fn get_current_entries(&self, include_deleted: bool) -> Result<Vec<PointerFileEntry>> {
        let state = self.state.lock().unwrap();
        let mut latest: BTreeMap<&str, &PointerFileEntry> = BTreeMap::new();
        for e in &state.entries {
            match latest.get(e.rel_path.as_str()) {
                Some(b) if b.version > e.version => {}
                _ => {
                    latest.insert(&e.rel_path, e);
                }
            }
        }
        Ok(latest.into_values().filter(|e| include_deleted || !e.is_deleted).cloned().collect())
    }

    fn create_deleted_pointer_file_entry(&self, entry: &PointerFileEntry, version: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.latest(&entry.rel_path).is_some_and(|l| l.is_deleted) {
            return Ok(());
        }
        self.append_entry(&mut state, entry.tombstone(version))
    }
}
