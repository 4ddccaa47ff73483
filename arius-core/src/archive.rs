//! Archive pipeline.
//!
//! ```text
//! index ─▶ hash ×n ─▶ manifest reconciler ─┬─▶ chunk ×n ─▶ encrypt ×n ─▶ batcher ─▶ upload ×n
//!                                          │       │ chunk reconciler                 │
//!                                          │       └──── manifest fan-in ◀────────────┘
//!                                          └──────────────────┴─▶ pointer stage ─▶ tombstones
//! ```
//!
//! Every queue is a bounded channel that closes when its last producer exits,
//! so a stage finishes only after all of its upstream stages have.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::{run_batcher, BatchLimits, Weighed};
use crate::chunker::{ChunkStrategy, Chunker};
use crate::crypto::Encrypter;
use crate::envelope::CHUNK_SUFFIX;
use crate::error::ArchiveError;
use crate::hash::{Hash, HashValueProvider};
use crate::indexer::Indexer;
use crate::join::{AndJoin, Fault};
use crate::model::{same_second, BinaryFile, Chunk, FilePair, PointerFile, PointerFileEntry};
use crate::pointer::{self, POINTER_SUFFIX};
use crate::progress::{Counter, Progress};
use crate::reconcile::{Claim, ExistenceReconciler};
use crate::repository::{RemoteRepository, Tier};
use crate::retry::{retry, RetryConfig};

const QUEUE_DEPTH: usize = 64;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ArchiveOptions {
    /// Trust a pointer's hash when its mtime matches the binary's.
    pub fast_hash: bool,
    /// Delete binaries once their manifest and pointer entry are written.
    pub remove_local: bool,
    pub chunking: ChunkStrategy,
    pub tier: Tier,
    pub upload_batch: BatchLimits,
    pub hash_parallelism: usize,
    pub chunk_parallelism: usize,
    pub upload_parallelism: usize,
    pub retry: RetryConfig,
    /// Version stamped on every entry of this run; defaults to now.
    pub version: Option<DateTime<Utc>>,
    /// Scratch space for chunk and encrypted artifacts; defaults to
    /// `<root>/.arius/archive`.
    pub work_dir: Option<PathBuf>,
    pub progress: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        let n = rayon::current_num_threads().max(1);
        Self {
            fast_hash: false,
            remove_local: false,
            chunking: ChunkStrategy::WholeFile,
            tier: Tier::Archive,
            upload_batch: BatchLimits::default(),
            hash_parallelism: n,
            chunk_parallelism: n,
            upload_parallelism: n,
            retry: RetryConfig::default(),
            version: None,
            work_dir: None,
            progress: false,
        }
    }
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub version: DateTime<Utc>,
    pub files_indexed: u64,
    pub binaries_hashed: u64,
    pub fast_hashed: u64,
    pub manifests_created: u64,
    pub chunks_uploaded: u64,
    pub chunks_deduplicated: u64,
    pub bytes_uploaded: u64,
    pub pointers_created: u64,
    pub entries_added: u64,
    pub tombstones: u64,
    pub binaries_removed: u64,
    pub orphan_pointers: u64,
    /// Binaries that vanished or became unreadable before they were hashed.
    pub binaries_skipped: u64,
}

impl ArchiveReport {
    fn from_progress(version: DateTime<Utc>, p: &Progress) -> Self {
        Self {
            version,
            files_indexed: p.get(Counter::FilesIndexed),
            binaries_hashed: p.get(Counter::BinariesHashed),
            fast_hashed: p.get(Counter::FastHashed),
            manifests_created: p.get(Counter::ManifestsCreated),
            chunks_uploaded: p.get(Counter::ChunksUploaded),
            chunks_deduplicated: p.get(Counter::ChunksDeduplicated),
            bytes_uploaded: p.get(Counter::BytesUploaded),
            pointers_created: p.get(Counter::PointersCreated),
            entries_added: p.get(Counter::EntriesAdded),
            tombstones: p.get(Counter::Tombstones),
            binaries_removed: p.get(Counter::BinariesRemoved),
            orphan_pointers: p.get(Counter::OrphanPointers),
            binaries_skipped: p.get(Counter::BinariesSkipped),
        }
    }
}

/// A binary whose content hash is known.
#[derive(Clone, Debug)]
struct HashedBinary {
    binary: BinaryFile,
    pointer: Option<PointerFile>,
    hash: Hash,
}

/// Work for the pointer stage.
enum Ready {
    Binary(HashedBinary),
    Pointer(PointerFile),
}

/// An encrypted chunk waiting for upload.
struct Sealed {
    hash: Hash,
    path: PathBuf,
    len: u64,
}

impl Weighed for Sealed {
    fn weight(&self) -> u64 {
        self.len
    }
}

#[derive(Default)]
struct FanInEntry {
    chunks: Vec<Hash>,
    pending: HashSet<Hash>,
    sealed: bool,
}

/// Tracks, per binary being archived, which of its chunks are not yet known
/// to be in the repository. A binary's manifest may be written once it is
/// sealed (all chunks enumerated) and nothing is pending.
#[derive(Default)]
pub struct ManifestFanIn {
    open: Mutex<HashMap<Hash, FanInEntry>>,
}

impl ManifestFanIn {
    pub fn register(&self, binary: Hash) {
        self.open.lock().unwrap().entry(binary).or_default();
    }

    /// Record that `binary` needs `chunk`. Must precede the chunk's claim so
    /// a completion racing with the claim is never lost.
    pub fn expect(&self, binary: Hash, chunk: Hash) {
        self.open.lock().unwrap().entry(binary).or_default().pending.insert(chunk);
    }

    /// `chunk` is available for `binary`. Returns the chunk list if the
    /// manifest became writable.
    pub fn satisfied(&self, binary: Hash, chunk: Hash) -> Option<Vec<Hash>> {
        let mut open = self.open.lock().unwrap();
        let entry = open.get_mut(&binary)?;
        entry.pending.remove(&chunk);
        Self::take_if_ready(&mut open, binary)
    }

    /// All chunks of `binary` have been enumerated.
    pub fn seal(&self, binary: Hash, chunks: Vec<Hash>) -> Option<Vec<Hash>> {
        let mut open = self.open.lock().unwrap();
        let entry = open.entry(binary).or_default();
        entry.chunks = chunks;
        entry.sealed = true;
        Self::take_if_ready(&mut open, binary)
    }

    /// `chunk` finished uploading; `binaries` are those that were waiting on
    /// it. Returns every manifest that became writable.
    pub fn chunk_done(&self, chunk: Hash, binaries: &[Hash]) -> Vec<(Hash, Vec<Hash>)> {
        let mut open = self.open.lock().unwrap();
        let mut ready = Vec::new();
        for b in binaries {
            if let Some(entry) = open.get_mut(b) {
                entry.pending.remove(&chunk);
            }
            if let Some(list) = Self::take_if_ready(&mut open, *b) {
                ready.push((*b, list));
            }
        }
        ready
    }

    fn take_if_ready(open: &mut HashMap<Hash, FanInEntry>, binary: Hash) -> Option<Vec<Hash>> {
        match open.get(&binary) {
            Some(e) if e.sealed && e.pending.is_empty() => open.remove(&binary).map(|e| e.chunks),
            _ => None,
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().unwrap().len()
    }
}

/// Local file deleted or locked between indexing and reading.
fn is_local_race(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<std::io::Error>().is_some_and(|io| {
            matches!(io.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied)
        })
    })
}

fn send<T>(tx: &Sender<T>, item: T, stage: &str) -> Result<()> {
    tx.send(item).map_err(|_| anyhow!("{stage} stage is no longer accepting work"))
}

struct Archiver<'a> {
    root: &'a Path,
    repo: &'a dyn RemoteRepository,
    encrypter: &'a dyn Encrypter,
    hasher: Arc<dyn HashValueProvider>,
    chunker: Chunker,
    opts: &'a ArchiveOptions,
    version: DateTime<Utc>,
    work_dir: PathBuf,
    manifests: ExistenceReconciler<HashedBinary>,
    /// Waiters are the hashes of binaries that need the chunk.
    chunks: ExistenceReconciler<Hash>,
    fanin: ManifestFanIn,
    join: AndJoin,
    fault: Fault,
    progress: Progress,
}

/// Archive every file under `root` into `repo`.
pub fn archive_run(
    root: &Path,
    repo: &dyn RemoteRepository,
    encrypter: &dyn Encrypter,
    hasher: Arc<dyn HashValueProvider>,
    opts: &ArchiveOptions,
) -> Result<ArchiveReport> {
    let version = opts.version.unwrap_or_else(Utc::now).trunc_subsecs(0);
    let work_dir = opts.work_dir.clone().unwrap_or_else(|| root.join(".arius").join("archive"));
    fs::create_dir_all(&work_dir).with_context(|| format!("create work dir {:?}", work_dir))?;
    let n_hash = opts.hash_parallelism.max(1);
    let n_chunk = opts.chunk_parallelism.max(1);
    let n_upload = opts.upload_parallelism.max(1);

    let a = Archiver {
        root,
        repo,
        encrypter,
        chunker: Chunker::new(opts.chunking, hasher.clone()),
        hasher,
        opts,
        version,
        work_dir,
        manifests: ExistenceReconciler::new("manifest"),
        chunks: ExistenceReconciler::new("chunk"),
        fanin: ManifestFanIn::default(),
        join: AndJoin::new(&[
            ("index", 1),
            ("hash", n_hash),
            ("chunk", n_chunk),
            ("encrypt", n_chunk),
            ("batch", 1),
            ("upload", n_upload),
            ("pointer", 1),
        ]),
        fault: Fault::new(),
        progress: Progress::new(opts.progress),
    };
    info!(root = %root.display(), %version, "archive started");
    a.progress.set_stage("archive");
    a.progress.start();

    let indexer = Indexer::new(root)?;
    let (pair_tx, pair_rx) = bounded::<FilePair>(QUEUE_DEPTH);
    let (claimed_tx, claimed_rx) = bounded::<HashedBinary>(QUEUE_DEPTH);
    let (chunk_tx, chunk_rx) = bounded::<Chunk>(QUEUE_DEPTH);
    let (sealed_tx, sealed_rx) = bounded::<Sealed>(QUEUE_DEPTH);
    let (batch_tx, batch_rx) = bounded::<Vec<Sealed>>(n_upload);
    let (ready_tx, ready_rx) = bounded::<Ready>(QUEUE_DEPTH);

    std::thread::scope(|s| {
        let a = &a;
        s.spawn(move || a.index_stage(&indexer, pair_tx));
        for _ in 0..n_hash {
            let (rx, claimed, ready) = (pair_rx.clone(), claimed_tx.clone(), ready_tx.clone());
            s.spawn(move || a.hash_stage(rx, claimed, ready));
        }
        for _ in 0..n_chunk {
            let (rx, chunks, ready) = (claimed_rx.clone(), chunk_tx.clone(), ready_tx.clone());
            s.spawn(move || a.chunk_stage(rx, chunks, ready));
        }
        for _ in 0..n_chunk {
            let (rx, tx) = (chunk_rx.clone(), sealed_tx.clone());
            s.spawn(move || a.encrypt_stage(rx, tx));
        }
        let limits = opts.upload_batch;
        s.spawn(move || {
            let _arrive = a.join.guard("batch");
            run_batcher(sealed_rx, batch_tx, limits, "upload");
        });
        for _ in 0..n_upload {
            let (rx, ready) = (batch_rx.clone(), ready_tx.clone());
            s.spawn(move || a.upload_stage(rx, ready));
        }
        s.spawn(move || a.pointer_stage(ready_rx));
        s.spawn(move || a.drain_check());
        drop((pair_rx, claimed_tx, claimed_rx, chunk_tx, chunk_rx, sealed_tx, batch_rx, ready_tx));
    });

    if !a.fault.is_tripped() {
        a.progress.set_stage("tombstones");
        a.fault.capture(|| a.tombstone_pass());
    }
    a.progress.stop();

    let Archiver { fault, progress, work_dir, .. } = a;
    fault.into_result()?;
    if let Err(e) = fs::remove_dir_all(&work_dir) {
        debug!(dir = %work_dir.display(), error = %e, "work dir not removed");
    }
    let report = ArchiveReport::from_progress(version, &progress);
    info!(
        manifests = report.manifests_created,
        chunks = report.chunks_uploaded,
        bytes = report.bytes_uploaded,
        entries = report.entries_added,
        tombstones = report.tombstones,
        "archive finished"
    );
    Ok(report)
}

impl Archiver<'_> {
    fn index_stage(&self, indexer: &Indexer, tx: Sender<FilePair>) {
        let _arrive = self.join.guard("index");
        for pair in indexer.pairs() {
            if self.fault.is_tripped() {
                break;
            }
            match pair {
                Ok(p) => {
                    self.progress.inc(Counter::FilesIndexed);
                    if tx.send(p).is_err() {
                        break;
                    }
                }
                // Vanished or unreadable between listing and stat.
                Err(e) => warn!("skipping: {e:#}"),
            }
        }
    }

    fn hash_stage(&self, rx: Receiver<FilePair>, claimed: Sender<HashedBinary>, ready: Sender<Ready>) {
        let _arrive = self.join.guard("hash");
        for pair in rx.iter() {
            if self.fault.is_tripped() {
                continue;
            }
            self.fault.capture(|| self.hash_pair(pair, &claimed, &ready));
        }
    }

    fn hash_pair(&self, pair: FilePair, claimed: &Sender<HashedBinary>, ready: &Sender<Ready>) -> Result<()> {
        let item = match pair {
            FilePair::PointerOnly(p) => {
                let exists = retry(&self.opts.retry, "manifest exists", || self.repo.manifest_exists(&p.hash))?;
                if exists {
                    send(ready, Ready::Pointer(p), "pointer")?;
                } else {
                    warn!(pointer = %p.rel_path.display(), hash = %p.hash.short(), "pointer has no archived content, skipping");
                    self.progress.inc(Counter::OrphanPointers);
                }
                return Ok(());
            }
            FilePair::BinaryOnly(binary) => {
                let Some(hash) = self.hash_or_skip(&binary)? else { return Ok(()) };
                HashedBinary { binary, pointer: None, hash }
            }
            FilePair::BinaryWithPointer { binary, pointer } => {
                if self.opts.fast_hash && same_second(binary.modified, pointer.modified) {
                    self.progress.inc(Counter::FastHashed);
                    let hash = pointer.hash;
                    HashedBinary { binary, pointer: Some(pointer), hash }
                } else {
                    let Some(hash) = self.hash_or_skip(&binary)? else { return Ok(()) };
                    if !self.opts.fast_hash && hash != pointer.hash {
                        return Err(ArchiveError::FastHashMismatch {
                            pointer: pointer.full_path(),
                            recorded: pointer.hash,
                            actual: hash,
                        }
                        .into());
                    }
                    HashedBinary { binary, pointer: Some(pointer), hash }
                }
            }
        };
        let hash = item.hash;
        let for_chunking = item.clone();
        let claim = self.manifests.claim_or_wait(hash, item, |h| {
            retry(&self.opts.retry, "manifest exists", || self.repo.manifest_exists(h))
        })?;
        match claim {
            Claim::AlreadyExists(item) => send(ready, Ready::Binary(item), "pointer"),
            Claim::Claimed => {
                debug!(hash = %hash.short(), binary = %for_chunking.binary.rel_name(), "manifest claimed");
                send(claimed, for_chunking, "chunk")
            }
            Claim::Waiting => {
                debug!(hash = %hash.short(), binary = %for_chunking.binary.rel_name(), "waiting for manifest");
                Ok(())
            }
        }
    }

    /// `None` when the binary disappeared or became unreadable after indexing.
    fn hash_or_skip(&self, binary: &BinaryFile) -> Result<Option<Hash>> {
        match self.hash_binary(binary) {
            Ok(h) => Ok(Some(h)),
            Err(e) if is_local_race(&e) => {
                warn!(path = %binary.rel_name(), "skipping: {e:#}");
                self.progress.inc(Counter::BinariesSkipped);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn hash_binary(&self, binary: &BinaryFile) -> Result<Hash> {
        let h = self
            .hasher
            .hash_file(binary)
            .with_context(|| format!("hash {:?}", binary.full_path()))?;
        self.progress.inc(Counter::BinariesHashed);
        Ok(h)
    }

    fn chunk_stage(&self, rx: Receiver<HashedBinary>, chunks: Sender<Chunk>, ready: Sender<Ready>) {
        let _arrive = self.join.guard("chunk");
        for item in rx.iter() {
            if self.fault.is_tripped() {
                continue;
            }
            self.fault.capture(|| self.chunk_binary(item, &chunks, &ready));
        }
    }

    fn chunk_binary(&self, item: HashedBinary, chunks: &Sender<Chunk>, ready: &Sender<Ready>) -> Result<()> {
        let binary_hash = item.hash;
        self.fanin.register(binary_hash);
        let scratch = self.work_dir.join("chunks").join(binary_hash.to_hex());
        let list = self.chunker.chunk(&item.binary, binary_hash, &scratch)?;
        let mut seen = HashSet::new();
        for chunk in &list {
            if !seen.insert(chunk.hash) {
                continue;
            }
            self.fanin.expect(binary_hash, chunk.hash);
            let claim = self.chunks.claim_or_wait(chunk.hash, binary_hash, |h| {
                retry(&self.opts.retry, "chunk exists", || self.repo.chunk_exists(h))
            })?;
            match claim {
                Claim::AlreadyExists(_) => {
                    chunk.discard()?;
                    self.progress.inc(Counter::ChunksDeduplicated);
                    if let Some(order) = self.fanin.satisfied(binary_hash, chunk.hash) {
                        self.finish_manifest(binary_hash, order, ready)?;
                    }
                }
                Claim::Claimed => send(chunks, chunk.clone(), "encrypt")?,
                Claim::Waiting => {
                    chunk.discard()?;
                    self.progress.inc(Counter::ChunksDeduplicated);
                }
            }
        }
        let order = list.iter().map(|c| c.hash).collect();
        if let Some(order) = self.fanin.seal(binary_hash, order) {
            self.finish_manifest(binary_hash, order, ready)?;
        }
        Ok(())
    }

    /// Every chunk of `binary` is in the repository: write its manifest and
    /// release everything that was waiting on it.
    fn finish_manifest(&self, binary: Hash, chunks: Vec<Hash>, ready: &Sender<Ready>) -> Result<()> {
        retry(&self.opts.retry, "add manifest", || self.repo.add_manifest(&binary, &chunks))?;
        self.progress.inc(Counter::ManifestsCreated);
        debug!(hash = %binary.short(), chunks = chunks.len(), "manifest written");
        for item in self.manifests.complete(&binary)? {
            send(ready, Ready::Binary(item), "pointer")?;
        }
        Ok(())
    }

    fn encrypt_stage(&self, rx: Receiver<Chunk>, tx: Sender<Sealed>) {
        let _arrive = self.join.guard("encrypt");
        for chunk in rx.iter() {
            if self.fault.is_tripped() {
                let _ = chunk.discard();
                continue;
            }
            self.fault.capture(|| {
                let path = self.work_dir.join("upload").join(format!("{}{CHUNK_SUFFIX}", chunk.hash));
                let len = if chunk.artifact {
                    self.encrypter.encrypt_and_remove(&chunk.path, &path)?
                } else {
                    self.encrypter.encrypt(&chunk.path, &path)?
                };
                send(&tx, Sealed { hash: chunk.hash, path, len }, "upload")
            });
        }
    }

    fn upload_stage(&self, rx: Receiver<Vec<Sealed>>, ready: Sender<Ready>) {
        let _arrive = self.join.guard("upload");
        for batch in rx.iter() {
            if self.fault.is_tripped() {
                for s in &batch {
                    let _ = fs::remove_file(&s.path);
                }
                continue;
            }
            self.fault.capture(|| self.upload_batch(batch, &ready));
        }
    }

    fn upload_batch(&self, batch: Vec<Sealed>, ready: &Sender<Ready>) -> Result<()> {
        let paths: Vec<PathBuf> = batch.iter().map(|s| s.path.clone()).collect();
        let bytes: u64 = batch.iter().map(|s| s.len).sum();
        retry(&self.opts.retry, "upload", || self.repo.upload(&paths, self.opts.tier))?;
        debug!(chunks = batch.len(), bytes, "batch uploaded");
        self.progress.add(Counter::ChunksUploaded, batch.len() as u64);
        self.progress.add(Counter::BytesUploaded, bytes);
        for s in &batch {
            fs::remove_file(&s.path).with_context(|| format!("remove {:?}", s.path))?;
        }
        for s in &batch {
            let waiting = self.chunks.complete(&s.hash)?;
            for (binary, order) in self.fanin.chunk_done(s.hash, &waiting) {
                self.finish_manifest(binary, order, ready)?;
            }
        }
        Ok(())
    }

    fn pointer_stage(&self, rx: Receiver<Ready>) {
        let _arrive = self.join.guard("pointer");
        for ready in rx.iter() {
            if self.fault.is_tripped() {
                continue;
            }
            self.fault.capture(|| match ready {
                Ready::Pointer(p) => self.record_entry(&PointerFileEntry::for_pointer(&p, self.version)),
                Ready::Binary(item) => self.finish_binary(item),
            });
        }
    }

    fn finish_binary(&self, item: HashedBinary) -> Result<()> {
        let HashedBinary { binary, pointer, hash } = item;
        match pointer {
            Some(p) if p.hash == hash => {
                if !same_second(p.modified, binary.modified) {
                    pointer::stamp(&p.full_path(), Some(binary.modified))?;
                }
            }
            _ => {
                pointer::write_for_binary(&binary, hash)?;
                self.progress.inc(Counter::PointersCreated);
            }
        }
        self.record_entry(&PointerFileEntry::for_binary(&binary, hash, self.version))?;
        if self.opts.remove_local {
            let path = binary.full_path();
            fs::remove_file(&path).with_context(|| format!("remove archived binary {:?}", path))?;
            self.progress.inc(Counter::BinariesRemoved);
        }
        Ok(())
    }

    fn record_entry(&self, entry: &PointerFileEntry) -> Result<()> {
        let added = retry(&self.opts.retry, "add entry", || {
            self.repo.create_pointer_file_entry_if_not_exists(entry)
        })?;
        if added {
            self.progress.inc(Counter::EntriesAdded);
        }
        Ok(())
    }

    /// Once every stage that claims or completes has exited, no claim may be
    /// left open.
    fn drain_check(&self) {
        self.join.wait_for(&["hash", "chunk", "upload"]);
        if self.fault.is_tripped() {
            return;
        }
        for res in [self.chunks.ensure_drained(), self.manifests.ensure_drained()] {
            if let Err(e) = res {
                self.fault.trip(e);
            }
        }
        if self.fanin.open_count() > 0 {
            self.fault.trip(
                ArchiveError::StrandedWaiters { kind: "manifest fan-in", count: self.fanin.open_count() }.into(),
            );
        }
    }

    /// Tombstone every current entry whose pointer is gone and that this run
    /// did not touch.
    fn tombstone_pass(&self) -> Result<()> {
        for entry in self.repo.get_current_entries(false)? {
            if entry.version >= self.version {
                continue;
            }
            let ptr = self.root.join(format!("{}{POINTER_SUFFIX}", entry.rel_path));
            if ptr.exists() {
                continue;
            }
            retry(&self.opts.retry, "tombstone", || {
                self.repo.create_deleted_pointer_file_entry(&entry, self.version)
            })?;
            self.progress.inc(Counter::Tombstones);
            debug!(path = %entry.rel_path, "tombstoned");
        }
        Ok(())
    }
}
