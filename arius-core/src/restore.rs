//! Restore pipeline.
//!
//! Pointers are grouped by content hash and classified by their least-ready
//! chunk. Chunks still in the archive tier get one hydration request per run
//! and the pointers waiting on them are left for a later run. Everything else
//! flows through `download batcher ─▶ download ×n ─▶ decrypt ─▶ merge`.
//!
//! Downloaded and decrypted chunks live in `<root>/.arius/restore` until no
//! pending binary needs them, so an interrupted run resumes where it stopped.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::{run_batcher, BatchLimits, Weighed};
use crate::chunker;
use crate::crypto::Encrypter;
use crate::envelope::CHUNK_SUFFIX;
use crate::error::ArchiveError;
use crate::hash::{Hash, HashValueProvider};
use crate::indexer;
use crate::join::{AndJoin, Fault};
use crate::localize::FluentLoc;
use crate::model::{BinaryFile, PointerFile, PointerFileEntry};
use crate::path_safety;
use crate::pointer::{self, POINTER_SUFFIX};
use crate::progress::{Counter, Progress};
use crate::reconcile::{Claim, ExistenceReconciler};
use crate::repository::{hash_from_artifact, BlobRef, BlobState, RemoteRepository};
use crate::retry::{retry, RetryConfig};

const QUEUE_DEPTH: usize = 64;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RestoreOptions {
    /// Mirror the repository's current entries as local pointer files first.
    pub synchronize: bool,
    /// Restore binaries for every local pointer.
    pub download: bool,
    pub keep_pointers: bool,
    pub download_batch: BatchLimits,
    pub download_parallelism: usize,
    pub retry: RetryConfig,
    /// Quoted in the retry warning when content is still hydrating.
    pub hydration_sla_hours: u64,
    /// Defaults to `<root>/.arius/restore`.
    pub work_dir: Option<PathBuf>,
    pub progress: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            synchronize: true,
            download: true,
            keep_pointers: false,
            download_batch: BatchLimits::default(),
            download_parallelism: rayon::current_num_threads().max(1),
            retry: RetryConfig::default(),
            hydration_sla_hours: 15,
            work_dir: None,
            progress: false,
        }
    }
}

/// Where a pointer stands, least ready last. First match wins.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RestoreState {
    Restored,
    Restoring,
    NotYetMerged,
    NotYetDecrypted,
    NotYetDownloaded,
    NotYetHydrated,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub pointers_synced: u64,
    pub pointers_pruned: u64,
    pub restored: u64,
    pub already_restored: u64,
    pub hydration_requested: u64,
    pub pending_hydration: u64,
    pub chunks_downloaded: u64,
    pub chunks_decrypted: u64,
    /// Pointers per state at classification time.
    pub states: BTreeMap<String, u64>,
    /// Set when content is still hydrating; the run itself succeeded.
    pub warning: Option<String>,
}

/// How far a single chunk has come.
#[derive(Clone, Debug)]
enum Readiness {
    Cold(BlobRef),
    Downloadable(BlobRef),
    Downloaded,
    Decrypted,
}

impl Readiness {
    fn rank(&self) -> u8 {
        match self {
            Readiness::Cold(_) => 0,
            Readiness::Downloadable(_) => 1,
            Readiness::Downloaded => 2,
            Readiness::Decrypted => 3,
        }
    }

    fn state(&self) -> RestoreState {
        match self {
            Readiness::Cold(_) => RestoreState::NotYetHydrated,
            Readiness::Downloadable(_) => RestoreState::NotYetDownloaded,
            Readiness::Downloaded => RestoreState::NotYetDecrypted,
            Readiness::Decrypted => RestoreState::NotYetMerged,
        }
    }
}

impl Weighed for BlobRef {
    fn weight(&self) -> u64 {
        self.len
    }
}

struct Want {
    order: Vec<Hash>,
    outstanding: HashSet<Hash>,
    sealed: bool,
}

#[derive(Default)]
struct DemandState {
    wants: HashMap<Hash, Want>,
    /// Unique chunks of manifests released for merge but not merged yet.
    merging: HashMap<Hash, HashSet<Hash>>,
    /// Pending manifests per chunk.
    refs: HashMap<Hash, usize>,
}

/// Per-manifest outstanding chunk sets and per-chunk reference counts.
#[derive(Default)]
pub struct ChunkDemand {
    state: Mutex<DemandState>,
}

impl ChunkDemand {
    /// Register `manifest` as needing `order`. Every chunk starts out
    /// outstanding; the manifest is not released before [`seal`](Self::seal).
    pub fn want(&self, manifest: Hash, order: Vec<Hash>) {
        let mut st = self.state.lock().unwrap();
        let outstanding: HashSet<Hash> = order.iter().copied().collect();
        for c in &outstanding {
            *st.refs.entry(*c).or_insert(0) += 1;
        }
        st.wants.insert(manifest, Want { order, outstanding, sealed: false });
    }

    /// `chunk` is decrypted locally. Returns manifests now ready to merge.
    pub fn available(&self, chunk: Hash) -> Vec<(Hash, Vec<Hash>)> {
        let mut st = self.state.lock().unwrap();
        let ids: Vec<Hash> = st.wants.iter().filter(|(_, w)| w.outstanding.contains(&chunk)).map(|(m, _)| *m).collect();
        let mut ready = Vec::new();
        for m in ids {
            if let Some(w) = st.wants.get_mut(&m) {
                w.outstanding.remove(&chunk);
            }
            if let Some(r) = Self::take_if_ready(&mut st, m) {
                ready.push(r);
            }
        }
        ready
    }

    pub fn seal(&self, manifest: Hash) -> Option<(Hash, Vec<Hash>)> {
        let mut st = self.state.lock().unwrap();
        st.wants.get_mut(&manifest)?.sealed = true;
        Self::take_if_ready(&mut st, manifest)
    }

    fn take_if_ready(st: &mut DemandState, manifest: Hash) -> Option<(Hash, Vec<Hash>)> {
        match st.wants.get(&manifest) {
            Some(w) if w.sealed && w.outstanding.is_empty() => {
                let w = st.wants.remove(&manifest)?;
                st.merging.insert(manifest, w.order.iter().copied().collect());
                Some((manifest, w.order))
            }
            _ => None,
        }
    }

    /// `manifest` was merged. Returns chunks no pending manifest needs.
    pub fn release(&self, manifest: &Hash) -> Vec<Hash> {
        let mut st = self.state.lock().unwrap();
        let Some(chunks) = st.merging.remove(manifest) else {
            return Vec::new();
        };
        let mut free = Vec::new();
        for c in chunks {
            if let Some(n) = st.refs.get_mut(&c) {
                *n -= 1;
                if *n == 0 {
                    st.refs.remove(&c);
                    free.push(c);
                }
            }
        }
        free
    }

    pub fn needed(&self, chunk: &Hash) -> bool {
        self.state.lock().unwrap().refs.contains_key(chunk)
    }

    pub fn pending(&self) -> usize {
        let st = self.state.lock().unwrap();
        st.wants.len() + st.merging.len()
    }
}

/// Make local pointer files match the repository's current entries: create
/// or correct pointers for every current entry, delete pointers whose path
/// has none. Returns `(written, removed)`.
pub fn synchronize(root: &Path, repo: &dyn RemoteRepository) -> Result<(u64, u64)> {
    let entries = repo.get_current_entries(false)?;
    let mut written = 0;
    for e in &entries {
        let ptr = path_safety::resolve(root, &format!("{}{POINTER_SUFFIX}", e.rel_path))?;
        if ptr.exists() {
            let rel = ptr.strip_prefix(root).unwrap_or(&ptr).to_path_buf();
            if pointer::read(root, &rel).is_ok_and(|p| p.hash == e.hash) {
                continue;
            }
        }
        pointer::write(root, Path::new(&e.rel_path), e.hash, e.modified)?;
        debug!(path = %e.rel_path, "pointer synchronized");
        written += 1;
    }
    let current: HashSet<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
    let mut removed = 0;
    for p in indexer::pointers(root)? {
        if !current.contains(p.rel_name().as_str()) {
            fs::remove_file(p.full_path()).with_context(|| format!("remove {:?}", p.full_path()))?;
            debug!(path = %p.rel_name(), "stale pointer removed");
            removed += 1;
        }
    }
    Ok((written, removed))
}

struct Restorer<'a> {
    root: &'a Path,
    repo: &'a dyn RemoteRepository,
    encrypter: &'a dyn Encrypter,
    hasher: Arc<dyn HashValueProvider>,
    opts: &'a RestoreOptions,
    download_dir: PathBuf,
    chunk_dir: PathBuf,
    entries: HashMap<String, PointerFileEntry>,
    /// Claimant plus waiters per content hash; released together at merge.
    manifests: ExistenceReconciler<PointerFile>,
    /// One fetch per chunk per run.
    chunks: ExistenceReconciler<()>,
    /// Chunks a hydration was requested for in this run.
    hydrating: Mutex<HashSet<Hash>>,
    demand: ChunkDemand,
    join: AndJoin,
    fault: Fault,
    progress: Progress,
}

/// Restore pointers under `root` from `repo`.
pub fn restore_run(
    root: &Path,
    repo: &dyn RemoteRepository,
    encrypter: &dyn Encrypter,
    hasher: Arc<dyn HashValueProvider>,
    opts: &RestoreOptions,
) -> Result<RestoreReport> {
    let progress = Progress::new(opts.progress);
    progress.start();
    if opts.synchronize {
        progress.set_stage("synchronize");
        let (written, removed) = synchronize(root, repo)?;
        progress.add(Counter::PointersSynced, written);
        progress.add(Counter::PointersPruned, removed);
    }
    let mut report = RestoreReport::default();
    if opts.download {
        let work_dir = opts.work_dir.clone().unwrap_or_else(|| root.join(".arius").join("restore"));
        let entries = repo.get_current_entries(false)?.into_iter().map(|e| (e.rel_path.clone(), e)).collect();
        let r = Restorer {
            root,
            repo,
            encrypter,
            hasher,
            opts,
            download_dir: work_dir.join("download"),
            chunk_dir: work_dir.join("chunks"),
            entries,
            manifests: ExistenceReconciler::new("restore"),
            chunks: ExistenceReconciler::new("chunk fetch"),
            hydrating: Mutex::new(HashSet::new()),
            demand: ChunkDemand::default(),
            join: AndJoin::new(&[("classify", 1), ("merge", 1)]),
            fault: Fault::new(),
            progress: progress.clone(),
        };
        for dir in [&r.download_dir, &r.chunk_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create {:?}", dir))?;
        }
        let states = r.run();
        let idle = r.demand.pending() == 0 && progress.get(Counter::PendingHydration) == 0;
        let Restorer { fault, .. } = r;
        fault.into_result()?;
        report.states = states?;
        if idle {
            if let Err(e) = fs::remove_dir_all(&work_dir) {
                debug!(dir = %work_dir.display(), error = %e, "work dir not removed");
            }
        }
    }
    progress.stop();

    report.pointers_synced = progress.get(Counter::PointersSynced);
    report.pointers_pruned = progress.get(Counter::PointersPruned);
    report.restored = progress.get(Counter::Restored);
    report.already_restored = progress.get(Counter::AlreadyRestored);
    report.hydration_requested = progress.get(Counter::HydrationRequested);
    report.pending_hydration = progress.get(Counter::PendingHydration);
    report.chunks_downloaded = progress.get(Counter::ChunksDownloaded);
    report.chunks_decrypted = progress.get(Counter::ChunksDecrypted);
    if report.pending_hydration > 0 {
        let msg = FluentLoc::default().msg(
            "restore-hydration-pending",
            &[("count", report.pending_hydration.into()), ("hours", opts.hydration_sla_hours.into())],
        );
        warn!("{msg}");
        report.warning = Some(msg);
    }
    info!(restored = report.restored, present = report.already_restored, pending = report.pending_hydration, "restore finished");
    Ok(report)
}

impl Restorer<'_> {
    fn run(&self) -> Result<BTreeMap<String, u64>> {
        let mut groups: BTreeMap<Hash, Vec<PointerFile>> = BTreeMap::new();
        for p in indexer::pointers(self.root)? {
            groups.entry(p.hash).or_default().push(p);
        }
        let n_down = self.opts.download_parallelism.max(1);
        let (blob_tx, blob_rx) = bounded::<BlobRef>(QUEUE_DEPTH);
        let (batch_tx, batch_rx) = bounded::<Vec<BlobRef>>(n_down);
        let (fetched_tx, fetched_rx) = bounded::<Vec<Hash>>(QUEUE_DEPTH);
        let (merge_tx, merge_rx) = bounded::<(Hash, Vec<Hash>)>(QUEUE_DEPTH);
        let mut states = BTreeMap::new();

        std::thread::scope(|s| {
            let limits = self.opts.download_batch;
            s.spawn(move || run_batcher(blob_rx, batch_tx, limits, "download"));
            for _ in 0..n_down {
                let (rx, tx) = (batch_rx.clone(), fetched_tx.clone());
                s.spawn(move || self.download_stage(rx, tx));
            }
            let (rx, tx) = (fetched_rx, merge_tx.clone());
            s.spawn(move || self.decrypt_stage(rx, tx));
            s.spawn(move || self.merge_stage(merge_rx));
            drop(batch_rx);

            let _arrive = self.join.guard("classify");
            self.progress.set_stage("restore");
            for (hash, group) in groups {
                if self.fault.is_tripped() {
                    break;
                }
                match self.classify_group(hash, group, &blob_tx, &fetched_tx, &merge_tx) {
                    Ok(counts) => {
                        for (state, n) in counts {
                            *states.entry(format!("{state:?}")).or_insert(0) += n;
                        }
                    }
                    Err(e) => self.fault.trip(e),
                }
            }
            drop((blob_tx, fetched_tx, merge_tx));
        });

        if !self.fault.is_tripped() {
            self.chunks.ensure_drained()?;
            self.manifests.ensure_drained()?;
        }
        Ok(states)
    }

    fn target(&self, p: &PointerFile) -> Result<PathBuf> {
        path_safety::resolve(self.root, &p.rel_name())
    }

    /// Classify every pointer for one content hash and start whatever work
    /// the least-ready chunk allows.
    fn classify_group(
        &self,
        hash: Hash,
        group: Vec<PointerFile>,
        blobs: &Sender<BlobRef>,
        fetched: &Sender<Vec<Hash>>,
        merges: &Sender<(Hash, Vec<Hash>)>,
    ) -> Result<Vec<(RestoreState, u64)>> {
        let mut counts = Vec::new();
        let mut todo = Vec::new();
        for p in group {
            let target = self.target(&p)?;
            if target.is_file() {
                let local = BinaryFile::from_path(self.root, &p.binary_rel_path())?;
                if self.hasher.hash_file(&local)? == hash {
                    self.progress.inc(Counter::AlreadyRestored);
                    counts.push((RestoreState::Restored, 1));
                } else {
                    warn!(path = %p.rel_name(), "local file differs from its pointer, not overwriting");
                }
                continue;
            }
            todo.push(p);
        }
        if todo.is_empty() {
            return Ok(counts);
        }
        let mut claimed = false;
        for p in todo {
            match self.manifests.claim_or_wait(hash, p, |_| Ok(false))? {
                Claim::Claimed => claimed = true,
                Claim::Waiting => counts.push((RestoreState::Restoring, 1)),
                Claim::AlreadyExists(p) => warn!(path = %p.rel_name(), "content restored twice in one run"),
            }
        }
        if !claimed {
            return Ok(counts);
        }

        let order = retry(&self.opts.retry, "get chunk hashes", || self.repo.get_chunk_hashes(&hash))?;
        let mut readiness = HashMap::new();
        for c in &order {
            if !readiness.contains_key(c) {
                readiness.insert(*c, self.readiness(c)?);
            }
        }
        let state = readiness
            .values()
            .min_by_key(|r| r.rank())
            .map(Readiness::state)
            .unwrap_or(RestoreState::NotYetMerged);
        debug!(hash = %hash.short(), ?state, "classified");
        counts.push((state, 1));

        if state == RestoreState::NotYetHydrated {
            for r in readiness.values() {
                if let Readiness::Cold(blob) = r {
                    self.request_hydration(blob)?;
                }
            }
            let parked = self.manifests.abandon(&hash);
            self.progress.add(Counter::PendingHydration, parked.len() as u64);
            return Ok(counts);
        }

        self.demand.want(hash, order.clone());
        for (c, r) in readiness {
            let decrypted = self.chunk_path(&c);
            match self.chunks.claim_or_wait(c, (), |_| Ok(decrypted.exists()))? {
                Claim::AlreadyExists(()) => {
                    for ready in self.demand.available(c) {
                        send(merges, ready, "merge")?;
                    }
                }
                Claim::Claimed => match r {
                    Readiness::Downloadable(blob) => send(blobs, blob, "download")?,
                    _ => send(fetched, vec![c], "decrypt")?,
                },
                Claim::Waiting => {}
            }
        }
        if let Some(ready) = self.demand.seal(hash) {
            send(merges, ready, "merge")?;
        }
        Ok(counts)
    }

    fn readiness(&self, chunk: &Hash) -> Result<Readiness> {
        if self.chunk_path(chunk).exists() {
            return Ok(Readiness::Decrypted);
        }
        if self.download_path(chunk).exists() {
            return Ok(Readiness::Downloaded);
        }
        let blob = retry(&self.opts.retry, "chunk state", || self.repo.chunk_blob(chunk))?;
        Ok(match blob.state {
            BlobState::Online | BlobState::Hydrated => Readiness::Downloadable(blob),
            BlobState::Archived | BlobState::Hydrating => Readiness::Cold(blob),
        })
    }

    /// At most one request per chunk per run; not awaited.
    fn request_hydration(&self, blob: &BlobRef) -> Result<()> {
        if blob.state != BlobState::Archived || !self.hydrating.lock().unwrap().insert(blob.hash) {
            return Ok(());
        }
        retry(&self.opts.retry, "hydrate", || self.repo.hydrate(blob))?;
        self.progress.inc(Counter::HydrationRequested);
        Ok(())
    }

    fn chunk_path(&self, h: &Hash) -> PathBuf {
        self.chunk_dir.join(h.to_hex())
    }

    fn download_path(&self, h: &Hash) -> PathBuf {
        self.download_dir.join(format!("{h}{CHUNK_SUFFIX}"))
    }

    fn download_stage(&self, rx: Receiver<Vec<BlobRef>>, tx: Sender<Vec<Hash>>) {
        for batch in rx.iter() {
            if self.fault.is_tripped() {
                continue;
            }
            self.fault.capture(|| {
                let files = retry(&self.opts.retry, "download", || self.repo.download(&batch, &self.download_dir))?;
                self.progress.add(Counter::ChunksDownloaded, files.len() as u64);
                let hashes = files.iter().map(|f| hash_from_artifact(f, CHUNK_SUFFIX)).collect::<Result<Vec<_>>>()?;
                send(&tx, hashes, "decrypt")
            });
        }
    }

    fn decrypt_stage(&self, rx: Receiver<Vec<Hash>>, merges: Sender<(Hash, Vec<Hash>)>) {
        for batch in rx.iter() {
            if self.fault.is_tripped() {
                continue;
            }
            self.fault.capture(|| {
                batch.par_iter().try_for_each(|h| -> Result<()> {
                    let sealed = self.download_path(h);
                    self.encrypter.decrypt(&sealed, &self.chunk_path(h))?;
                    fs::remove_file(&sealed).with_context(|| format!("remove {:?}", sealed))?;
                    self.progress.inc(Counter::ChunksDecrypted);
                    Ok(())
                })?;
                for h in &batch {
                    self.chunks.complete(h)?;
                    for ready in self.demand.available(*h) {
                        send(&merges, ready, "merge")?;
                    }
                }
                Ok(())
            });
        }
    }

    fn merge_stage(&self, rx: Receiver<(Hash, Vec<Hash>)>) {
        let _arrive = self.join.guard("merge");
        let mut deletable = Vec::new();
        for (hash, order) in rx.iter() {
            if self.fault.is_tripped() {
                continue;
            }
            if self.fault.capture(|| self.merge(hash, &order)).is_some() {
                deletable.extend(self.demand.release(&hash));
            }
            // A chunk may only go once no later classification can ask for it.
            if self.join.is_done("classify") {
                self.delete_chunks(&mut deletable);
            }
        }
        self.join.wait_for(&["classify"]);
        self.delete_chunks(&mut deletable);
    }

    fn delete_chunks(&self, deletable: &mut Vec<Hash>) {
        deletable.retain(|c| {
            if self.demand.needed(c) {
                return false;
            }
            let path = self.chunk_path(c);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "could not remove chunk");
                }
            }
            false
        });
    }

    /// Materialize `hash` at every pointer waiting for it.
    fn merge(&self, hash: Hash, order: &[Hash]) -> Result<()> {
        let pointers = self.manifests.complete(&hash)?;
        let Some(first) = pointers.first() else {
            return Ok(());
        };
        let parts: Vec<PathBuf> = order.iter().map(|c| self.chunk_path(c)).collect();
        let target = self.target(first)?;
        chunker::merge(&parts, &target)?;
        let merged = BinaryFile::from_path(self.root, &first.binary_rel_path())?;
        let actual = self.hasher.hash_file(&merged)?;
        if actual != hash {
            let _ = fs::remove_file(&target);
            return Err(ArchiveError::MergeHashMismatch { path: target, expected: hash, actual }.into());
        }
        for p in &pointers {
            let dest = self.target(p)?;
            if dest != target {
                if let Some(dir) = dest.parent() {
                    fs::create_dir_all(dir)?;
                }
                fs::copy(&target, &dest).with_context(|| format!("copy {:?} to {:?}", target, dest))?;
            }
            let modified = self.entries.get(&p.rel_name()).and_then(|e| e.modified).unwrap_or(p.modified);
            pointer::stamp(&dest, Some(modified))?;
            if !self.opts.keep_pointers {
                fs::remove_file(p.full_path()).with_context(|| format!("remove pointer {:?}", p.full_path()))?;
            }
            self.progress.inc(Counter::Restored);
            info!(path = %p.rel_name(), hash = %hash.short(), "restored");
        }
        Ok(())
    }
}

fn send<T>(tx: &Sender<T>, item: T, stage: &str) -> Result<()> {
    tx.send(item).map_err(|_| anyhow!("{stage} stage is no longer accepting work"))
}
