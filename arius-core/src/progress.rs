use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

/// Stage counters shared by the archive and restore pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    FilesIndexed,
    BinariesHashed,
    FastHashed,
    ManifestsCreated,
    ChunksUploaded,
    ChunksDeduplicated,
    BytesUploaded,
    PointersCreated,
    EntriesAdded,
    Tombstones,
    BinariesRemoved,
    OrphanPointers,
    PointersSynced,
    PointersPruned,
    Restored,
    AlreadyRestored,
    HydrationRequested,
    PendingHydration,
    ChunksDownloaded,
    ChunksDecrypted,
    BinariesSkipped,
}

impl Counter {
    const ALL: [Counter; 21] = [
        Counter::FilesIndexed,
        Counter::BinariesHashed,
        Counter::FastHashed,
        Counter::ManifestsCreated,
        Counter::ChunksUploaded,
        Counter::ChunksDeduplicated,
        Counter::BytesUploaded,
        Counter::PointersCreated,
        Counter::EntriesAdded,
        Counter::Tombstones,
        Counter::BinariesRemoved,
        Counter::OrphanPointers,
        Counter::PointersSynced,
        Counter::PointersPruned,
        Counter::Restored,
        Counter::AlreadyRestored,
        Counter::HydrationRequested,
        Counter::PendingHydration,
        Counter::ChunksDownloaded,
        Counter::ChunksDecrypted,
        Counter::BinariesSkipped,
    ];

    fn label(self) -> &'static str {
        match self {
            Counter::FilesIndexed => "indexed",
            Counter::BinariesHashed => "hashed",
            Counter::FastHashed => "fast-hashed",
            Counter::ManifestsCreated => "manifests",
            Counter::ChunksUploaded => "chunks up",
            Counter::ChunksDeduplicated => "deduped",
            Counter::BytesUploaded => "bytes up",
            Counter::PointersCreated => "pointers",
            Counter::EntriesAdded => "entries",
            Counter::Tombstones => "tombstones",
            Counter::BinariesRemoved => "removed",
            Counter::OrphanPointers => "orphans",
            Counter::PointersSynced => "synced",
            Counter::PointersPruned => "pruned",
            Counter::Restored => "restored",
            Counter::AlreadyRestored => "present",
            Counter::HydrationRequested => "hydrating",
            Counter::PendingHydration => "waiting",
            Counter::ChunksDownloaded => "chunks down",
            Counter::ChunksDecrypted => "decrypted",
            Counter::BinariesSkipped => "skipped",
        }
    }
}

/// Counters plus an optional ticker that logs them every few seconds.
#[derive(Clone)]
pub struct Progress {
    enabled: bool,
    stage: Arc<Mutex<String>>,
    counts: Arc<[AtomicU64; 21]>,
    running: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            stage: Arc::new(Mutex::new(String::new())),
            counts: Arc::new(std::array::from_fn(|_| AtomicU64::new(0))),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_stage(&self, s: &str) {
        *self.stage.lock().unwrap() = s.to_string();
    }

    pub fn inc(&self, c: Counter) {
        self.add(c, 1);
    }

    pub fn add(&self, c: Counter, n: u64) {
        self.counts[c as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, c: Counter) -> u64 {
        self.counts[c as usize].load(Ordering::Relaxed)
    }

    fn line(&self) -> String {
        let mut parts = Vec::new();
        for c in Counter::ALL {
            let n = self.get(c);
            if n > 0 {
                parts.push(format!("{} {}", c.label(), n));
            }
        }
        parts.join(" | ")
    }

    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        let me = self.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while me.running.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_secs(5));
                if !me.running.load(Ordering::Relaxed) {
                    break;
                }
                let stage = me.stage.lock().unwrap().clone();
                info!("[{:>4}s] {} | {}", t0.elapsed().as_secs(), stage, me.line());
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}
