#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use arius_core::archive::ArchiveOptions;
use arius_core::crypto::{AesGcmEncrypter, Encrypter, KdfCost};
use arius_core::error::ArchiveError;
use arius_core::hash::{Hash, HashValueProvider, SaltedHasher};
use arius_core::local::LocalRepository;
use arius_core::model::{BinaryFile, PointerFileEntry};
use arius_core::repository::{BlobRef, RemoteRepository, Tier};
use arius_core::restore::RestoreOptions;
use arius_core::retry::RetryConfig;
use chrono::{DateTime, TimeZone, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const PASSPHRASE: &str = "correct horse battery staple";

/// Forwards to a [`LocalRepository`] and counts the calls made.
pub struct CountingRepo {
    pub inner: LocalRepository,
    pub manifest_exists: AtomicUsize,
    pub chunk_exists: AtomicUsize,
    pub hydrate: AtomicUsize,
    pub download: AtomicUsize,
    pub add_manifest: AtomicUsize,
    pub uploaded: Mutex<Vec<PathBuf>>,
}

impl CountingRepo {
    pub fn new(inner: LocalRepository) -> Self {
        Self {
            inner,
            manifest_exists: AtomicUsize::new(0),
            chunk_exists: AtomicUsize::new(0),
            hydrate: AtomicUsize::new(0),
            download: AtomicUsize::new(0),
            add_manifest: AtomicUsize::new(0),
            uploaded: Mutex::new(Vec::new()),
        }
    }

    pub fn reset(&self) {
        for c in [&self.manifest_exists, &self.chunk_exists, &self.hydrate, &self.download, &self.add_manifest] {
            c.store(0, Ordering::SeqCst);
        }
        self.uploaded.lock().unwrap().clear();
    }

    pub fn count(c: &AtomicUsize) -> usize {
        c.load(Ordering::SeqCst)
    }

    /// Upload names without directories, in upload order.
    pub fn uploaded_names(&self) -> Vec<String> {
        let up = self.uploaded.lock().unwrap();
        up.iter().map(|p| p.file_name().unwrap().to_string_lossy().to_string()).collect()
    }
}

impl RemoteRepository for CountingRepo {
    fn manifest_exists(&self, hash: &Hash) -> Result<bool> {
        self.manifest_exists.fetch_add(1, Ordering::SeqCst);
        self.inner.manifest_exists(hash)
    }
    fn chunk_exists(&self, hash: &Hash) -> Result<bool> {
        self.chunk_exists.fetch_add(1, Ordering::SeqCst);
        self.inner.chunk_exists(hash)
    }
    fn upload(&self, files: &[PathBuf], tier: Tier) -> Result<()> {
        self.uploaded.lock().unwrap().extend_from_slice(files);
        self.inner.upload(files, tier)
    }
    fn chunk_blob(&self, hash: &Hash) -> Result<BlobRef> {
        self.inner.chunk_blob(hash)
    }
    fn download(&self, blobs: &[BlobRef], target_dir: &Path) -> Result<Vec<PathBuf>> {
        self.download.fetch_add(blobs.len(), Ordering::SeqCst);
        self.inner.download(blobs, target_dir)
    }
    fn hydrate(&self, blob: &BlobRef) -> Result<()> {
        self.hydrate.fetch_add(1, Ordering::SeqCst);
        self.inner.hydrate(blob)
    }
    fn add_manifest(&self, hash: &Hash, chunks: &[Hash]) -> Result<()> {
        self.add_manifest.fetch_add(1, Ordering::SeqCst);
        self.inner.add_manifest(hash, chunks)
    }
    fn get_chunk_hashes(&self, hash: &Hash) -> Result<Vec<Hash>> {
        self.inner.get_chunk_hashes(hash)
    }
    fn create_pointer_file_entry_if_not_exists(&self, entry: &PointerFileEntry) -> Result<bool> {
        self.inner.create_pointer_file_entry_if_not_exists(entry)
    }
    fn get_current_entries(&self, include_deleted: bool) -> Result<Vec<PointerFileEntry>> {
        self.inner.get_current_entries(include_deleted)
    }
    fn create_deleted_pointer_file_entry(&self, entry: &PointerFileEntry, version: DateTime<Utc>) -> Result<()> {
        self.inner.create_deleted_pointer_file_entry(entry, version)
    }
}

/// Salted hasher that counts whole-file hashes.
pub struct CountingHasher {
    inner: SaltedHasher,
    pub files: AtomicUsize,
}

impl CountingHasher {
    pub fn new() -> Self {
        Self { inner: SaltedHasher::new(PASSPHRASE), files: AtomicUsize::new(0) }
    }
}

impl HashValueProvider for CountingHasher {
    fn hash_bytes(&self, data: &[u8]) -> Hash {
        self.inner.hash_bytes(data)
    }
    fn hasher(&self) -> blake3::Hasher {
        self.inner.hasher()
    }
    fn hash_file(&self, binary: &BinaryFile) -> Result<Hash> {
        self.files.fetch_add(1, Ordering::SeqCst);
        self.inner.hash_file(binary)
    }
}

pub struct Fixture {
    pub root: tempfile::TempDir,
    pub repo_dir: tempfile::TempDir,
    pub repo: CountingRepo,
    pub enc: Arc<dyn Encrypter>,
    pub hasher: Arc<CountingHasher>,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let repo_dir = tempfile::tempdir().unwrap();
        let enc: Arc<dyn Encrypter> = Arc::new(AesGcmEncrypter::with_cost(PASSPHRASE, KdfCost::testing()));
        let repo = CountingRepo::new(LocalRepository::open(repo_dir.path(), enc.clone()).unwrap());
        Self { root, repo_dir, repo, enc, hasher: Arc::new(CountingHasher::new()) }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn hasher(&self) -> Arc<dyn HashValueProvider> {
        self.hasher.clone()
    }

    pub fn hash_of(&self, data: &[u8]) -> Hash {
        SaltedHasher::new(PASSPHRASE).hash_bytes(data)
    }

    pub fn write(&self, rel: &str, data: &[u8]) -> PathBuf {
        let p = self.root().join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(&p, data).unwrap();
        p
    }
}

pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

pub fn version(n: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + n * 60, 0).unwrap()
}

pub fn archive_opts(n: i64) -> ArchiveOptions {
    ArchiveOptions {
        tier: Tier::Cool,
        version: Some(version(n)),
        hash_parallelism: 2,
        chunk_parallelism: 2,
        upload_parallelism: 2,
        retry: RetryConfig { max_retries: 2, retry_delay_ms: 1, retry_max_delay_ms: 2 },
        ..ArchiveOptions::default()
    }
}

pub fn restore_opts() -> RestoreOptions {
    RestoreOptions {
        download_parallelism: 2,
        retry: RetryConfig { max_retries: 2, retry_delay_ms: 1, retry_max_delay_ms: 2 },
        ..RestoreOptions::default()
    }
}

pub fn set_mtime(path: &Path, secs_ago: u64) {
    let t = SystemTime::now() - Duration::from_secs(secs_ago);
    let f = std::fs::File::options().write(true).open(path).unwrap();
    f.set_times(std::fs::FileTimes::new().set_modified(t)).unwrap();
}

pub fn mtime_secs(path: &Path) -> i64 {
    let m = std::fs::metadata(path).unwrap().modified().unwrap();
    DateTime::<Utc>::from(m).timestamp()
}

/// Injects failures in front of a [`CountingRepo`].
pub struct FaultyRepo<'a> {
    pub inner: &'a CountingRepo,
    /// Uploads left to fail before delegating.
    pub failing_uploads: AtomicUsize,
    /// Whether injected upload failures are retryable.
    pub transient: bool,
    /// Chunk list reported for every manifest instead of the stored one.
    pub chunk_override: Option<Vec<Hash>>,
}

impl<'a> FaultyRepo<'a> {
    pub fn new(inner: &'a CountingRepo) -> Self {
        Self { inner, failing_uploads: AtomicUsize::new(0), transient: true, chunk_override: None }
    }

    pub fn failing_uploads(self, n: usize, transient: bool) -> Self {
        self.failing_uploads.store(n, Ordering::SeqCst);
        Self { transient, ..self }
    }
}

impl RemoteRepository for FaultyRepo<'_> {
    fn manifest_exists(&self, hash: &Hash) -> Result<bool> {
        self.inner.manifest_exists(hash)
    }
    fn chunk_exists(&self, hash: &Hash) -> Result<bool> {
        self.inner.chunk_exists(hash)
    }
    fn upload(&self, files: &[PathBuf], tier: Tier) -> Result<()> {
        let left = self.failing_uploads.load(Ordering::SeqCst);
        if left > 0 {
            self.failing_uploads.store(left - 1, Ordering::SeqCst);
            if self.transient {
                return Err(ArchiveError::Transient("injected upload failure".into()).into());
            }
            anyhow::bail!("upload rejected");
        }
        self.inner.upload(files, tier)
    }
    fn chunk_blob(&self, hash: &Hash) -> Result<BlobRef> {
        self.inner.chunk_blob(hash)
    }
    fn download(&self, blobs: &[BlobRef], target_dir: &Path) -> Result<Vec<PathBuf>> {
        self.inner.download(blobs, target_dir)
    }
    fn hydrate(&self, blob: &BlobRef) -> Result<()> {
        self.inner.hydrate(blob)
    }
    fn add_manifest(&self, hash: &Hash, chunks: &[Hash]) -> Result<()> {
        self.inner.add_manifest(hash, chunks)
    }
    fn get_chunk_hashes(&self, hash: &Hash) -> Result<Vec<Hash>> {
        match &self.chunk_override {
            Some(list) => Ok(list.clone()),
            None => self.inner.get_chunk_hashes(hash),
        }
    }
    fn create_pointer_file_entry_if_not_exists(&self, entry: &PointerFileEntry) -> Result<bool> {
        self.inner.create_pointer_file_entry_if_not_exists(entry)
    }
    fn get_current_entries(&self, include_deleted: bool) -> Result<Vec<PointerFileEntry>> {
        self.inner.get_current_entries(include_deleted)
    }
    fn create_deleted_pointer_file_entry(&self, entry: &PointerFileEntry, version: DateTime<Utc>) -> Result<()> {
        self.inner.create_deleted_pointer_file_entry(entry, version)
    }
}
