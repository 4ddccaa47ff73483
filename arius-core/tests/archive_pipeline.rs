mod common;

use std::sync::atomic::Ordering;

use arius_core::archive::archive_run;
use arius_core::chunker::ChunkStrategy;
use arius_core::error::ArchiveError;
use arius_core::hash::{Hash, HashValueProvider};
use arius_core::model::BinaryFile;
use arius_core::repository::RemoteRepository;
use arius_core::rolling::RollingParams;
use common::*;

#[test]
fn identical_files_share_one_manifest_and_upload() {
    let fx = Fixture::new();
    let data = random_bytes(100, 1);
    fx.write("a.bin", &data);
    fx.write("b.bin", &data);

    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap();

    assert_eq!(r.manifests_created, 1);
    assert_eq!(r.chunks_uploaded, 1);
    assert_eq!(fx.repo.uploaded_names(), vec![format!("{}.ae", fx.hash_of(&data))]);
    assert_eq!(CountingRepo::count(&fx.repo.manifest_exists), 1);
    assert_eq!(CountingRepo::count(&fx.repo.chunk_exists), 1);
    assert_eq!(CountingRepo::count(&fx.repo.add_manifest), 1);

    let entries = fx.repo.get_current_entries(false).unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.rel_path.as_str()).collect();
    assert_eq!(names, vec!["a.bin", "b.bin"]);
    assert!(entries.iter().all(|e| e.hash == fx.hash_of(&data) && e.version == version(1)));
    assert!(fx.root().join("a.bin.pointer.arius").is_file());
    assert!(fx.root().join("b.bin.pointer.arius").is_file());
    assert_eq!(r.pointers_created, 2);
    assert!(!fx.root().join(".arius").join("archive").exists());
}

#[test]
fn same_content_at_new_path_only_adds_an_entry() {
    let fx = Fixture::new();
    let data = random_bytes(4096, 2);
    fx.write("first/a.bin", &data);
    archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap();
    fx.repo.reset();

    fx.write("second/c.bin", &data);
    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(2)).unwrap();

    assert_eq!(r.manifests_created, 0);
    assert_eq!(r.chunks_uploaded, 0);
    assert!(fx.repo.uploaded_names().is_empty());
    assert_eq!(CountingRepo::count(&fx.repo.manifest_exists), 1, "probed once, then known");
    assert_eq!(CountingRepo::count(&fx.repo.chunk_exists), 0);
    assert_eq!(r.entries_added, 1);
    let current = fx.repo.get_current_entries(false).unwrap();
    assert_eq!(current.len(), 2);
    assert_eq!(current[1].rel_path, "second/c.bin");
    assert_eq!(current[1].version, version(2));
}

#[test]
fn rerun_without_changes_writes_nothing() {
    let fx = Fixture::new();
    fx.write("a.bin", &random_bytes(1000, 3));
    fx.write("sub/b.bin", &random_bytes(1000, 4));
    archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap();

    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(2)).unwrap();
    assert_eq!(r.entries_added, 0);
    assert_eq!(r.tombstones, 0);
    assert_eq!(r.chunks_uploaded, 0);
    assert_eq!(fx.repo.inner.history("a.bin").len(), 1);
}

#[test]
fn fast_hash_trusts_pointer_with_matching_mtime() {
    let fx = Fixture::new();
    fx.write("a.bin", &random_bytes(2048, 5));
    fx.write("b.bin", &random_bytes(2048, 6));
    archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap();
    assert_eq!(fx.hasher.files.load(Ordering::SeqCst), 2);

    fx.hasher.files.store(0, Ordering::SeqCst);
    let mut o = archive_opts(2);
    o.fast_hash = true;
    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &o).unwrap();
    assert_eq!(fx.hasher.files.load(Ordering::SeqCst), 0);
    assert_eq!(r.fast_hashed, 2);

    // Different mtime: hashed exactly once, and the pointer is restamped.
    set_mtime(&fx.root().join("a.bin"), 3600);
    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts_fast(3)).unwrap();
    assert_eq!(fx.hasher.files.load(Ordering::SeqCst), 1);
    assert_eq!(r.binaries_hashed, 1);
    assert_eq!(mtime_secs(&fx.root().join("a.bin")), mtime_secs(&fx.root().join("a.bin.pointer.arius")));
}

fn archive_opts_fast(n: i64) -> arius_core::archive::ArchiveOptions {
    let mut o = archive_opts(n);
    o.fast_hash = true;
    o
}

#[test]
fn changed_binary_with_stale_pointer_is_fatal_without_fast_hash() {
    let fx = Fixture::new();
    let path = fx.write("a.bin", &random_bytes(512, 7));
    archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap();

    std::fs::write(&path, random_bytes(512, 8)).unwrap();
    set_mtime(&path, 7200);
    let err = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(2)).unwrap_err();
    assert!(
        matches!(err.downcast_ref::<ArchiveError>(), Some(ArchiveError::FastHashMismatch { .. })),
        "{err:#}"
    );
    assert_eq!(fx.repo.get_current_entries(false).unwrap()[0].version, version(1));
}

#[test]
fn fast_hash_archives_a_changed_binary_as_new_content() {
    let fx = Fixture::new();
    let path = fx.write("a.bin", &random_bytes(512, 9));
    archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap();

    let new = random_bytes(512, 10);
    std::fs::write(&path, &new).unwrap();
    set_mtime(&path, 7200);
    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts_fast(2)).unwrap();
    assert_eq!(r.manifests_created, 1);
    let current = fx.repo.get_current_entries(false).unwrap();
    assert_eq!(current[0].hash, fx.hash_of(&new));
    assert_eq!(fx.repo.inner.history("a.bin").len(), 2);
}

#[test]
fn deleted_paths_are_tombstoned_once_and_stay_deleted() {
    let fx = Fixture::new();
    let a = fx.write("a.bin", &random_bytes(300, 11));
    fx.write("keep.bin", &random_bytes(300, 12));
    archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap();

    std::fs::remove_file(&a).unwrap();
    std::fs::remove_file(fx.root().join("a.bin.pointer.arius")).unwrap();
    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(2)).unwrap();
    assert_eq!(r.tombstones, 1);

    let active: Vec<String> =
        fx.repo.get_current_entries(false).unwrap().into_iter().map(|e| e.rel_path).collect();
    assert_eq!(active, vec!["keep.bin"]);

    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(3)).unwrap();
    assert_eq!(r.tombstones, 0);
    let history = fx.repo.inner.history("a.bin");
    assert_eq!(history.len(), 2);
    assert!(history[1].is_deleted);
    assert_eq!(history[1].version, version(2));

    // A new file at the same path brings it back.
    fx.write("a.bin", &random_bytes(300, 13));
    archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(4)).unwrap();
    assert_eq!(fx.repo.get_current_entries(false).unwrap().len(), 2);
}

#[test]
fn remove_local_deletes_binaries_after_their_entries_exist() {
    let fx = Fixture::new();
    let data = random_bytes(5000, 14);
    let a = fx.write("docs/a.bin", &data);
    let mut o = archive_opts(1);
    o.remove_local = true;
    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &o).unwrap();

    assert_eq!(r.binaries_removed, 1);
    assert!(!a.exists());
    assert!(fx.root().join("docs/a.bin.pointer.arius").is_file());
    let h = fx.hash_of(&data);
    assert!(fx.repo.manifest_exists(&h).unwrap());
    assert_eq!(fx.repo.get_current_entries(false).unwrap()[0].hash, h);

    // The pointer alone keeps the path alive on later runs.
    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(2)).unwrap();
    assert_eq!(r.tombstones, 0);
    assert_eq!(r.orphan_pointers, 0);
    assert_eq!(r.entries_added, 0);
}

#[test]
fn pointer_without_archived_content_is_skipped() {
    let fx = Fixture::new();
    let bogus = fx.hash_of(b"never archived");
    arius_core::pointer::write(fx.root(), std::path::Path::new("ghost.bin"), bogus, None).unwrap();
    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap();
    assert_eq!(r.orphan_pointers, 1);
    assert!(fx.repo.get_current_entries(true).unwrap().is_empty());
}

#[test]
fn content_defined_chunks_are_shared_between_files() {
    let fx = Fixture::new();
    let shared = random_bytes(200 * 1024, 15);
    let mut a = shared.clone();
    a.extend(random_bytes(20 * 1024, 16));
    let mut b = random_bytes(20 * 1024, 17);
    b.extend(&shared);
    fx.write("a.bin", &a);
    fx.write("b.bin", &b);

    let mut o = archive_opts(1);
    o.chunking = ChunkStrategy::ContentDefined(RollingParams::with_average_bits(12));
    o.upload_batch.max_count = 8;
    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &o).unwrap();

    assert_eq!(r.manifests_created, 2);
    assert!(r.chunks_deduplicated > 0, "{r:?}");
    let names = fx.repo.uploaded_names();
    let unique: std::collections::HashSet<_> = names.iter().collect();
    assert_eq!(unique.len(), names.len(), "a chunk was uploaded twice");
    assert_eq!(r.chunks_uploaded as usize, names.len());

    let chunks_a = fx.repo.get_chunk_hashes(&fx.hash_of(&a)).unwrap();
    let chunks_b = fx.repo.get_chunk_hashes(&fx.hash_of(&b)).unwrap();
    assert!(chunks_a.iter().any(|c| chunks_b.contains(c)));
}

#[test]
fn denied_and_hidden_files_are_not_archived() {
    let fx = Fixture::new();
    fx.write("Thumbs.db", b"x");
    fx.write(".hidden", b"x");
    fx.write("@eaDir/meta.bin", b"x");
    fx.write("real.bin", b"payload");
    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap();
    assert_eq!(r.files_indexed, 1);
    let names: Vec<String> = fx.repo.get_current_entries(false).unwrap().into_iter().map(|e| e.rel_path).collect();
    assert_eq!(names, vec!["real.bin"]);
}

#[test]
fn transient_upload_failures_are_retried() {
    let fx = Fixture::new();
    let data = random_bytes(700, 18);
    fx.write("a.bin", &data);
    let flaky = FaultyRepo::new(&fx.repo).failing_uploads(2, true);
    let r = archive_run(fx.root(), &flaky, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap();
    assert_eq!(r.chunks_uploaded, 1);
    assert_eq!(fx.repo.uploaded_names().len(), 1);
    assert!(fx.repo.manifest_exists(&fx.hash_of(&data)).unwrap());
}

#[test]
fn permanent_upload_failure_fails_the_run_without_entries() {
    let fx = Fixture::new();
    fx.write("a.bin", &random_bytes(700, 19));
    fx.write("b.bin", &random_bytes(700, 20));
    let broken = FaultyRepo::new(&fx.repo).failing_uploads(usize::MAX, false);
    let err = archive_run(fx.root(), &broken, fx.enc.as_ref(), fx.hasher(), &archive_opts(1)).unwrap_err();
    assert!(format!("{err:#}").contains("upload rejected"), "{err:#}");
    assert!(fx.repo.get_current_entries(true).unwrap().is_empty());
    assert!(!fx.root().join("a.bin.pointer.arius").exists());
    assert!(fx.root().join("a.bin").exists());
}

/// Deletes the named file right before hashing it.
struct VanishingHasher {
    inner: CountingHasher,
    victim: &'static str,
}

impl HashValueProvider for VanishingHasher {
    fn hash_bytes(&self, data: &[u8]) -> Hash {
        self.inner.hash_bytes(data)
    }
    fn hasher(&self) -> blake3::Hasher {
        self.inner.hasher()
    }
    fn hash_file(&self, binary: &BinaryFile) -> anyhow::Result<Hash> {
        if binary.rel_name() == self.victim {
            std::fs::remove_file(binary.full_path())?;
        }
        self.inner.hash_file(binary)
    }
}

#[test]
fn binary_deleted_before_hashing_is_skipped() {
    let fx = Fixture::new();
    let keep = random_bytes(600, 21);
    fx.write("keep.bin", &keep);
    fx.write("vanish.bin", &random_bytes(600, 22));
    let hasher = std::sync::Arc::new(VanishingHasher { inner: CountingHasher::new(), victim: "vanish.bin" });

    let r = archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), hasher, &archive_opts(1)).unwrap();
    assert_eq!(r.binaries_skipped, 1);
    assert_eq!(r.manifests_created, 1);
    let names: Vec<String> = fx.repo.get_current_entries(false).unwrap().into_iter().map(|e| e.rel_path).collect();
    assert_eq!(names, vec!["keep.bin"]);
    assert!(fx.repo.manifest_exists(&fx.hash_of(&keep)).unwrap());
    assert!(!fx.root().join("vanish.bin.pointer.arius").exists());
}
