mod common;

use std::path::PathBuf;

use arius_core::archive::archive_run;
use arius_core::chunker::ChunkStrategy;
use arius_core::crypto::Encrypter;
use arius_core::error::ArchiveError;
use arius_core::hash::Hash;
use arius_core::repository::{RemoteRepository, Tier};
use arius_core::restore::restore_run;
use arius_core::rolling::RollingParams;
use common::*;

fn archive_and_remove(fx: &Fixture, n: i64) {
    let mut o = archive_opts(n);
    o.remove_local = true;
    archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &o).unwrap();
}

/// Copies the sealed chunk for `hash` out of the repository into `dir`.
fn fetch_sealed(fx: &Fixture, hash: &Hash, dir: &std::path::Path) -> PathBuf {
    let blob = fx.repo.inner.chunk_blob(hash).unwrap();
    let mut files = fx.repo.inner.download(&[blob], dir).unwrap();
    assert_eq!(files.len(), 1);
    files.remove(0)
}

fn restore_work(fx: &Fixture) -> PathBuf {
    fx.root().join(".arius").join("restore")
}

#[test]
fn round_trip_restores_content_and_mtimes() {
    let fx = Fixture::new();
    let files = [
        ("top.bin", random_bytes(1500, 1)),
        ("docs/2023/report.bin", random_bytes(64 * 1024, 2)),
        ("docs/notes.txt", b"plain text".to_vec()),
    ];
    for (i, (rel, data)) in files.iter().enumerate() {
        let p = fx.write(rel, data);
        set_mtime(&p, 86_400 * (i as u64 + 1));
    }
    let mtimes: Vec<i64> = files.iter().map(|(rel, _)| mtime_secs(&fx.root().join(rel))).collect();
    archive_and_remove(&fx, 1);
    for (rel, _) in &files {
        assert!(!fx.root().join(rel).exists());
    }

    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &restore_opts()).unwrap();
    assert_eq!(r.restored, 3);
    assert_eq!(r.pending_hydration, 0);
    assert!(r.warning.is_none());
    for ((rel, data), mtime) in files.iter().zip(mtimes) {
        let p = fx.root().join(rel);
        assert_eq!(&std::fs::read(&p).unwrap(), data, "{rel}");
        assert_eq!(mtime_secs(&p), mtime, "{rel}");
        assert!(!fx.root().join(format!("{rel}.pointer.arius")).exists());
    }
    assert!(!fx.root().join(".arius").join("restore").exists());
}

#[test]
fn duplicate_content_is_downloaded_once_for_every_path() {
    let fx = Fixture::new();
    let data = random_bytes(10_000, 3);
    let a = fx.write("a.bin", &data);
    let b = fx.write("copies/b.bin", &data);
    set_mtime(&a, 1000);
    set_mtime(&b, 5000);
    let (ma, mb) = (mtime_secs(&a), mtime_secs(&b));
    archive_and_remove(&fx, 1);
    fx.repo.reset();

    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &restore_opts()).unwrap();
    assert_eq!(r.restored, 2);
    assert_eq!(r.states.get("Restoring"), Some(&1));
    assert_eq!(CountingRepo::count(&fx.repo.download), 1);
    assert_eq!(std::fs::read(&a).unwrap(), data);
    assert_eq!(std::fs::read(&b).unwrap(), data);
    assert_eq!(mtime_secs(&a), ma);
    assert_eq!(mtime_secs(&b), mb);
}

#[test]
fn content_defined_binaries_restore_from_shared_chunks() {
    let fx = Fixture::new();
    let shared = random_bytes(96 * 1024, 4);
    let mut a = shared.clone();
    a.extend(random_bytes(8 * 1024, 5));
    let mut b = random_bytes(8 * 1024, 6);
    b.extend(&shared);
    fx.write("a.bin", &a);
    fx.write("b.bin", &b);
    let mut o = archive_opts(1);
    o.remove_local = true;
    o.chunking = ChunkStrategy::ContentDefined(RollingParams::with_average_bits(11));
    archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &o).unwrap();
    let uploaded = fx.repo.uploaded_names().len();

    let mut ro = restore_opts();
    ro.download_batch.max_count = 4;
    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &ro).unwrap();
    assert_eq!(r.restored, 2);
    assert_eq!(CountingRepo::count(&fx.repo.download), uploaded);
    assert_eq!(std::fs::read(fx.root().join("a.bin")).unwrap(), a);
    assert_eq!(std::fs::read(fx.root().join("b.bin")).unwrap(), b);
}

#[test]
fn archived_tier_requests_hydration_once_and_restores_later() {
    let fx = Fixture::new();
    let data = random_bytes(3000, 7);
    fx.write("cold.bin", &data);
    let mut o = archive_opts(1);
    o.remove_local = true;
    o.tier = Tier::Archive;
    archive_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &o).unwrap();

    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &restore_opts()).unwrap();
    assert_eq!(r.hydration_requested, 1);
    assert_eq!(r.pending_hydration, 1);
    assert_eq!(r.restored, 0);
    assert_eq!(r.states.get("NotYetHydrated"), Some(&1));
    let warning = r.warning.expect("hydration warning");
    assert!(warning.contains("15 hours"), "{warning}");
    assert_eq!(CountingRepo::count(&fx.repo.hydrate), 1);
    assert!(!fx.root().join("cold.bin").exists());
    assert!(fx.root().join("cold.bin.pointer.arius").exists());

    // Still hydrating: nothing new is requested.
    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &restore_opts()).unwrap();
    assert_eq!(r.hydration_requested, 0);
    assert_eq!(r.pending_hydration, 1);
    assert_eq!(CountingRepo::count(&fx.repo.hydrate), 1);

    assert_eq!(fx.repo.inner.complete_hydrations().unwrap(), 1);
    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &restore_opts()).unwrap();
    assert_eq!(r.restored, 1);
    assert!(r.warning.is_none());
    assert_eq!(std::fs::read(fx.root().join("cold.bin")).unwrap(), data);
}

#[test]
fn synchronize_creates_missing_and_prunes_stale_pointers() {
    let fx = Fixture::new();
    let a = fx.write("a.bin", &random_bytes(400, 8));
    fx.write("dir/b.bin", &random_bytes(400, 9));
    set_mtime(&a, 86_400);
    let ma = mtime_secs(&a);
    archive_and_remove(&fx, 1);

    std::fs::remove_file(fx.root().join("a.bin.pointer.arius")).unwrap();
    let stray = fx.hash_of(b"stray");
    arius_core::pointer::write(fx.root(), std::path::Path::new("old/gone.bin"), stray, None).unwrap();

    let mut o = restore_opts();
    o.download = false;
    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &o).unwrap();
    assert_eq!((r.pointers_synced, r.pointers_pruned), (1, 1));
    assert_eq!(r.restored, 0);
    let ptr = fx.root().join("a.bin.pointer.arius");
    assert!(ptr.is_file());
    assert_eq!(mtime_secs(&ptr), ma);
    assert!(!fx.root().join("old/gone.bin.pointer.arius").exists());
    assert!(fx.root().join("dir/b.bin.pointer.arius").is_file());
    assert!(!a.exists());
}

#[test]
fn keep_pointers_leaves_pointers_and_rerun_is_a_no_op() {
    let fx = Fixture::new();
    let data = random_bytes(2000, 10);
    fx.write("a.bin", &data);
    archive_and_remove(&fx, 1);

    let mut o = restore_opts();
    o.keep_pointers = true;
    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &o).unwrap();
    assert_eq!(r.restored, 1);
    assert!(fx.root().join("a.bin.pointer.arius").is_file());
    fx.repo.reset();

    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &o).unwrap();
    assert_eq!(r.restored, 0);
    assert_eq!(r.already_restored, 1);
    assert_eq!(CountingRepo::count(&fx.repo.download), 0);
    assert_eq!(std::fs::read(fx.root().join("a.bin")).unwrap(), data);
}

#[test]
fn differing_local_file_is_not_overwritten() {
    let fx = Fixture::new();
    fx.write("a.bin", &random_bytes(2000, 11));
    archive_and_remove(&fx, 1);
    let local = fx.write("a.bin", b"edited locally");

    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &restore_opts()).unwrap();
    assert_eq!(r.restored, 0);
    assert_eq!(r.already_restored, 0);
    assert_eq!(std::fs::read(&local).unwrap(), b"edited locally");
}

#[test]
fn merged_content_with_wrong_hash_is_rejected() {
    let fx = Fixture::new();
    let other = random_bytes(900, 12);
    fx.write("a.bin", &random_bytes(900, 13));
    fx.write("b.bin", &other);
    archive_and_remove(&fx, 1);

    let mut liar = FaultyRepo::new(&fx.repo);
    liar.chunk_override = Some(vec![fx.hash_of(&other)]);
    let err = restore_run(fx.root(), &liar, fx.enc.as_ref(), fx.hasher(), &restore_opts()).unwrap_err();
    assert!(
        matches!(err.downcast_ref::<ArchiveError>(), Some(ArchiveError::MergeHashMismatch { .. })),
        "{err:#}"
    );
    assert!(!fx.root().join("a.bin").exists());
    assert!(fx.root().join("a.bin.pointer.arius").exists());
}

#[test]
fn corrupt_pointer_does_not_block_other_restores() {
    let fx = Fixture::new();
    let data = random_bytes(1200, 14);
    fx.write("good.bin", &data);
    archive_and_remove(&fx, 1);
    fx.write("junk.bin.pointer.arius", b"not a hash");

    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &restore_opts()).unwrap();
    assert_eq!(r.restored, 1);
    assert_eq!(std::fs::read(fx.root().join("good.bin")).unwrap(), data);
    assert!(fx.root().join("junk.bin.pointer.arius").exists());
}

#[test]
fn decrypted_chunk_left_by_earlier_run_is_merged_without_download() {
    let fx = Fixture::new();
    let data = random_bytes(5000, 15);
    fx.write("a.bin", &data);
    archive_and_remove(&fx, 1);
    let hash = fx.hash_of(&data);

    let scratch = tempfile::tempdir().unwrap();
    let sealed = fetch_sealed(&fx, &hash, scratch.path());
    let chunks = restore_work(&fx).join("chunks");
    fx.enc.decrypt(&sealed, &chunks.join(hash.to_hex())).unwrap();
    fx.repo.reset();

    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &restore_opts()).unwrap();
    assert_eq!(r.states.get("NotYetMerged"), Some(&1));
    assert_eq!(r.restored, 1);
    assert_eq!(CountingRepo::count(&fx.repo.download), 0);
    assert_eq!(std::fs::read(fx.root().join("a.bin")).unwrap(), data);
    assert!(!restore_work(&fx).exists());
}

#[test]
fn downloaded_chunk_left_by_earlier_run_is_decrypted_without_download() {
    let fx = Fixture::new();
    let data = random_bytes(5000, 16);
    fx.write("a.bin", &data);
    archive_and_remove(&fx, 1);
    let hash = fx.hash_of(&data);

    let download = restore_work(&fx).join("download");
    std::fs::create_dir_all(&download).unwrap();
    let sealed = fetch_sealed(&fx, &hash, &download);
    assert_eq!(sealed, download.join(format!("{hash}.ae")));
    fx.repo.reset();

    let r = restore_run(fx.root(), &fx.repo, fx.enc.as_ref(), fx.hasher(), &restore_opts()).unwrap();
    assert_eq!(r.states.get("NotYetDecrypted"), Some(&1));
    assert_eq!(r.restored, 1);
    assert_eq!(CountingRepo::count(&fx.repo.download), 0);
    assert_eq!(std::fs::read(fx.root().join("a.bin")).unwrap(), data);
    assert!(!sealed.exists());
}
