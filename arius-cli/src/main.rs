use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use arius_core::archive::{archive_run, ArchiveOptions};
use arius_core::chunker::ChunkStrategy;
use arius_core::crypto::{AesGcmEncrypter, Encrypter};
use arius_core::hash::{HashValueProvider, SaltedHasher};
use arius_core::local::LocalRepository;
use arius_core::localize::FluentLoc;
use arius_core::repository::{RemoteRepository, Tier};
use arius_core::restore::{restore_run, RestoreOptions};
use arius_core::rolling::RollingParams;

#[derive(Parser)]
#[command(name = "arius", version, about = "Deduplicating, encrypted archiver for cold storage")]
struct Cli {
    /// Repository directory
    #[arg(long, short = 'r', global = true, env = "ARIUS_REPOSITORY")]
    repository: Option<PathBuf>,
    #[arg(long, global = true, env = "ARIUS_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,
    /// Debug logging (RUST_LOG overrides)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Archive a directory, replacing binaries with pointer files as they are uploaded
    Archive {
        root: PathBuf,
        /// JSON options file; flags below override it
        #[arg(long)] options: Option<PathBuf>,
        #[arg(long)] fast_hash: bool,
        #[arg(long)] remove_local: bool,
        /// Content-defined chunking with cross-file deduplication
        #[arg(long)] dedup: bool,
        #[arg(long)] tier: Option<Tier>,
        #[arg(long)] progress: bool,
    },
    /// Restore binaries for the pointer files under a directory
    Restore {
        root: PathBuf,
        #[arg(long)] options: Option<PathBuf>,
        /// Create/remove pointer files to match the repository
        #[arg(long)] synchronize: bool,
        /// Download and merge binaries for local pointers
        #[arg(long)] download: bool,
        #[arg(long)] keep_pointers: bool,
        #[arg(long)] progress: bool,
    },
    /// Finish pending hydrations in a local repository
    Hydrate,
    /// List current pointer entries
    Ls {
        #[arg(long)] include_deleted: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

fn run(cli: Cli) -> Result<()> {
    let repo_dir = cli.repository.ok_or_else(|| anyhow!("--repository (or ARIUS_REPOSITORY) is required"))?;
    let passphrase = cli.passphrase;
    let needs_passphrase = || passphrase.clone().ok_or_else(|| anyhow!("--passphrase (or ARIUS_PASSPHRASE) is required"));
    let loc = FluentLoc::default();
    match cli.cmd {
        Cmd::Archive { root, options, fast_hash, remove_local, dedup, tier, progress } => {
            let pw = needs_passphrase()?;
            let mut o: ArchiveOptions = load_options(options.as_deref())?;
            o.fast_hash |= fast_hash;
            o.remove_local |= remove_local;
            o.progress |= progress;
            if dedup {
                o.chunking = ChunkStrategy::ContentDefined(RollingParams::default());
            }
            if let Some(t) = tier {
                o.tier = t;
            }
            debug!(options = ?o, "archive");
            let (repo, enc, hasher) = open(&repo_dir, &pw)?;
            let r = archive_run(&root, &repo, enc.as_ref(), hasher, &o)?;
            let version = r.version.to_rfc3339();
            println!("{}", loc.msg("archive-summary", &[
                ("files", r.files_indexed.into()),
                ("version", version.as_str().into()),
                ("manifests", r.manifests_created.into()),
                ("uploaded", r.chunks_uploaded.into()),
                ("bytes", r.bytes_uploaded.into()),
                ("deduped", r.chunks_deduplicated.into()),
            ]));
            println!("{}", loc.msg("archive-entries", &[
                ("entries", r.entries_added.into()),
                ("tombstones", r.tombstones.into()),
                ("removed", r.binaries_removed.into()),
            ]));
            if r.orphan_pointers > 0 {
                println!("{}", loc.msg("archive-orphans", &[("count", r.orphan_pointers.into())]));
            }
            if r.binaries_skipped > 0 {
                println!("{}", loc.msg("archive-skipped", &[("count", r.binaries_skipped.into())]));
            }
        }
        Cmd::Restore { root, options, synchronize, download, keep_pointers, progress } => {
            let pw = needs_passphrase()?;
            let mut o: RestoreOptions = load_options(options.as_deref())?;
            if synchronize || download {
                o.synchronize = synchronize;
                o.download = download;
            }
            o.keep_pointers |= keep_pointers;
            o.progress |= progress;
            debug!(options = ?o, "restore");
            let (repo, enc, hasher) = open(&repo_dir, &pw)?;
            let r = restore_run(&root, &repo, enc.as_ref(), hasher, &o)?;
            if o.synchronize {
                println!("{}", loc.msg("restore-sync", &[
                    ("created", r.pointers_synced.into()),
                    ("removed", r.pointers_pruned.into()),
                ]));
            }
            if o.download {
                println!("{}", loc.msg("restore-summary", &[
                    ("restored", r.restored.into()),
                    ("present", r.already_restored.into()),
                    ("downloaded", r.chunks_downloaded.into()),
                ]));
            }
            if let Some(w) = r.warning {
                println!("{w}");
            }
        }
        Cmd::Hydrate => {
            let (repo, _, _) = open(&repo_dir, passphrase.as_deref().unwrap_or_default())?;
            let n = repo.complete_hydrations()?;
            println!("{}", loc.msg("repo-hydrated", &[("count", (n as u64).into())]));
        }
        Cmd::Ls { include_deleted } => {
            let (repo, _, _) = open(&repo_dir, passphrase.as_deref().unwrap_or_default())?;
            let entries = repo.get_current_entries(include_deleted)?;
            if entries.is_empty() {
                println!("{}", loc.msg("repo-no-entries", &[]));
            }
            for e in entries {
                let mark = if e.is_deleted { "  (deleted)" } else { "" };
                println!("{}  {}  {}{}", e.hash.short(), e.version.to_rfc3339(), e.rel_path, mark);
            }
        }
    }
    Ok(())
}

fn open(dir: &Path, passphrase: &str) -> Result<(LocalRepository, Arc<dyn Encrypter>, Arc<dyn HashValueProvider>)> {
    let enc: Arc<dyn Encrypter> = Arc::new(AesGcmEncrypter::new(passphrase));
    let hasher: Arc<dyn HashValueProvider> = Arc::new(SaltedHasher::new(passphrase));
    let repo = LocalRepository::open(dir, enc.clone())?;
    Ok((repo, enc, hasher))
}

fn load_options<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(p) = path else { return Ok(T::default()) };
    let data = std::fs::read(p).with_context(|| format!("read options {}", p.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse options {}", p.display()))
}
