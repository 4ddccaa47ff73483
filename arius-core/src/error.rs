use std::path::PathBuf;

use thiserror::Error;

use crate::hash::Hash;

/// Failures that indicate corruption risk or a broken pipeline invariant.
///
/// These are never retried. They travel inside `anyhow::Error`; callers that
/// need to tell them apart use `downcast_ref::<ArchiveError>()`.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("pointer {pointer:?} records {recorded} but the binary hashes to {actual}")]
    FastHashMismatch { pointer: PathBuf, recorded: Hash, actual: Hash },

    #[error("restored {path:?} hashes to {actual}, expected {expected}")]
    MergeHashMismatch { path: PathBuf, expected: Hash, actual: Hash },

    #[error("completion signalled for {0} which was never claimed")]
    ReconcilerNotClaimed(Hash),

    #[error("{count} {kind} creation(s) still in flight after the pipeline drained")]
    StrandedWaiters { kind: &'static str, count: usize },

    #[error("manifest {0} does not exist in the repository")]
    UnknownManifest(Hash),

    #[error("decryption failed for {0:?}: wrong passphrase or corrupted data")]
    Decryption(PathBuf),

    #[error("corrupt envelope {path:?}: {reason}")]
    CorruptEnvelope { path: PathBuf, reason: String },

    #[error("unsafe relative path {0:?}")]
    UnsafePath(PathBuf),

    #[error("transient remote failure: {0}")]
    Transient(String),
}
