use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, retry_delay_ms: 500, retry_max_delay_ms: 10_000 }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }
}

/// Whether an I/O error is transient and worth retrying.
pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Transient if anything in the cause chain is a retryable I/O error or an
/// explicit [`ArchiveError::Transient`].
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return is_retryable_io(io);
        }
        matches!(cause.downcast_ref::<ArchiveError>(), Some(ArchiveError::Transient(_)))
    })
}

/// Retry `f` on transient errors with exponential backoff + jitter.
pub fn retry<T>(config: &RetryConfig, op_name: &str, mut f: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;
    let mut attempt = 0;
    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if is_transient(&e) && attempt < config.max_retries => {
                attempt += 1;
                tracing::warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e:#}",
                    attempt,
                    config.max_retries,
                );
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                std::thread::sleep(Duration::from_millis(delay_ms + jitter));
                delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
            }
            Err(e) => return Err(e),
        }
    }
}
