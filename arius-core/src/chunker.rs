use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::hash::{finalize, Hash, HashValueProvider};
use crate::model::{BinaryFile, Chunk};
use crate::rolling::{BoundaryScanner, RollingParams};

/// How binaries are split before upload.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// One chunk per binary; its hash is the binary hash.
    #[default]
    WholeFile,
    /// Rabin–Karp content-defined chunks, deduplicated across binaries.
    ContentDefined(RollingParams),
}

pub struct Chunker {
    strategy: ChunkStrategy,
    hasher: Arc<dyn HashValueProvider>,
}

impl Chunker {
    pub fn new(strategy: ChunkStrategy, hasher: Arc<dyn HashValueProvider>) -> Self {
        Self { strategy, hasher }
    }

    /// Split `binary` into ordered chunks.
    ///
    /// Content-defined chunks are written once per distinct hash to
    /// `work_dir/<hash>`; the returned list may repeat a hash when the binary
    /// contains the same chunk more than once.
    pub fn chunk(&self, binary: &BinaryFile, binary_hash: Hash, work_dir: &Path) -> Result<Vec<Chunk>> {
        match self.strategy {
            ChunkStrategy::WholeFile => Ok(vec![Chunk {
                hash: binary_hash,
                path: binary.full_path(),
                len: binary.len,
                artifact: false,
            }]),
            ChunkStrategy::ContentDefined(params) => self.chunk_content_defined(binary, params, work_dir),
        }
    }

    fn chunk_content_defined(
        &self,
        binary: &BinaryFile,
        params: RollingParams,
        work_dir: &Path,
    ) -> Result<Vec<Chunk>> {
        fs::create_dir_all(work_dir).with_context(|| format!("create dir {:?}", work_dir))?;
        let path = binary.full_path();
        let mut reader = BufReader::new(File::open(&path).with_context(|| format!("open {:?}", path))?);
        let mut scanner = BoundaryScanner::new(params);
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut written = HashSet::new();
        let cap = (params.average_len() as usize).saturating_mul(2).min(params.max_len);
        let mut current = Vec::with_capacity(cap);
        let mut hasher = self.hasher.hasher();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).with_context(|| format!("read {:?}", path))?;
            if n == 0 {
                break;
            }
            let mut start = 0;
            for i in 0..n {
                if scanner.push(buf[i]) {
                    hasher.update(&buf[start..=i]);
                    current.extend_from_slice(&buf[start..=i]);
                    self.emit(&mut chunks, &mut written, &mut current, &hasher, work_dir)?;
                    hasher = self.hasher.hasher();
                    start = i + 1;
                }
            }
            hasher.update(&buf[start..n]);
            current.extend_from_slice(&buf[start..n]);
        }
        if !current.is_empty() || chunks.is_empty() {
            self.emit(&mut chunks, &mut written, &mut current, &hasher, work_dir)?;
        }
        Ok(chunks)
    }

    fn emit(
        &self,
        chunks: &mut Vec<Chunk>,
        written: &mut HashSet<Hash>,
        current: &mut Vec<u8>,
        hasher: &blake3::Hasher,
        work_dir: &Path,
    ) -> Result<()> {
        let hash = finalize(hasher);
        let path = work_dir.join(hash.to_hex());
        if written.insert(hash) {
            let mut f = File::create(&path).with_context(|| format!("create chunk {:?}", path))?;
            f.write_all(current)?;
        }
        chunks.push(Chunk { hash, path, len: current.len() as u64, artifact: true });
        current.clear();
        Ok(())
    }
}

/// Concatenate chunk files, in order, into `target`.
///
/// The result is written beside `target` and renamed into place, so a failed
/// merge never leaves a truncated binary behind.
pub fn merge(parts: &[PathBuf], target: &Path) -> Result<u64> {
    let dir = target.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("create dir {:?}", dir))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let mut total = 0u64;
    for part in parts {
        let mut src = File::open(part).with_context(|| format!("open chunk {:?}", part))?;
        total += std::io::copy(&mut src, tmp.as_file_mut())?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error).with_context(|| format!("persist {:?}", target))?;
    Ok(total)
}
