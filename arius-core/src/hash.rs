use std::fmt;
use std::fs::File;
use std::io::Read;
use std::str::FromStr;

use anyhow::{Context, Result};
use memmap2::Mmap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::model::BinaryFile;

/// Files at or above this size are memory-mapped instead of streamed.
const MMAP_THRESHOLD: u64 = 4 * 1024 * 1024;

const HASH_CONTEXT: &str = "arius 2024-06 content hash v1";

/// Content identity of a binary, chunk or manifest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// First 8 hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_hex();
        s.truncate(8);
        s
    }
}

impl FromStr for Hash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let h = blake3::Hash::from_hex(s.trim()).with_context(|| format!("invalid hash {:?}", s.trim()))?;
        Ok(Self(*h.as_bytes()))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Computes content hashes for binaries and chunks.
pub trait HashValueProvider: Send + Sync {
    fn hash_bytes(&self, data: &[u8]) -> Hash;

    /// Incremental hasher producing the same digest as [`hash_bytes`](Self::hash_bytes).
    fn hasher(&self) -> blake3::Hasher;

    fn hash_file(&self, binary: &BinaryFile) -> Result<Hash> {
        let path = binary.full_path();
        let mut f = File::open(&path).with_context(|| format!("open {:?}", path))?;
        let len = f.metadata()?.len();
        if len >= MMAP_THRESHOLD {
            let mmap = unsafe { Mmap::map(&f)? };
            return Ok(self.hash_bytes(&mmap));
        }
        let mut h = self.hasher();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = f.read(&mut buf).with_context(|| format!("read {:?}", path))?;
            if n == 0 {
                break;
            }
            h.update(&buf[..n]);
        }
        Ok(Hash(*h.finalize().as_bytes()))
    }
}

/// Keyed BLAKE3; the key is derived from the archive passphrase so a hash
/// cannot be reproduced without it.
pub struct SaltedHasher {
    key: [u8; 32],
}

impl SaltedHasher {
    pub fn new(passphrase: &str) -> Self {
        Self { key: blake3::derive_key(HASH_CONTEXT, passphrase.as_bytes()) }
    }
}

impl HashValueProvider for SaltedHasher {
    fn hash_bytes(&self, data: &[u8]) -> Hash {
        Hash(*blake3::keyed_hash(&self.key, data).as_bytes())
    }

    fn hasher(&self) -> blake3::Hasher {
        blake3::Hasher::new_keyed(&self.key)
    }
}

pub fn finalize(h: &blake3::Hasher) -> Hash {
    Hash(*h.finalize().as_bytes())
}
