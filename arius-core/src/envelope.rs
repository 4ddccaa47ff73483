//! On-disk framing of encrypted chunks and manifests.
//!
//! Layout: descriptor, bincode key parameters (length-prefixed), ciphertext,
//! then a fixed trailer carrying the CRC of everything before it.

use anyhow::{bail, Context, Result};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};

/// Descriptor: magic (8) + NUL (1) + schema_version (u32 LE) + codec_id (u32 LE) + flags (u32 LE)
const DESC_MAGIC: &[u8] = b"ARIUSENV"; // 8 bytes
const DESC_LEN: usize = DESC_MAGIC.len() + 1 + 4 + 4 + 4;

/// Trailer: magic (8) + NUL (1) + crc (u32 LE)
const TRAILER_MAGIC: &[u8] = b"ARIUSEND";
const TRAILER_LEN: usize = TRAILER_MAGIC.len() + 1 + 4;

pub const SCHEMA_VERSION: u32 = 1;
pub const CODEC_ZSTD_AES256GCM: u32 = 1;

/// Associated data bound into every AEAD tag.
pub const DESC_AAD: &[u8] = b"ARIUSENV\0v1";

/// Encrypted-artifact suffix for chunks.
pub const CHUNK_SUFFIX: &str = ".ae";
/// Encrypted-artifact suffix for manifests.
pub const MANIFEST_SUFFIX: &str = ".manifest.ae";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KeyParams {
    pub salt: [u8; 16],
    pub nonce: [u8; 12],
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
    pub plain_len: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct EnvelopeLimits {
    pub max_params_bytes: usize,
}

impl Default for EnvelopeLimits {
    fn default() -> Self {
        Self { max_params_bytes: 4096 }
    }
}

pub struct Envelope<'a> {
    pub codec: u32,
    pub params: KeyParams,
    pub body: &'a [u8],
}

/// Serialize a sealed payload.
pub fn write(codec: u32, params: &KeyParams, body: &[u8]) -> Result<Vec<u8>> {
    let raw = bincode::serialize(params).context("serialize key params")?;
    let mut out = Vec::with_capacity(DESC_LEN + 4 + raw.len() + body.len() + TRAILER_LEN);
    out.extend_from_slice(DESC_MAGIC);
    out.push(0);
    out.extend_from_slice(&SCHEMA_VERSION.to_le_bytes());
    out.extend_from_slice(&codec.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    out.extend_from_slice(&raw);
    out.extend_from_slice(body);
    let mut h = Crc32::new();
    h.update(&out);
    let crc = h.finalize();
    out.extend_from_slice(TRAILER_MAGIC);
    out.push(0);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Validate framing and CRC, returning the parts.
pub fn read<'a>(data: &'a [u8], limits: &EnvelopeLimits) -> Result<Envelope<'a>> {
    if data.len() < DESC_LEN + 4 + TRAILER_LEN {
        bail!("too short");
    }
    if &data[..DESC_MAGIC.len()] != DESC_MAGIC || data[DESC_MAGIC.len()] != 0 {
        bail!("bad descriptor magic");
    }
    let tr = &data[data.len() - TRAILER_LEN..];
    if &tr[..TRAILER_MAGIC.len()] != TRAILER_MAGIC || tr[TRAILER_MAGIC.len()] != 0 {
        bail!("bad trailer magic");
    }
    let mut crc4 = [0u8; 4];
    crc4.copy_from_slice(&tr[TRAILER_MAGIC.len() + 1..]);
    let framed = &data[..data.len() - TRAILER_LEN];
    let mut h = Crc32::new();
    h.update(framed);
    if h.finalize() != u32::from_le_bytes(crc4) {
        bail!("envelope CRC mismatch");
    }
    let word = |at: usize| {
        let mut b = [0u8; 4];
        b.copy_from_slice(&framed[at..at + 4]);
        u32::from_le_bytes(b)
    };
    let schema = word(DESC_MAGIC.len() + 1);
    if schema != SCHEMA_VERSION {
        bail!("unsupported envelope schema {}", schema);
    }
    let codec = word(DESC_MAGIC.len() + 5);
    let params_len = word(DESC_LEN) as usize;
    if params_len > limits.max_params_bytes || DESC_LEN + 4 + params_len > framed.len() {
        bail!("key parameter block out of bounds ({} bytes)", params_len);
    }
    let params_start = DESC_LEN + 4;
    let params: KeyParams = bincode::deserialize(&framed[params_start..params_start + params_len])
        .context("bincode key params decode")?;
    Ok(Envelope { codec, params, body: &framed[params_start + params_len..] })
}
