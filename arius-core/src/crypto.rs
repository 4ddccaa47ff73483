use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, bail, Context, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::envelope::{self, EnvelopeLimits, KeyParams, CODEC_ZSTD_AES256GCM};
use crate::error::ArchiveError;

/// Encrypts chunk and manifest payloads with a passphrase-derived key.
pub trait Encrypter: Send + Sync {
    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>>;

    /// `origin` only labels errors.
    fn open(&self, sealed: &[u8], origin: &Path) -> Result<Vec<u8>>;

    /// Write the encrypted form of `plain` to `cipher`; returns bytes written.
    fn encrypt(&self, plain: &Path, cipher: &Path) -> Result<u64> {
        let data = fs::read(plain).with_context(|| format!("read {:?}", plain))?;
        let sealed = self.seal(&data)?;
        write_atomic(cipher, &sealed)?;
        Ok(sealed.len() as u64)
    }

    /// Like [`encrypt`](Self::encrypt), then delete the plaintext.
    fn encrypt_and_remove(&self, plain: &Path, cipher: &Path) -> Result<u64> {
        let n = self.encrypt(plain, cipher)?;
        fs::remove_file(plain).with_context(|| format!("remove {:?}", plain))?;
        Ok(n)
    }

    fn decrypt(&self, cipher: &Path, plain: &Path) -> Result<u64> {
        let sealed = fs::read(cipher).with_context(|| format!("read {:?}", cipher))?;
        let data = self.open(&sealed, cipher)?;
        write_atomic(plain, &data)?;
        Ok(data.len() as u64)
    }
}

/// Write through a temp file in the same directory, then rename over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("create dir {:?}", dir))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error).with_context(|| format!("persist {:?}", path))?;
    Ok(())
}

/// Argon2id cost settings; recorded in every envelope so decryption can
/// re-derive the key.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfCost {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self { memory_kib: 19 * 1024, iterations: 2 }
    }
}

impl KdfCost {
    /// Cheap settings for tests and throwaway repositories.
    pub fn testing() -> Self {
        Self { memory_kib: 64, iterations: 1 }
    }
}

/// zstd, then AES-256-GCM.
pub struct AesGcmEncrypter {
    passphrase: Zeroizing<String>,
    cost: KdfCost,
    salt: [u8; 16],
    keys: Mutex<HashMap<[u8; 16], Zeroizing<[u8; 32]>>>,
    limits: EnvelopeLimits,
}

impl AesGcmEncrypter {
    pub fn new(passphrase: &str) -> Self {
        Self::with_cost(passphrase, KdfCost::default())
    }

    pub fn with_cost(passphrase: &str, cost: KdfCost) -> Self {
        let mut salt = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            passphrase: Zeroizing::new(passphrase.to_string()),
            cost,
            salt,
            keys: Mutex::new(HashMap::new()),
            limits: EnvelopeLimits::default(),
        }
    }

    fn key_for(&self, salt: &[u8; 16], cost: KdfCost) -> Result<Zeroizing<[u8; 32]>> {
        if let Some(k) = self.keys.lock().unwrap().get(salt) {
            return Ok(k.clone());
        }
        let params = Params::new(cost.memory_kib, cost.iterations, 1, Some(32))
            .map_err(|e| anyhow!("argon2 params: {e}"))?;
        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key[..])
            .map_err(|e| anyhow!("argon2 derive: {e}"))?;
        self.keys.lock().unwrap().insert(*salt, key.clone());
        Ok(key)
    }
}

impl Encrypter for AesGcmEncrypter {
    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let compressed = zstd::stream::encode_all(plain, 3).context("zstd compress")?;
        let key = self.key_for(&self.salt, self.cost)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|e| anyhow!("cipher init: {e}"))?;
        let mut nonce = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce);
        let params = KeyParams {
            salt: self.salt,
            nonce,
            kdf_memory_kib: self.cost.memory_kib,
            kdf_iterations: self.cost.iterations,
            plain_len: plain.len() as u64,
        };
        let body = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: &compressed, aad: envelope::DESC_AAD })
            .map_err(|e| anyhow!("AES-GCM encrypt: {e}"))?;
        envelope::write(CODEC_ZSTD_AES256GCM, &params, &body)
    }

    fn open(&self, sealed: &[u8], origin: &Path) -> Result<Vec<u8>> {
        let env = envelope::read(sealed, &self.limits).map_err(|e| ArchiveError::CorruptEnvelope {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        if env.codec != CODEC_ZSTD_AES256GCM {
            bail!(ArchiveError::CorruptEnvelope {
                path: origin.to_path_buf(),
                reason: format!("unknown codec {}", env.codec),
            });
        }
        let cost = KdfCost { memory_kib: env.params.kdf_memory_kib, iterations: env.params.kdf_iterations };
        let key = self.key_for(&env.params.salt, cost)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|e| anyhow!("cipher init: {e}"))?;
        let compressed = cipher
            .decrypt(Nonce::from_slice(&env.params.nonce), Payload { msg: env.body, aad: envelope::DESC_AAD })
            .map_err(|_| ArchiveError::Decryption(origin.to_path_buf()))?;
        let plain = zstd::stream::decode_all(&compressed[..]).context("zstd decompress")?;
        if plain.len() as u64 != env.params.plain_len {
            bail!(ArchiveError::CorruptEnvelope {
                path: origin.to_path_buf(),
                reason: format!("expected {} plaintext bytes, got {}", env.params.plain_len, plain.len()),
            });
        }
        Ok(plain)
    }
}
