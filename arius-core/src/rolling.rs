//! Rabin–Karp rolling hash used for content-defined chunk boundaries.

use serde::{Deserialize, Serialize};

/// Boundary selection parameters.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollingParams {
    /// Bytes covered by the rolling window.
    pub window: usize,
    /// Multiplier of the polynomial hash.
    pub seed: u64,
    /// A boundary is declared where `(hash | mask) == hash`.
    pub mask: u64,
    /// Chunks are never cut shorter than this (except at EOF).
    pub min_len: usize,
    /// Chunks are always cut at this length.
    pub max_len: usize,
}

impl Default for RollingParams {
    fn default() -> Self {
        Self { window: 64, seed: 0x0810_4225, mask: 0xFFFF, min_len: 64, max_len: 512 * 1024 }
    }
}

impl RollingParams {
    /// Parameters targeting an average chunk of `1 << bits` bytes.
    pub fn with_average_bits(bits: u32) -> Self {
        let avg = 1usize << bits;
        Self { mask: (1u64 << bits) - 1, max_len: avg * 8, ..Self::default() }
    }

    pub fn average_len(&self) -> u64 {
        self.mask.wrapping_add(1)
    }
}

/// Polynomial hash over the last `window` bytes, updated in O(1) per byte.
pub struct RabinKarp {
    params: RollingParams,
    ring: Vec<u8>,
    pos: usize,
    filled: usize,
    hash: u64,
    /// `seed^window`, the weight of the byte leaving the window.
    out_factor: u64,
}

impl RabinKarp {
    pub fn new(params: RollingParams) -> Self {
        let window = params.window.max(1);
        let mut out_factor = 1u64;
        for _ in 0..window {
            out_factor = out_factor.wrapping_mul(params.seed);
        }
        Self { params, ring: vec![0u8; window], pos: 0, filled: 0, hash: 0, out_factor }
    }

    /// Feed one byte and return the updated hash.
    #[inline]
    pub fn roll(&mut self, byte: u8) -> u64 {
        let old = self.ring[self.pos];
        self.ring[self.pos] = byte;
        self.pos = (self.pos + 1) % self.ring.len();
        self.hash = self.hash.wrapping_mul(self.params.seed).wrapping_add(u64::from(byte));
        if self.filled == self.ring.len() {
            self.hash = self.hash.wrapping_sub(u64::from(old).wrapping_mul(self.out_factor));
        } else {
            self.filled += 1;
        }
        self.hash
    }

    #[inline]
    pub fn at_boundary(&self) -> bool {
        self.filled == self.ring.len() && (self.hash | self.params.mask) == self.hash
    }
}

/// Tracks the length of the chunk being built and decides where to cut.
pub struct BoundaryScanner {
    rk: RabinKarp,
    params: RollingParams,
    current: usize,
}

impl BoundaryScanner {
    pub fn new(params: RollingParams) -> Self {
        Self { rk: RabinKarp::new(params), params, current: 0 }
    }

    /// Feed one byte; `true` means the chunk ends after this byte.
    #[inline]
    pub fn push(&mut self, byte: u8) -> bool {
        self.rk.roll(byte);
        self.current += 1;
        let cut = self.current >= self.params.max_len
            || (self.current >= self.params.min_len && self.rk.at_boundary());
        if cut {
            self.current = 0;
        }
        cut
    }
}

/// End offsets of each chunk of `data` (the last one is always `data.len()`).
pub fn boundaries(data: &[u8], params: RollingParams) -> Vec<usize> {
    let mut scanner = BoundaryScanner::new(params);
    let mut ends = Vec::new();
    for (i, &b) in data.iter().enumerate() {
        if scanner.push(b) {
            ends.push(i + 1);
        }
    }
    if ends.last().copied() != Some(data.len()) && !data.is_empty() {
        ends.push(data.len());
    }
    ends
}
