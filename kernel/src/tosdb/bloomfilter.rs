//! Bloom filter
//!
//! Sized from the expected entry count and target false-positive rate:
//! bits-per-entry = -ln(p) / ln²2, k = ⌈ln2 · bpe⌉ hash functions. Lookup
//! uses xxHash64 double hashing, h_i = (a + i·b) mod m.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};
use crate::tosdb::wire::{ByteReader, ByteWriter};
use crate::utils::hash::xxhash64_with_seed;
use crate::utils::math::{ceil, ln, LN2};

pub struct Bloomfilter {
    entry_count: u64,
    bits_per_entry: f64,
    error: f64,
    hash_count: u64,
    hash_seed: u64,
    bit_count: u64,
    bits: Vec<u64>,
}

impl Bloomfilter {
    /// Build an empty filter for `entry_count` keys at false-positive rate
    /// `error`.
    pub fn new(entry_count: u64, error: f64) -> KernelResult<Self> {
        if entry_count == 0 || !(error > 0.0 && error < 1.0) {
            return Err(KernelError::InvalidArgument);
        }
        let bits_per_entry = -ln(error) / (LN2 * LN2);
        let hash_count = ceil(LN2 * bits_per_entry) as u64;
        let bit_count = (entry_count as f64 * bits_per_entry) as u64;
        let words = bit_count.div_ceil(64) as usize;
        Ok(Self {
            entry_count,
            bits_per_entry,
            error,
            hash_count: hash_count.max(1),
            hash_seed: crate::utils::rng::rand64(),
            bit_count: bit_count.max(1),
            bits: vec![0; words.max(1)],
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn error_rate(&self) -> f64 {
        self.error
    }

    pub fn hash_count(&self) -> u64 {
        self.hash_count
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    /// Approximate heap footprint, used by the cache accounting.
    pub fn byte_size(&self) -> usize {
        self.bits.len() * 8 + core::mem::size_of::<Self>()
    }

    fn check_or_add(&mut self, data: &[u8], add: bool) -> bool {
        if data.is_empty() {
            return false;
        }
        let a = xxhash64_with_seed(data, self.hash_seed);
        let b = xxhash64_with_seed(data, a);

        for i in 0..self.hash_count {
            let x = a.wrapping_add(b.wrapping_mul(i)) % self.bit_count;
            let word = (x / 64) as usize;
            let bit = 1u64 << (x % 64);
            if add {
                self.bits[word] |= bit;
            } else if self.bits[word] & bit == 0 {
                return false;
            }
        }
        true
    }

    pub fn add(&mut self, data: &[u8]) -> bool {
        self.check_or_add(data, true)
    }

    pub fn check(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let a = xxhash64_with_seed(data, self.hash_seed);
        let b = xxhash64_with_seed(data, a);
        for i in 0..self.hash_count {
            let x = a.wrapping_add(b.wrapping_mul(i)) % self.bit_count;
            if self.bits[(x / 64) as usize] & (1u64 << (x % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Serialize preserving every sizing parameter and the bit array.
    pub fn serialize(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u64(self.entry_count);
        w.put_f64(self.bits_per_entry);
        w.put_f64(self.error);
        w.put_u64(self.hash_count);
        w.put_u64(self.hash_seed);
        w.put_u64(self.bit_count);
        w.put_u64(self.bits.len() as u64);
        for word in &self.bits {
            w.put_u64(*word);
        }
        w.into_bytes()
    }

    pub fn deserialize(data: &[u8]) -> KernelResult<Self> {
        let mut r = ByteReader::new(data);
        let entry_count = r.get_u64()?;
        let bits_per_entry = r.get_f64()?;
        let error = r.get_f64()?;
        let hash_count = r.get_u64()?;
        let hash_seed = r.get_u64()?;
        let bit_count = r.get_u64()?;
        let words = r.get_u64()? as usize;
        if hash_count == 0 || bit_count == 0 || words != bit_count.div_ceil(64) as usize {
            return Err(KernelError::IoFailure);
        }
        let mut bits = Vec::with_capacity(words);
        for _ in 0..words {
            bits.push(r.get_u64()?);
        }
        Ok(Self {
            entry_count,
            bits_per_entry,
            error,
            hash_count,
            hash_seed,
            bit_count,
            bits,
        })
    }
}
