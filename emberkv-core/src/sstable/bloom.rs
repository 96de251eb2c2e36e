//! Bloom filter for fast existence checks
//!
//! Bits are derived from the raw key bytes with one polynomial hash round per
//! entry of [`HASH_PRIMES`]. The bit set is made of atomic words so a memory
//! table can insert concurrently with readers, and it serializes to plain
//! 64-bit words so a table file reproduces it exactly.

use crate::{EmberError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Multiplier of each hash round
const HASH_PRIMES: [u64; 7] = [29, 31, 37, 43, 47, 113, 211];

/// Bloom filter over raw key bytes
pub struct BloomFilter {
    words: Box<[AtomicU64]>,
}

impl BloomFilter {
    /// Create an empty filter with `num_bits` bits (rounded up to whole words)
    pub fn new(num_bits: usize) -> Self {
        let num_words = ((num_bits + 63) / 64).max(1);
        Self {
            words: (0..num_words).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Rebuild a filter from serialized words
    pub fn from_words(words: Vec<u64>) -> Result<Self> {
        if words.is_empty() {
            return Err(EmberError::Corruption("Bloom filter has no words".into()));
        }
        Ok(Self {
            words: words.into_iter().map(AtomicU64::new).collect(),
        })
    }

    /// Number of bits in the filter
    pub fn num_bits(&self) -> usize {
        self.words.len() * 64
    }

    /// Number of 64-bit words in the filter
    pub fn num_words(&self) -> usize {
        self.words.len()
    }

    /// Add a key to the filter
    pub fn insert(&self, key: &[u8]) {
        for prime in HASH_PRIMES {
            let bit = self.bit_position(key, prime);
            self.words[bit / 64].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
    }

    /// Check if a key may be in the set; `false` means definitely absent
    pub fn might_contain(&self, key: &[u8]) -> bool {
        HASH_PRIMES.iter().all(|&prime| {
            let bit = self.bit_position(key, prime);
            self.words[bit / 64].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
        })
    }

    /// OR another filter's bits into this one
    pub fn union(&self, other: &BloomFilter) -> Result<()> {
        if self.words.len() != other.words.len() {
            return Err(EmberError::InvalidFormat(format!(
                "Cannot merge bloom filters of {} and {} bits",
                self.num_bits(),
                other.num_bits()
            )));
        }
        for (mine, theirs) in self.words.iter().zip(other.words.iter()) {
            mine.fetch_or(theirs.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Snapshot of the raw words
    pub fn to_words(&self) -> Vec<u64> {
        self.words.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    /// Serialize as big-endian words followed by the word count
    pub fn encode(&self, buf: &mut BytesMut) {
        for word in self.to_words() {
            buf.put_u64(word);
        }
        buf.put_u32(self.words.len() as u32);
    }

    /// Parse words laid out by [`BloomFilter::encode`], without the trailing count
    pub fn decode_words(mut data: &[u8], num_words: usize) -> Result<Self> {
        if data.len() != num_words * 8 {
            return Err(EmberError::Corruption(format!(
                "Bloom filter expects {} bytes, found {}",
                num_words * 8,
                data.len()
            )));
        }
        let words = (0..num_words).map(|_| data.get_u64()).collect();
        Self::from_words(words)
    }

    fn bit_position(&self, key: &[u8], prime: u64) -> usize {
        let mut hash = 1u64;
        for &byte in key {
            hash = hash.wrapping_mul(prime).wrapping_add(byte as u64);
        }
        (mix(hash ^ prime) % self.num_bits() as u64) as usize
    }
}

impl Clone for BloomFilter {
    fn clone(&self) -> Self {
        Self {
            words: self.to_words().into_iter().map(AtomicU64::new).collect(),
        }
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("num_bits", &self.num_bits())
            .finish()
    }
}

// 64-bit finalizer from MurmurHash3; spreads the polynomial hash over all bits
fn mix(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}
