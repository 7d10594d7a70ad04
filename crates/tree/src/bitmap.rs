//! Per-leaf validity bitmap.
//!
//! Packed little-endian `u64` words, bit `k % 64` of word `k / 64`
//! representing leaf `k`. In memory the words are atomics so readers
//! never take a lock; a set uses release ordering and a get acquire
//! ordering, pairing with the chunk-store write that precedes the set.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::TreeError;

#[derive(Debug)]
pub struct Bitmap {
    words: Vec<AtomicU64>,
    bits: u64,
}

impl Bitmap {
    /// All bits clear.
    pub fn new(bits: u64) -> Self {
        let words = (0..bits.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        Self { words, bits }
    }

    /// All bits set.
    pub fn full(bits: u64) -> Self {
        let bitmap = Self::new(bits);
        for k in 0..bits {
            let _ = bitmap.set(k);
        }
        bitmap
    }

    /// Decodes a persisted bitmap region. Bits beyond `bits` must be
    /// zero; a stray bit there means the file and footer disagree.
    pub fn from_bytes(bytes: &[u8], bits: u64) -> Result<Self, TreeError> {
        if bytes.len() % 8 != 0 || bytes.len() as u64 != bits.div_ceil(64) * 8 {
            return Err(TreeError::Corrupt(format!(
                "bitmap region is {} bytes, {} bits need {}",
                bytes.len(),
                bits,
                bits.div_ceil(64) * 8
            )));
        }

        let words: Vec<AtomicU64> = bytes
            .chunks_exact(8)
            .map(|word| AtomicU64::new(u64::from_le_bytes(word.try_into().expect("8-byte chunk"))))
            .collect();

        let tail_bits = bits % 64;
        if tail_bits != 0 {
            let last = words.last().expect("at least one word for non-zero bits");
            if last.load(Ordering::Relaxed) >> tail_bits != 0 {
                return Err(TreeError::Corrupt(
                    "bitmap has bits set beyond the leaf count".to_owned(),
                ));
            }
        }

        Ok(Self { words, bits })
    }

    pub fn bits(&self) -> u64 {
        self.bits
    }

    pub fn byte_len(&self) -> usize {
        self.words.len() * 8
    }

    pub fn get(&self, k: u64) -> bool {
        assert!(k < self.bits, "bit {k} out of range for {}", self.bits);
        let word = self.words[(k / 64) as usize].load(Ordering::Acquire);
        word & (1 << (k % 64)) != 0
    }

    /// Sets bit `k`, returning whether it was clear before.
    pub fn set(&self, k: u64) -> bool {
        assert!(k < self.bits, "bit {k} out of range for {}", self.bits);
        let mask = 1 << (k % 64);
        let prev = self.words[(k / 64) as usize].fetch_or(mask, Ordering::AcqRel);
        prev & mask == 0
    }

    /// Clears bit `k`, returning whether it was set before.
    pub fn clear(&self, k: u64) -> bool {
        assert!(k < self.bits, "bit {k} out of range for {}", self.bits);
        let mask = 1 << (k % 64);
        let prev = self.words[(k / 64) as usize].fetch_and(!mask, Ordering::AcqRel);
        prev & mask != 0
    }

    pub fn count_ones(&self) -> u64 {
        self.words
            .iter()
            .map(|word| u64::from(word.load(Ordering::Acquire).count_ones()))
            .sum()
    }

    pub fn is_full(&self) -> bool {
        self.count_ones() == self.bits
    }

    /// Index of the word holding bit `k`.
    pub fn word_index(k: u64) -> usize {
        (k / 64) as usize
    }

    /// Little-endian bytes of one word, for incremental persistence.
    pub fn word_bytes(&self, word_index: usize) -> [u8; 8] {
        self.words[word_index].load(Ordering::Acquire).to_le_bytes()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_len());
        for word in &self.words {
            out.extend_from_slice(&word.load(Ordering::Acquire).to_le_bytes());
        }
        out
    }
}
