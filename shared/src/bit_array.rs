//! Packed bit storage.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// A fixed-length array of bits, each identified by its index.
///
/// Used as the free map of the swap device: bit `i` set means slot `i` is
/// claimed.
#[derive(Clone, PartialEq, Eq)]
pub struct BitMap {
    words: Vec<u64>,
    len: usize,
}

impl BitMap {
    /// A map of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(BITS_PER_WORD)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the value of bit `idx`.
    ///
    /// Panics if `idx` is out of range.
    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        self.words[idx / BITS_PER_WORD] & (1 << (idx % BITS_PER_WORD)) != 0
    }

    /// Sets bit `idx` to `value`.
    ///
    /// Panics if `idx` is out of range.
    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        let mask = 1 << (idx % BITS_PER_WORD);
        let word = &mut self.words[idx / BITS_PER_WORD];
        if value {
            *word |= mask;
        } else {
            *word &= !mask;
        }
    }

    /// Finds the first bit at or after `start` equal to `value`, flips it, and
    /// returns its index. Returns `None` if every such bit is `!value`.
    pub fn scan_and_flip(&mut self, start: usize, value: bool) -> Option<usize> {
        let idx = self.scan(start, value)?;
        self.set(idx, !value);
        Some(idx)
    }

    /// Finds the first bit at or after `start` equal to `value`.
    pub fn scan(&self, start: usize, value: bool) -> Option<usize> {
        let mut idx = start;
        while idx < self.len {
            let word = self.words[idx / BITS_PER_WORD];
            // Bits of interest are ones after inverting when we look for clear bits.
            let candidates = (if value { word } else { !word }) >> (idx % BITS_PER_WORD);
            if candidates != 0 {
                let found = idx + candidates.trailing_zeros() as usize;
                return (found < self.len).then_some(found);
            }
            idx = (idx / BITS_PER_WORD + 1) * BITS_PER_WORD;
        }
        None
    }

    /// Number of bits equal to `value`.
    pub fn count(&self, value: bool) -> usize {
        let ones: usize = self.words.iter().map(|w| w.count_ones() as usize).sum();
        if value {
            ones
        } else {
            self.len - ones
        }
    }
}

impl fmt::Debug for BitMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitMap({}/{} set)", self.count(true), self.len)
    }
}
