//! Bloom filters carried by existence filters.
//!
//! Names are hashed with SHA-256. The production backend builds its filters
//! from MD5 digests, so its filters will not match this hashing. Against such
//! a backend the counts rarely reconcile and mismatched targets are
//! re-listened in full. Filters only interoperate with peers that hash the
//! same way.

use std::f64::consts::LN_2;

use sha2::{Digest, Sha256};

use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Probabilistic set of document names sent with an existence filter.
///
/// Membership uses double hashing: the first 16 bytes of the SHA-256 digest
/// of the name are read as two little-endian `u64`s `h1` and `h2`, and bit
/// `(h1 + i * h2) mod bit_count` is checked for each `i < hash_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    padding: u8,
    hash_count: u32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: u8, hash_count: u32) -> FirestoreResult<Self> {
        if padding >= 8 {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!(
                "Invalid padding when bitmap length is 0: {padding}"
            )));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        let bit_count = bitmap.len() as u64 * 8 - u64::from(padding);
        Ok(Self {
            bitmap,
            padding,
            hash_count,
            bit_count,
        })
    }

    /// Empty filter sized for `expected_entries` at the given false positive
    /// rate.
    pub fn with_false_positive_rate(expected_entries: usize, false_positive_rate: f64) -> FirestoreResult<Self> {
        if expected_entries == 0 {
            return Self::new(Vec::new(), 0, 0);
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(invalid_argument(format!(
                "Invalid false positive rate: {false_positive_rate}"
            )));
        }
        let entries = expected_entries as f64;
        let bit_count = (-entries * false_positive_rate.ln() / (LN_2 * LN_2)).ceil().max(1.0) as u64;
        let hash_count = ((bit_count as f64 / entries) * LN_2).round().max(1.0) as u32;
        let byte_count = bit_count.div_ceil(8);
        let padding = (byte_count * 8 - bit_count) as u8;
        Self::new(vec![0; byte_count as usize], padding, hash_count)
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn padding(&self) -> u8 {
        self.padding
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (first, second) = hash(value);
        (0..self.hash_count).all(|index| self.is_bit_set(self.bit_index(first, second, index)))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (first, second) = hash(value);
        for index in 0..self.hash_count {
            let bit = self.bit_index(first, second, index);
            self.bitmap[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    fn bit_index(&self, first: u64, second: u64, index: u32) -> u64 {
        first
            .wrapping_add(second.wrapping_mul(u64::from(index)))
            % self.bit_count
    }

    fn is_bit_set(&self, bit: u64) -> bool {
        self.bitmap[(bit / 8) as usize] & (1 << (bit % 8)) != 0
    }
}

fn hash(value: &str) -> (u64, u64) {
    let digest = Sha256::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}
