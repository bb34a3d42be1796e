//! Bloom filter over image paths.
//!
//! Sized from a target false-positive probability and an element count,
//! probed with MurmurHash3 x64_128 through Kirsch–Mitzenmacher double
//! hashing.  `test` may return false positives but never false negatives.

use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::error::{ImageError, Result};

/// False-positive probability used when none is given.
pub const DEFAULT_FP_PROB: f64 = 0.000001;

/// Approximate-membership filter recording the paths added to an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Target false-positive probability (p).
    pub fp_prob: f64,
    /// Number of probe positions per element (k).
    pub num_hashes: u64,
    /// Element count the filter was sized for (n).
    pub num_elem: u64,
    /// Number of bits in the filter (m).
    pub filter_size: u64,
    /// The bit array itself.
    pub bits: Vec<bool>,
}

impl BloomFilter {
    /// Creates a filter sized for `num_elem` elements at probability
    /// `fp_prob`.  A zero probability selects [`DEFAULT_FP_PROB`]; an
    /// element count below one is rejected.
    pub fn sized(num_elem: u64, fp_prob: f64) -> Result<Self> {
        if num_elem < 1 {
            return Err(ImageError::EmptyFilter);
        }
        let fp_prob = if fp_prob == 0.0 { DEFAULT_FP_PROB } else { fp_prob };

        let filter_size = optimal_bits(num_elem, fp_prob);
        let num_hashes = optimal_hashes(filter_size, num_elem);

        Ok(Self {
            fp_prob,
            num_hashes,
            num_elem,
            filter_size,
            bits: vec![false; filter_size as usize],
        })
    }

    /// The filter of an image with no regular files: zero bits and zero
    /// probes.  `add` is a no-op and `test` answers "maybe present" for
    /// everything, which keeps the no-false-negatives contract.
    pub fn empty() -> Self {
        Self {
            fp_prob: DEFAULT_FP_PROB,
            num_hashes: 0,
            num_elem: 0,
            filter_size: 0,
            bits: Vec::new(),
        }
    }

    /// Inserts an element by setting its probe bits.
    pub fn add(&mut self, elem: &[u8]) {
        if self.filter_size == 0 {
            return;
        }
        let (h1, h2) = hash_element(elem);
        let mut hash = h1;
        for _ in 0..self.num_hashes {
            hash = hash.wrapping_add(self.num_hashes.wrapping_mul(h2));
            self.bits[(hash % self.filter_size) as usize] = true;
        }
    }

    /// Tests membership: false means definitely absent, true means maybe
    /// present (at roughly `fp_prob` when loaded to `num_elem` elements).
    pub fn test(&self, elem: &[u8]) -> bool {
        if self.filter_size == 0 {
            return true;
        }
        let (h1, h2) = hash_element(elem);
        let mut hash = h1;
        for _ in 0..self.num_hashes {
            hash = hash.wrapping_add(self.num_hashes.wrapping_mul(h2));
            if !self.bits[(hash % self.filter_size) as usize] {
                return false;
            }
        }
        true
    }

    /// Bloom filters cannot unset bits; removal is a no-op.
    pub fn remove(&mut self, _elem: &[u8]) {}
}

/// m = ceil(n * ln(p) / ln(1 / 2^ln 2))
fn optimal_bits(num_elem: u64, fp_prob: f64) -> u64 {
    let ln2 = std::f64::consts::LN_2;
    (num_elem as f64 * fp_prob.ln() / (1.0 / 2f64.powf(ln2)).ln()).ceil() as u64
}

/// k = round((m / n) * ln 2), with m / n truncating.  The integer division
/// is part of the format's sizing law and must not be "fixed" to the
/// floating-point form.
fn optimal_hashes(filter_size: u64, num_elem: u64) -> u64 {
    ((filter_size / num_elem) as f64 * std::f64::consts::LN_2).round() as u64
}

/// MurmurHash3 x64_128 of the element, split into the two 64-bit halves
/// that drive the double-hashing probe sequence.
fn hash_element(elem: &[u8]) -> (u64, u64) {
    // Reading from an in-memory cursor cannot fail.
    let hash = murmur3::murmur3_x64_128(&mut Cursor::new(elem), 0).unwrap();
    ((hash >> 64) as u64, hash as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizing_laws() {
        let bf = BloomFilter::sized(5, 0.0001).unwrap();
        assert_eq!(bf.filter_size, 96);
        assert_eq!(bf.num_hashes, 13);
        assert_eq!(bf.bits.len(), 96);
    }

    #[test]
    fn test_default_probability() {
        let bf = BloomFilter::sized(5, 0.0).unwrap();
        assert_eq!(bf.fp_prob, DEFAULT_FP_PROB);
    }

    #[test]
    fn test_rejects_zero_elements() {
        assert!(matches!(
            BloomFilter::sized(0, 0.0001),
            Err(ImageError::EmptyFilter)
        ));
    }

    #[test]
    fn test_added_elements_are_found() {
        let mut bf = BloomFilter::sized(5, 0.0001).unwrap();
        let elems: &[&[u8]] = &[b"hello", b"world", b"sir", b"madam", b"io"];
        for elem in elems {
            bf.add(elem);
        }
        for elem in elems {
            assert!(bf.test(elem));
        }
    }

    #[test]
    fn test_absent_element_is_rejected() {
        let mut bf = BloomFilter::sized(5, 0.0001).unwrap();
        bf.add(b"hello");
        bf.add(b"world");
        assert!(!bf.test(b"goodbye"));
    }

    #[test]
    fn test_remove_is_a_noop() {
        let mut bf = BloomFilter::sized(2, 0.0001).unwrap();
        bf.add(b"keep");
        bf.remove(b"keep");
        assert!(bf.test(b"keep"));
    }

    #[test]
    fn test_empty_filter() {
        let mut bf = BloomFilter::empty();
        bf.add(b"ignored");
        assert_eq!(bf.filter_size, 0);
        assert!(bf.bits.is_empty());
        // Vacuously "maybe present": no false negatives are possible.
        assert!(bf.test(b"anything"));
    }

    #[test]
    fn test_false_positive_rate() {
        // Load a 1% filter to capacity and measure the false-positive rate
        // over ten thousand paths that were never inserted.  The measured
        // rate should stay within a factor of two of the target.
        let n = 500u64;
        let p = 0.01f64;
        let mut bf = BloomFilter::sized(n, p).unwrap();
        for i in 0..n {
            bf.add(format!("/present/{i}").as_bytes());
        }

        let queries = 10_000u32;
        let hits = (0..queries)
            .filter(|i| bf.test(format!("/absent/{i}").as_bytes()))
            .count();
        assert!(
            (hits as f64) <= 2.0 * p * queries as f64,
            "false-positive rate too high: {hits}/{queries}"
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut bf = BloomFilter::sized(3, 0.001).unwrap();
        bf.add(b"/a.txt");
        bf.add(b"/b/c.txt");
        let encoded = serde_json::to_vec(&bf).unwrap();
        let decoded: BloomFilter = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, bf);
    }
}
