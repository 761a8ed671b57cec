use md5::{Digest, Md5};

use crate::error::{invalid_argument, FirestoreResult};

/// Bloom filter sent by the backend alongside an existence filter.
///
/// Membership is tested with MD5 double hashing over the full document
/// resource name: the digest is split into two little-endian `u64`s `h1` and
/// `h2`, and the `i`-th probe is `(h1 + i * h2) mod bit_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if !bitmap.is_empty() && hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() && padding != 0 {
            return Err(invalid_argument(format!("Invalid padding when bitmap length is 0: {padding}")));
        }
        let bit_count = (bitmap.len() as u64) * 8 - padding as u64;
        Ok(Self {
            bitmap,
            bit_count,
            hash_count: hash_count as u32,
        })
    }

    /// Empty filter of `bit_count` bits, used to build filters locally.
    pub fn with_bit_count(bit_count: u64, hash_count: u32) -> Self {
        let bytes = bit_count.div_ceil(8) as usize;
        Self {
            bitmap: vec![0; bytes],
            bit_count,
            hash_count,
        }
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> u32 {
        self.hash_count
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// Unused bits in the last byte of the bitmap.
    pub fn padding(&self) -> u8 {
        ((self.bitmap.len() as u64) * 8 - self.bit_count) as u8
    }

    pub fn is_empty(&self) -> bool {
        self.bit_count == 0
    }

    /// False means `value` is definitely absent; true means it may be present.
    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let (h1, h2) = hash_pair(value);
        (0..self.hash_count).all(|i| self.is_bit_set(self.bit_index(h1, h2, i)))
    }

    pub fn insert(&mut self, value: &str) {
        if self.bit_count == 0 {
            return;
        }
        let (h1, h2) = hash_pair(value);
        for i in 0..self.hash_count {
            let index = self.bit_index(h1, h2, i);
            self.bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add(h2.wrapping_mul(i as u64)) % self.bit_count
    }

    fn is_bit_set(&self, index: u64) -> bool {
        self.bitmap[(index / 8) as usize] & (1 << (index % 8)) != 0
    }
}

fn hash_pair(value: &str) -> (u64, u64) {
    let digest = Md5::digest(value.as_bytes());
    let mut first = [0u8; 8];
    let mut second = [0u8; 8];
    first.copy_from_slice(&digest[0..8]);
    second.copy_from_slice(&digest[8..16]);
    (u64::from_le_bytes(first), u64::from_le_bytes(second))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const PREFIX: &str = "projects/project-1/databases/database-1/documents/coll/doc";

    #[test]
    fn validates_parameters() {
        assert!(BloomFilter::new(vec![], 0, 0).is_ok());
        assert!(BloomFilter::new(vec![1], 8, 1).is_err());
        assert!(BloomFilter::new(vec![1], -1, 1).is_err());
        assert!(BloomFilter::new(vec![1], 1, 0).is_err());
        assert!(BloomFilter::new(vec![], 1, 1).is_err());
        assert!(BloomFilter::new(vec![1], 1, -1).is_err());
    }

    #[test]
    fn bit_count_excludes_padding() {
        let filter = BloomFilter::new(vec![0xff, 0x0f], 4, 3).unwrap();
        assert_eq!(filter.bit_count(), 12);
        assert_eq!(filter.padding(), 4);
    }

    #[test]
    fn empty_filter_contains_nothing() {
        let filter = BloomFilter::new(vec![], 0, 0).unwrap();
        assert!(filter.is_empty());
        assert!(!filter.might_contain(""));
        assert!(!filter.might_contain("a"));
    }

    #[test]
    fn full_bitmap_contains_everything() {
        let filter = BloomFilter::new(vec![0xff; 4], 0, 7).unwrap();
        assert!(filter.might_contain("anything"));
        assert!(filter.might_contain(PREFIX));
    }

    #[test]
    fn inserted_values_are_always_found() {
        let mut filter = BloomFilter::with_bit_count(500, 8);
        for i in 0..50 {
            filter.insert(&format!("{PREFIX}{i}"));
        }
        for i in 0..50 {
            assert!(filter.might_contain(&format!("{PREFIX}{i}")), "missing {i}");
        }
    }

    #[test]
    fn false_positive_rate_stays_low() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut filter = BloomFilter::with_bit_count(10_000, 10);
        for i in 0..500 {
            filter.insert(&format!("{PREFIX}{i}"));
        }
        let mut false_positives = 0;
        for _ in 0..1_000 {
            let probe: u64 = rng.gen_range(1_000_000..2_000_000);
            if filter.might_contain(&format!("{PREFIX}{probe}")) {
                false_positives += 1;
            }
        }
        assert!(false_positives < 50, "{false_positives} false positives");
    }

    #[test]
    fn decoded_bitmap_matches_built_filter() {
        let mut built = BloomFilter::with_bit_count(60, 4);
        built.insert(&format!("{PREFIX}1"));
        let decoded = BloomFilter::new(built.bitmap().to_vec(), built.padding() as i32, 4).unwrap();
        assert!(decoded.might_contain(&format!("{PREFIX}1")));
        assert_eq!(decoded, built);
    }
}
