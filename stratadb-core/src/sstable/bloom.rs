//! Bloom filter for fast existence checks
//!
//! Hashing is crc32 based so filters written by one build are readable by
//! any other.

use crate::types::Key;
use crate::{Result, StrataError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const SEED: u32 = 0x9747_b28c;

/// Bloom filter implementation
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: usize,
}

impl BloomFilter {
    /// Create a new bloom filter
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        // floor of 64 bits keeps tiny tables from saturating
        let num_bits = (num_keys * bits_per_key).max(64);
        let num_bytes = (num_bits + 7) / 8;

        // Optimal number of hash functions
        let num_hashes = ((bits_per_key as f64) * 0.69).round() as usize;
        let num_hashes = num_hashes.clamp(1, 30);

        Self {
            bits: vec![0u8; num_bytes],
            num_bits: num_bytes * 8,
            num_hashes,
        }
    }

    /// Build a filter over a set of keys
    pub fn build(keys: &[Key], bits_per_key: usize) -> Self {
        let mut filter = Self::new(keys.len(), bits_per_key);
        for key in keys {
            filter.add(*key);
        }
        filter
    }

    /// Add a key to the filter
    pub fn add(&mut self, key: Key) {
        let (h1, h2) = Self::hash_key(key);

        for i in 0..self.num_hashes {
            let bit = self.bit_position(h1, h2, i);
            self.set_bit(bit);
        }
    }

    /// Check if a key may be in the set
    pub fn may_contain(&self, key: Key) -> bool {
        let (h1, h2) = Self::hash_key(key);

        (0..self.num_hashes).all(|i| self.get_bit(self.bit_position(h1, h2, i)))
    }

    /// Serialize as `num_hashes u8 | bits | crc32`
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.bits.len() + 4);
        buf.put_u8(self.num_hashes as u8);
        buf.put_slice(&self.bits);
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }

    /// Deserialize and verify
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(StrataError::Corruption("Bloom filter too short".into()));
        }
        let body = &data[..data.len() - 4];
        let expected = (&data[data.len() - 4..]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(StrataError::ChecksumMismatch { expected, actual });
        }

        let num_hashes = body[0] as usize;
        let bits = body[1..].to_vec();
        if num_hashes == 0 || bits.is_empty() {
            return Err(StrataError::Corruption("Empty bloom filter".into()));
        }
        Ok(Self {
            num_bits: bits.len() * 8,
            bits,
            num_hashes,
        })
    }

    /// Get number of hash functions
    pub fn num_hashes(&self) -> usize {
        self.num_hashes
    }

    /// Estimated false positive rate
    pub fn false_positive_rate(&self, num_keys: usize) -> f64 {
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = num_keys as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    fn hash_key(key: Key) -> (u64, u64) {
        let bytes = key.to_le_bytes();
        let lo = crc32fast::hash(&bytes);
        let mut hasher = crc32fast::Hasher::new_with_initial(SEED);
        hasher.update(&bytes);
        let hi = hasher.finalize();

        let h1 = fmix64(((hi as u64) << 32) | lo as u64);
        // odd step so every probe lands on a distinct bit
        let h2 = fmix64(h1 ^ SEED as u64) | 1;
        (h1, h2)
    }

    fn bit_position(&self, h1: u64, h2: u64, i: usize) -> usize {
        let hash = h1.wrapping_add((i as u64).wrapping_mul(h2));
        (hash % self.num_bits as u64) as usize
    }

    fn set_bit(&mut self, bit: usize) {
        self.bits[bit / 8] |= 1 << (bit % 8);
    }

    fn get_bit(&self, bit: usize) -> bool {
        (self.bits[bit / 8] >> (bit % 8)) & 1 == 1
    }
}

/// Murmur3 finalizer; breaks up the linearity of crc32
fn fmix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^ (h >> 33)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bloom_filter_basic() {
        let keys: Vec<Key> = (0..1000).map(|i| i * 7).collect();
        let filter = BloomFilter::build(&keys, 10);

        // All added keys should be found
        for key in &keys {
            assert!(filter.may_contain(*key));
        }

        // Count false positives for non-existent keys
        let false_positives = (0..10_000)
            .map(|i| i * 7 + 3)
            .filter(|k| filter.may_contain(*k))
            .count();

        // False positive rate should be around 1%
        let fp_rate = false_positives as f64 / 10_000.0;
        assert!(fp_rate < 0.05, "False positive rate too high: {}", fp_rate);
    }

    #[test]
    fn test_bloom_filter_serialization() {
        let keys: Vec<Key> = (-25..25).collect();
        let filter = BloomFilter::build(&keys, 10);

        let restored = BloomFilter::decode(&filter.encode()).unwrap();
        assert_eq!(restored.num_hashes(), filter.num_hashes());
        for key in keys {
            assert!(restored.may_contain(key));
        }

        let mut damaged = filter.encode().to_vec();
        damaged[3] ^= 0x01;
        assert!(BloomFilter::decode(&damaged).is_err());
    }
}
