use std::{
    f64::consts::LN_2,
    sync::atomic::{AtomicU64, Ordering},
};
use vstate_hashes::Hash;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Target false-positive rate at the estimated cardinality
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.001;
pub const MIN_BITS: u64 = 1024;
pub const MAX_BITS: u64 = 1 << 40;
pub const MAX_HASHES: u32 = 16;

const SECOND_HASH_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// A lock-free bloom filter over node ids. Concurrent inserts only ever set bits,
/// so a member can never be reported absent.
///
/// Every filter hashes with its own random seed, so the false positives of one pass are
/// independent of those of the next one over the same marked set.
pub struct AtomicBloomFilter {
    words: Vec<AtomicU64>,
    mask: u64,
    hashes: u32,
    seed: u64,
}

impl AtomicBloomFilter {
    /// Sizes the filter for `expected_items` at false-positive rate `fp_rate`
    pub fn with_capacity(expected_items: u64, fp_rate: f64) -> Self {
        let fp_rate = fp_rate.clamp(f64::MIN_POSITIVE, 0.5);
        let n = expected_items.max(1) as f64;
        let bits = (n * -fp_rate.ln() / (LN_2 * LN_2)).ceil();
        let hashes = (-fp_rate.ln() / LN_2).ceil() as u32;
        Self::new(bits as u64, hashes)
    }

    /// Uses a fixed bit budget and picks the hash count which is optimal for `expected_items`
    pub fn with_bits(bits: u64, expected_items: u64) -> Self {
        let bits = Self::round_bits(bits);
        let hashes = ((bits as f64 / expected_items.max(1) as f64) * LN_2).round() as u32;
        Self::new(bits, hashes)
    }

    fn new(bits: u64, hashes: u32) -> Self {
        let bits = Self::round_bits(bits);
        let words = (0..bits / 64).map(|_| AtomicU64::new(0)).collect();
        Self { words, mask: bits - 1, hashes: hashes.clamp(1, MAX_HASHES), seed: rand::random() }
    }

    fn round_bits(bits: u64) -> u64 {
        bits.clamp(MIN_BITS, MAX_BITS).next_power_of_two()
    }

    #[inline]
    fn bit_positions(&self, key: &Hash) -> impl Iterator<Item = u64> + '_ {
        let bytes = key.as_bytes();
        let h1 = xxh3_64_with_seed(&bytes, self.seed);
        // An odd step visits distinct bits modulo a power of two
        let h2 = xxh3_64_with_seed(&bytes, self.seed ^ SECOND_HASH_SEED) | 1;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) & self.mask)
    }

    /// Inserts `key` and returns whether it may have been present before
    pub fn insert(&self, key: &Hash) -> bool {
        let mut present = true;
        for bit in self.bit_positions(key) {
            let flag = 1u64 << (bit % 64);
            let prev = self.words[(bit / 64) as usize].fetch_or(flag, Ordering::Relaxed);
            present &= prev & flag != 0;
        }
        present
    }

    pub fn contains(&self, key: &Hash) -> bool {
        self.bit_positions(key).all(|bit| self.words[(bit / 64) as usize].load(Ordering::Relaxed) & (1u64 << (bit % 64)) != 0)
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn bits(&self) -> u64 {
        self.mask + 1
    }

    pub fn hashes(&self) -> u32 {
        self.hashes
    }

    pub fn size_bytes(&self) -> u64 {
        self.bits() / 8
    }

    /// `(1 - e^{-kn/m})^k` for `items` inserted elements
    pub fn estimated_fp_rate(&self, items: u64) -> f64 {
        let k = self.hashes as f64;
        (1.0 - (-k * items as f64 / self.bits() as f64).exp()).powf(k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_sizing_formulas() {
        let filter = AtomicBloomFilter::with_capacity(1_000_000, 0.001);
        // -ln(0.001) / ln²2 ≈ 14.38 bits per element, rounded up to the next power of two
        assert_eq!(filter.bits(), 1 << 24);
        assert_eq!(filter.hashes(), 10);
        assert_eq!(filter.size_bytes(), (1 << 24) / 8);

        let tiny = AtomicBloomFilter::with_capacity(1, 0.001);
        assert_eq!(tiny.bits(), MIN_BITS);

        let budget = AtomicBloomFilter::with_bits(1 << 20, 100_000);
        assert_eq!(budget.bits(), 1 << 20);
        // round(2^20 / 1e5 * ln 2) = round(7.27)
        assert_eq!(budget.hashes(), 7);

        assert_eq!(AtomicBloomFilter::with_bits(1 << 20, 1).hashes(), MAX_HASHES);
        assert_eq!(AtomicBloomFilter::with_bits(1024, 1 << 30).hashes(), 1);
        assert_eq!(AtomicBloomFilter::with_bits(3000, 10).bits(), 4096);
    }

    #[test]
    fn test_no_false_negatives() {
        let mut rng = StdRng::seed_from_u64(7);
        let filter = AtomicBloomFilter::with_capacity(10_000, DEFAULT_FALSE_POSITIVE_RATE);
        let members: Vec<Hash> = (0..10_000).map(|_| Hash::from_bytes(rng.r#gen())).collect();
        for key in members.iter() {
            filter.insert(key);
        }
        assert!(members.iter().all(|key| filter.contains(key)));
        assert!(members.iter().all(|key| filter.insert(key)));

        let false_positives = (0..10_000).filter(|_| filter.contains(&Hash::from_bytes(rng.r#gen()))).count();
        // Expected around 0.1%; the bound leaves ample slack for randomness
        assert!(false_positives < 100, "too many false positives: {false_positives}");
        assert!(filter.estimated_fp_rate(10_000) < 0.01);

        filter.clear();
        assert!(!filter.contains(&members[0]));
    }

    #[test]
    fn test_false_positives_differ_between_filters() {
        let mut rng = StdRng::seed_from_u64(11);
        let members: Vec<Hash> = (0..200).map(|_| Hash::from_bytes(rng.r#gen())).collect();
        let outsiders: Vec<Hash> = (0..2_000).map(|_| Hash::from_bytes(rng.r#gen())).collect();
        // A saturated single-hash filter, about 18% of bits set
        let hits = |filter: &AtomicBloomFilter| {
            members.iter().for_each(|key| {
                filter.insert(key);
            });
            outsiders.iter().filter(|key| filter.contains(key)).copied().collect::<std::collections::HashSet<_>>()
        };
        let first = hits(&AtomicBloomFilter::with_bits(1024, 1 << 30));
        let second = hits(&AtomicBloomFilter::with_bits(1024, 1 << 30));
        assert!(!first.is_empty() && !second.is_empty());
        assert_ne!(first, second);
    }
}
