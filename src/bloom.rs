//! Bloom filter policy for table filter blocks.
//!
//! Each filter partition is a bit array plus a trailing byte recording
//! the number of probes. Probes are synthesized from a single 32-bit
//! hash by double hashing, so membership tests stay cheap. False
//! positives are possible, false negatives are not.

use xxhash_rust::xxh32::xxh32;

const HASH_SEED: u32 = 0xbc9f_1d34;

/// Name advertised in the table meta-index (`"filter." || name`)
pub const FILTER_POLICY_NAME: &str = "bloom";

fn bloom_hash(key: &[u8]) -> u32 {
    xxh32(key, HASH_SEED)
}

#[derive(Clone, Debug)]
pub struct BloomPolicy {
    bits_per_key: usize,
    k: u32,
}

impl BloomPolicy {
    #[must_use]
    pub fn new(bits_per_key: usize) -> Self {
        // ~ bits_per_key * ln(2) probes minimize the false positive rate
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let k = ((bits_per_key as f64 * 0.69) as u32).clamp(1, 30);

        Self { bits_per_key, k }
    }

    /// Builds a filter partition covering `keys` and appends it to `dst`
    pub fn create_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>) {
        let mut bits = (keys.len() * self.bits_per_key).max(64);
        let bytes = bits.div_ceil(8);
        bits = bytes * 8;

        let start = dst.len();
        dst.resize(start + bytes, 0);

        for key in keys {
            let mut h = bloom_hash(key);
            let delta = h.rotate_left(15);

            for _ in 0..self.k {
                let bit_pos = (h as usize) % bits;
                dst[start + bit_pos / 8] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }

        // NOTE: Truncation is fine, k is clamped to 30
        #[allow(clippy::cast_possible_truncation)]
        dst.push(self.k as u8);
    }

    /// Tests `key` against a partition produced by [`Self::create_filter`]
    #[must_use]
    pub fn key_may_match(key: &[u8], filter: &[u8]) -> bool {
        if filter.len() < 2 {
            return false;
        }

        let bits = (filter.len() - 1) * 8;
        let k = filter[filter.len() - 1];

        if k > 30 {
            // Reserved for future encodings; err on the side of a match
            return true;
        }

        let mut h = bloom_hash(key);
        let delta = h.rotate_left(15);

        for _ in 0..k {
            let bit_pos = (h as usize) % bits;
            if filter[bit_pos / 8] & (1 << (bit_pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn filter_of(keys: &[&[u8]]) -> Vec<u8> {
        let policy = BloomPolicy::new(10);
        let keys: Vec<Vec<u8>> = keys.iter().map(|k| k.to_vec()).collect();
        let mut out = Vec::new();
        policy.create_filter(&keys, &mut out);
        out
    }

    #[test]
    fn no_false_negatives() {
        let keys: Vec<Vec<u8>> = (0..1_000u32).map(|i| i.to_le_bytes().to_vec()).collect();

        let policy = BloomPolicy::new(10);
        let mut filter = Vec::new();
        policy.create_filter(&keys, &mut filter);

        for key in &keys {
            assert!(BloomPolicy::key_may_match(key, &filter));
        }
    }

    #[test]
    fn false_positive_rate_is_sane() {
        let keys: Vec<Vec<u8>> = (0..10_000u32).map(|i| i.to_le_bytes().to_vec()).collect();

        let policy = BloomPolicy::new(10);
        let mut filter = Vec::new();
        policy.create_filter(&keys, &mut filter);

        let mut false_positives = 0;
        for i in 10_000..20_000u32 {
            if BloomPolicy::key_may_match(&i.to_le_bytes(), &filter) {
                false_positives += 1;
            }
        }

        // ~1% expected at 10 bits per key; 3% is a generous bound
        assert!(false_positives < 300, "{false_positives} false positives");
    }

    #[test]
    fn empty_filter_matches_nothing() {
        let filter = filter_of(&[]);
        assert!(!BloomPolicy::key_may_match(b"anything", &filter));
    }

    #[test]
    fn small_filters_work() {
        let filter = filter_of(&[b"a"]);
        assert!(BloomPolicy::key_may_match(b"a", &filter));
        assert!(!BloomPolicy::key_may_match(b"b", &filter));
    }
}
