//! Fixed-size bloom filter used by sync selection.
//!
//! Peers advertise the packets they already hold; the responder skips
//! matching rows.  False positives are tolerated (the peer simply misses a
//! packet this round), false negatives cannot occur.

/// Bloom filter over packet bytes.
#[derive(Clone, Debug)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_hashes: u32,
}

impl BloomFilter {
    /// Filter with an explicit bit count (rounded up to whole bytes) and
    /// hash count.
    pub fn new(num_bits: usize, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(8);
        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_hashes: num_hashes.clamp(1, 8),
        }
    }

    /// Filter sized for `capacity` items at the given false-positive rate.
    pub fn with_capacity(capacity: usize, error_rate: f64) -> Self {
        let capacity = capacity.max(1) as f64;
        let rate = error_rate.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-capacity * rate.ln() / (ln2 * ln2)).ceil() as usize;
        let num_hashes = ((num_bits as f64 / capacity) * ln2).round() as u32;
        Self::new(num_bits, num_hashes.max(1))
    }

    /// Rebuild a filter received from a peer.
    pub fn from_bytes(bits: Vec<u8>, num_hashes: u32) -> Self {
        let bits = if bits.is_empty() { vec![0u8] } else { bits };
        Self {
            bits,
            num_hashes: num_hashes.clamp(1, 8),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    fn bit_indexes(&self, item: &[u8]) -> impl Iterator<Item = usize> + '_ {
        // Derive up to eight independent indexes from non-overlapping
        // windows of one blake3 digest.
        let digest = *blake3::hash(item).as_bytes();
        let num_bits = self.bits.len() * 8;
        (0..self.num_hashes as usize).map(move |i| {
            let window: [u8; 4] = [
                digest[i * 4],
                digest[i * 4 + 1],
                digest[i * 4 + 2],
                digest[i * 4 + 3],
            ];
            u32::from_le_bytes(window) as usize % num_bits
        })
    }

    pub fn insert(&mut self, item: &[u8]) {
        let indexes: Vec<usize> = self.bit_indexes(item).collect();
        for index in indexes {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.bit_indexes(item)
            .all(|index| self.bits[index / 8] & (1 << (index % 8)) != 0)
    }

    /// Fraction of set bits; useful to decide when a filter is saturated.
    pub fn fill_ratio(&self) -> f64 {
        let set: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        set as f64 / (self.bits.len() * 8) as f64
    }
}
