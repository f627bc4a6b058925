//! Bloom filters and the time-bucketed sync index.
//!
//! Each community keeps one fixed-size [`BloomFilter`] per global-time range.
//! Buckets are contiguous, never overlap and are kept newest-first, so index 0
//! always covers the most recent range.

use dispersy_types::{BloomBits, GlobalTime};
use rand::Rng;
use sha2::{Digest, Sha256};

/// A sliced bloom filter over packet bytes.
///
/// Every key sets one bit in each slice. Slice indices are taken from a
/// SHA-256 stream over the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    slices: u8,
    bits_per_slice: u32,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Largest filter, in bytes, that is built or accepted from the wire.
    /// A sync message carrying it must still fit in one datagram.
    pub const MAX_BYTES: usize = 64 * 1024;

    /// Bytes needed for a filter of this shape.
    ///
    /// `None` for an empty shape or one larger than [`MAX_BYTES`](Self::MAX_BYTES).
    pub fn byte_len(slices: u8, bits_per_slice: u32) -> Option<usize> {
        if slices == 0 || bits_per_slice == 0 {
            return None;
        }
        let total = usize::from(slices).checked_mul(usize::try_from(bits_per_slice).ok()?)?;
        let bytes = total.div_ceil(8);
        (bytes <= Self::MAX_BYTES).then_some(bytes)
    }

    /// An empty filter.
    ///
    /// Both dimensions are raised to at least one; the size is not capped, so
    /// shapes from outside should go through [`byte_len`](Self::byte_len) first.
    pub fn new(slices: u8, bits_per_slice: u32) -> Self {
        let slices = slices.max(1);
        let bits_per_slice = bits_per_slice.max(1);
        let total = usize::from(slices) * bits_per_slice as usize;
        Self {
            slices,
            bits_per_slice,
            bits: vec![0u8; total.div_ceil(8)],
        }
    }

    /// Rebuild a filter received on the wire.
    ///
    /// Returns `None` when the declared shape is empty or too large, or when
    /// the bit array does not match it. Nothing is allocated before the
    /// shape has been checked.
    pub fn from_bits(bits: &BloomBits) -> Option<Self> {
        let expected = Self::byte_len(bits.slices, bits.bits_per_slice)?;
        if expected != bits.bits.len() {
            return None;
        }
        Some(Self {
            slices: bits.slices,
            bits_per_slice: bits.bits_per_slice,
            bits: bits.bits.clone(),
        })
    }

    /// Wire form.
    pub fn to_bits(&self) -> BloomBits {
        BloomBits {
            slices: self.slices,
            bits_per_slice: self.bits_per_slice,
            bits: self.bits.clone(),
        }
    }

    fn positions(&self, key: &[u8]) -> Vec<usize> {
        let mut positions = Vec::with_capacity(usize::from(self.slices));
        let mut counter: u32 = 0;
        while positions.len() < usize::from(self.slices) {
            let mut hasher = Sha256::new();
            hasher.update(counter.to_be_bytes());
            hasher.update(key);
            let digest = hasher.finalize();
            for chunk in digest.chunks_exact(4) {
                if positions.len() == usize::from(self.slices) {
                    break;
                }
                let slice = positions.len();
                let value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let bit = (value % self.bits_per_slice) as usize;
                positions.push(slice * self.bits_per_slice as usize + bit);
            }
            counter += 1;
        }
        positions
    }

    /// Insert a key.
    pub fn add(&mut self, key: &[u8]) {
        for position in self.positions(key) {
            self.bits[position / 8] |= 1 << (position % 8);
        }
    }

    /// Whether the key may have been inserted.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.positions(key)
            .into_iter()
            .all(|position| self.bits[position / 8] & (1 << (position % 8)) != 0)
    }

    /// Number of set bits.
    pub fn bits_checked(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// Remove every key.
    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|byte| *byte = 0);
    }
}

/// One time range of the sync index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomBucket {
    /// First global time in the range.
    pub time_low: u64,
    /// Last global time in the range (inclusive).
    pub time_high: u64,
    /// Packets stored for the range.
    pub filter: BloomFilter,
}

impl BloomBucket {
    /// Whether `global_time` falls in this range.
    pub fn covers(&self, global_time: u64) -> bool {
        self.time_low <= global_time && global_time <= self.time_high
    }
}

/// One bucket chosen for a sync round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncAdvert {
    /// Lower bound of the range.
    pub time_low: u64,
    /// Upper bound; zero for the newest bucket, meaning open-ended.
    pub time_high: u64,
    /// The bucket's filter.
    pub bloom: BloomBits,
}

/// The newest-first list of buckets of one community.
#[derive(Debug, Clone)]
pub struct BloomIndex {
    step: u64,
    slices: u8,
    bits_per_slice: u32,
    buckets: Vec<BloomBucket>,
}

impl BloomIndex {
    /// An index with one empty bucket `[0, step - 1]`.
    pub fn new(step: u64, slices: u8, bits_per_slice: u32) -> Self {
        let step = step.max(1);
        Self {
            step,
            slices,
            bits_per_slice,
            buckets: vec![BloomBucket {
                time_low: 0,
                time_high: step - 1,
                filter: BloomFilter::new(slices, bits_per_slice),
            }],
        }
    }

    /// The bucket covering `global_time`, creating newer buckets as needed.
    ///
    /// One bucket is created per `step` between the newest bucket and
    /// `global_time`; callers bound how far ahead a time may be.
    pub fn get_bloom_filter(&mut self, global_time: GlobalTime) -> &mut BloomBucket {
        let time = global_time.value();
        let mut newer = Vec::new();
        let mut time_high = self.buckets[0].time_high;
        while time_high < time {
            let time_low = time_high + 1;
            time_high = time_low.saturating_add(self.step - 1);
            newer.push(BloomBucket {
                time_low,
                time_high,
                filter: BloomFilter::new(self.slices, self.bits_per_slice),
            });
        }
        if !newer.is_empty() {
            self.buckets.splice(0..0, newer.into_iter().rev());
        }
        let index = self.index_of(time);
        &mut self.buckets[index]
    }

    fn index_of(&self, time: u64) -> usize {
        // Newest first: bucket k from the end starts at k * step.
        let from_end = (time / self.step) as usize;
        self.buckets.len() - 1 - from_end
    }

    /// Record a stored packet.
    pub fn add(&mut self, global_time: GlobalTime, packet: &[u8]) {
        self.get_bloom_filter(global_time).filter.add(packet);
    }

    /// The bucket at `index`, 0 being the newest.
    pub fn get(&self, index: usize) -> Option<&BloomBucket> {
        self.buckets.get(index)
    }

    /// Number of buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Always false; the index starts with one bucket.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// All buckets, newest first.
    pub fn buckets(&self) -> &[BloomBucket] {
        &self.buckets
    }

    /// Drop every key, keeping the bucket layout.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.filter.clear();
        }
    }

    /// Pick the buckets to advertise in the next sync round.
    ///
    /// The index is drawn from a half-gaussian with sigma `sqrt(len)`,
    /// favouring recent ranges. The newest bucket is sent with an open-ended
    /// upper bound.
    pub fn select_for_sync<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<SyncAdvert> {
        let size = self.buckets.len();
        let sigma = (size as f64).sqrt();
        let mut index = half_gaussian(rng, sigma);
        while index >= size {
            index = half_gaussian(rng, sigma);
        }
        let bucket = &self.buckets[index];
        let time_high = if index == 0 { 0 } else { bucket.time_high };
        vec![SyncAdvert {
            time_low: bucket.time_low,
            time_high,
            bloom: bucket.filter.to_bits(),
        }]
    }
}

fn half_gaussian<R: Rng + ?Sized>(rng: &mut R, sigma: f64) -> usize {
    // Box-Muller
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    (z * sigma).abs() as usize
}
