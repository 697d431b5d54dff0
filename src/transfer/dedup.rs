//! Probabilistic duplicate filter for streaming sources.
//!
//! Cursor-paginated CRM sources can repeat records across pages when data
//! changes during a long export. Records are keyed by a caller-supplied id and
//! checked against a scalable Bloom filter; a hit is skipped and counted, never
//! processed.
//!
//! The source size is only an estimate, so the filter grows: once the newest
//! layer holds as many keys as it was sized for, a layer twice as large with a
//! halved false-positive rate is added. The combined false-positive rate stays
//! below twice the configured rate however many records the source yields.

use fastbloom::BloomFilter;
use tracing::debug;

/// Expected distinct records when the source gives no estimate.
pub const DEFAULT_EXPECTED_RECORDS: usize = 100_000;

/// Default false-positive rate of the first layer.
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.000_000_1;

/// Smallest layer ever allocated.
pub const MIN_LAYER_CAPACITY: usize = 1024;

const LAYER_GROWTH: usize = 2;
const LAYER_TIGHTENING: f64 = 0.5;
const HASH_SEED: u128 = 0x6372_6d2d_7472_616e_7366_6572;

struct Layer {
    bloom: BloomFilter,
    capacity: usize,
    len: usize,
}

impl Layer {
    fn new(capacity: usize, false_positive_rate: f64) -> Self {
        Self {
            bloom: BloomFilter::with_false_pos(false_positive_rate)
                .seed(&HASH_SEED)
                .expected_items(capacity),
            capacity,
            len: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.len >= self.capacity
    }
}

/// Bloom-filter backed "seen before" check.
pub struct DuplicateFilter {
    layers: Vec<Layer>,
    false_positive_rate: f64,
    inserted: u64,
    skipped: u64,
}

impl DuplicateFilter {
    /// Filter whose first layer holds `expected_records` keys at
    /// `false_positive_rate`.
    pub fn new(expected_records: usize, false_positive_rate: f64) -> Self {
        let capacity = expected_records.max(MIN_LAYER_CAPACITY);
        Self {
            layers: vec![Layer::new(capacity, false_positive_rate)],
            false_positive_rate,
            inserted: 0,
            skipped: 0,
        }
    }

    /// Filter for a source with an optional size estimate.
    pub fn for_estimate(estimated_total: Option<u64>) -> Self {
        let expected = estimated_total
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_EXPECTED_RECORDS);
        Self::new(expected, DEFAULT_FALSE_POSITIVE_RATE)
    }

    /// Record `key`; returns `true` if it was (probably) seen before.
    pub fn check_and_insert(&mut self, key: &str) -> bool {
        if self.layers.iter().any(|layer| layer.bloom.contains(key)) {
            self.skipped += 1;
            return true;
        }
        let layer = self.active_layer();
        layer.bloom.insert(key);
        layer.len += 1;
        self.inserted += 1;
        false
    }

    /// Keep only unseen records of a page; returns the number skipped.
    pub fn retain_unseen<T, K>(&mut self, records: &mut Vec<T>, key: K) -> u64
    where
        K: Fn(&T) -> Option<String>,
    {
        let before = records.len();
        records.retain(|record| match key(record) {
            Some(id) => !self.check_and_insert(&id),
            None => true,
        });
        (before - records.len()) as u64
    }

    /// Distinct keys recorded.
    pub fn inserted(&self) -> u64 {
        self.inserted
    }

    /// Keys rejected as duplicates.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Bloom layers allocated so far.
    pub fn layers(&self) -> usize {
        self.layers.len()
    }

    /// Newest layer with room for one more key.
    fn active_layer(&mut self) -> &mut Layer {
        let full = self.layers.last().map_or(true, Layer::is_full);
        if full {
            let depth = self.layers.len();
            let capacity = self
                .layers
                .last()
                .map_or(MIN_LAYER_CAPACITY, |layer| layer.capacity.saturating_mul(LAYER_GROWTH));
            let rate = self.false_positive_rate * LAYER_TIGHTENING.powi(depth as i32);
            debug!(
                layer = depth + 1,
                capacity,
                false_positive_rate = rate,
                inserted = self.inserted,
                "Growing duplicate filter"
            );
            self.layers.push(Layer::new(capacity, rate));
        }
        let last = self.layers.len() - 1;
        &mut self.layers[last]
    }
}

impl std::fmt::Debug for DuplicateFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplicateFilter")
            .field("inserted", &self.inserted)
            .field("skipped", &self.skipped)
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::for_estimate(None)
    }
}
