//! Merges wallet-supplied filter providers into a single Bloom filter and
//! tracks its observed false-positive rate.

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::constants;
use crate::protocol::external::types::Tweak;

/// A source of hashable elements a wallet wants a peer's Bloom filter to
/// match: UTXOs, watched scripts, outpoints.
pub trait FilterProvider: Send + Sync {
    /// Number of elements this provider will insert.
    fn element_count(&self) -> usize;

    /// The earliest time (Unix seconds) any of this provider's elements
    /// could have appeared on chain, used to pick a rescan start height.
    fn earliest_key_time_seconds(&self) -> i64;

    /// Insert this provider's elements into `builder`.
    fn populate(&self, builder: &mut BloomFilterBuilder);

    /// Optional locking hook, called before `populate`.
    fn begin_bloom_filter_calculation(&self) {}

    /// Optional locking hook, called after `populate`.
    fn end_bloom_filter_calculation(&self) {}
}

/// Accumulates elements for one Bloom filter computation.
pub struct BloomFilterBuilder {
    bits: Vec<u8>,
    hash_functions_count: u32,
    tweak: u32,
}

impl BloomFilterBuilder {
    fn new(bit_count: usize, hash_functions_count: u32, tweak: u32) -> BloomFilterBuilder {
        BloomFilterBuilder {
            bits: vec![0u8; bit_count.div_ceil(8)],
            hash_functions_count,
            tweak,
        }
    }

    /// Insert one element, setting every hash function's bit.
    pub fn insert(&mut self, element: &[u8]) {
        let bit_count = self.bits.len() * 8;
        for i in 0..self.hash_functions_count {
            let seed = i.wrapping_mul(0xFBA4_C795).wrapping_add(self.tweak);
            let hash = murmur3_32(element, seed);
            let index = (hash as u64 % bit_count as u64) as usize;
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }
}

/// BIP37's murmur3-style hash function, used to select filter bit indices.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h1 = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k1 = u32::from_le_bytes(chunk.try_into().unwrap());
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let mut k1 = 0u32;
        for (i, &byte) in remainder.iter().enumerate() {
            k1 |= (byte as u32) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(15);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85eb_ca6b);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xc2b2_ae35);
    h1 ^= h1 >> 16;
    h1
}

/// A computed Bloom filter plus the bookkeeping needed to decide whether a
/// recalculation actually changed anything.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterState {
    pub filter_bytes: Vec<u8>,
    pub hash_functions_count: u32,
    pub tweak: Tweak,
    pub earliest_key_time: i64,
    pub element_count: usize,
    pub observed_fp_rate: f64,
}

impl FilterState {
    fn empty(tweak: Tweak) -> FilterState {
        FilterState {
            filter_bytes: Vec::new(),
            hash_functions_count: 0,
            tweak,
            earliest_key_time: 0,
            element_count: 0,
            observed_fp_rate: 0.0,
        }
    }
}

/// Output of a recalculation: the new state and whether it differs from the
/// previously published one.
pub struct Recalculation {
    pub state: Arc<FilterState>,
    pub changed: bool,
}

/// Combines filter providers into one Bloom filter, publishing the result
/// through an [`ArcSwap`] so readers never block on a recompute in flight.
pub struct FilterMerger {
    current: ArcSwap<FilterState>,
    target_fp_rate: f64,
}

impl FilterMerger {
    pub fn new(tweak: Tweak, target_fp_rate: f64) -> FilterMerger {
        FilterMerger {
            current: ArcSwap::new(Arc::new(FilterState::empty(tweak))),
            target_fp_rate,
        }
    }

    pub fn current(&self) -> Arc<FilterState> {
        self.current.load_full()
    }

    /// Recompute the merged filter from `providers`, publish it, and report
    /// whether the bytes or earliest-key-time changed from the previous
    /// computation.
    pub fn recalculate(
        &self,
        providers: &[Arc<dyn FilterProvider>],
        tweak: Tweak,
    ) -> Recalculation {
        let element_count: usize = providers.iter().map(|p| p.element_count()).sum();
        let earliest_key_time = providers
            .iter()
            .map(|p| p.earliest_key_time_seconds())
            .min()
            .unwrap_or(0);

        let n = element_count.max(1) as f64;
        let p = self.target_fp_rate;
        let m_bits = (-n * p.ln() / (std::f64::consts::LN_2.powi(2))).ceil() as usize;
        let m_bits = m_bits.clamp(1, constants::MAX_FILTER_BYTES * 8);
        let k = ((m_bits as f64 / n) * std::f64::consts::LN_2).round() as u32;
        let k = k.clamp(1, constants::MAX_FILTER_HASH_FUNCS);

        let mut builder = BloomFilterBuilder::new(m_bits, k, tweak.0);
        for provider in providers {
            provider.begin_bloom_filter_calculation();
            provider.populate(&mut builder);
            provider.end_bloom_filter_calculation();
        }

        let previous = self.current.load();
        let changed = builder.bits != previous.filter_bytes
            || earliest_key_time != previous.earliest_key_time;

        let state = Arc::new(FilterState {
            filter_bytes: builder.bits,
            hash_functions_count: k,
            tweak,
            earliest_key_time,
            element_count,
            observed_fp_rate: previous.observed_fp_rate,
        });
        self.current.store(state.clone());

        Recalculation { state, changed }
    }

    /// Record an observed false-positive rate (e.g. from a downloaded
    /// filtered block's match ratio). Returns `true` if the rate exceeds
    /// `target * MAX_FP_RATE_INCREASE`, signalling the caller should force a
    /// filter resend.
    pub fn observe_fp_rate(&self, observed: f64) -> bool {
        let previous = self.current.load_full();
        let mut updated = (*previous).clone();
        updated.observed_fp_rate = observed;
        self.current.store(Arc::new(updated));
        observed > self.target_fp_rate * constants::MAX_FP_RATE_INCREASE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider(Vec<Vec<u8>>, i64);

    impl FilterProvider for FixedProvider {
        fn element_count(&self) -> usize {
            self.0.len()
        }
        fn earliest_key_time_seconds(&self) -> i64 {
            self.1
        }
        fn populate(&self, builder: &mut BloomFilterBuilder) {
            for element in &self.0 {
                builder.insert(element);
            }
        }
    }

    #[test]
    fn identical_inputs_and_tweak_produce_identical_filters() {
        let merger = FilterMerger::new(Tweak(42), constants::DEFAULT_FILTER_FP_RATE);
        let providers: Vec<Arc<dyn FilterProvider>> = vec![Arc::new(FixedProvider(
            (0..10).map(|i| vec![i as u8; 20]).collect(),
            1_600_000_000,
        ))];
        let first = merger.recalculate(&providers, Tweak(42));
        let second = merger.recalculate(&providers, Tweak(42));
        assert_eq!(first.state.filter_bytes, second.state.filter_bytes);
    }

    #[test]
    fn changed_reflects_elements_and_earliest_key_time() {
        let merger = FilterMerger::new(Tweak(7), constants::DEFAULT_FILTER_FP_RATE);
        let base: Vec<Vec<u8>> = (0..10).map(|i| vec![i as u8; 20]).collect();
        let p1: Vec<Arc<dyn FilterProvider>> =
            vec![Arc::new(FixedProvider(base.clone(), 1_600_000_000))];
        let first = merger.recalculate(&p1, Tweak(7));
        assert!(first.changed);

        let mut extended = base.clone();
        extended.push(vec![99u8; 20]);
        let p2: Vec<Arc<dyn FilterProvider>> =
            vec![Arc::new(FixedProvider(extended, 1_600_000_000))];
        let second = merger.recalculate(&p2, Tweak(7));
        assert!(second.changed);

        let p3: Vec<Arc<dyn FilterProvider>> = vec![Arc::new(FixedProvider(base, 1_600_000_000))];
        let third = merger.recalculate(&p3, Tweak(7));
        assert!(third.changed);
        assert_eq!(third.state.filter_bytes, first.state.filter_bytes);
    }

    #[test]
    fn fp_rate_self_check_flags_when_doubled() {
        let merger = FilterMerger::new(Tweak(1), 0.001);
        assert!(!merger.observe_fp_rate(0.0015));
        assert!(merger.observe_fp_rate(0.003));
    }
}
