//! Process-wide counters (spec §2, §4.4, §9 "Global mutable state").
//!
//! Grounded on `elvis-core`'s `logging.rs`, which centralises a handful of
//! global atomics rather than threading a metrics handle through every
//! call; here the counters live on [`crate::homa::Homa`] instead of being
//! truly global, so lifecycle is tied to one Homa instance as spec §9
//! recommends.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for conditions spec §4.4/§4.5 call out as worth
/// tracking. Each is a plain monotonic counter; a caller samples and diffs.
#[derive(Debug, Default)]
pub struct Metrics {
    pub unknown_packet_types: AtomicU64,
    pub malformed_packets: AtomicU64,
    pub fifo_no_candidate: AtomicU64,
    pub fifo_pity_grants: AtomicU64,
    pub forced_reaps: AtomicU64,
    pub cutoffs_sent: AtomicU64,
    length_buckets: [AtomicU64; Metrics::NUM_LENGTH_BUCKETS],
}

impl Metrics {
    const NUM_LENGTH_BUCKETS: usize = 8;

    pub fn new() -> Self {
        Self::default()
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_packet_type(&self) {
        Self::inc(&self.unknown_packet_types);
    }

    pub fn record_malformed_packet(&self) {
        Self::inc(&self.malformed_packets);
    }

    pub fn record_fifo_no_candidate(&self) {
        Self::inc(&self.fifo_no_candidate);
    }

    pub fn record_fifo_pity_grant(&self) {
        Self::inc(&self.fifo_pity_grants);
    }

    pub fn record_forced_reap(&self, count: u64) {
        self.forced_reaps.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_cutoffs_sent(&self) {
        Self::inc(&self.cutoffs_sent);
    }

    /// Records a message length into a power-of-two-ish bucket (spec §4.1
    /// "init ... Record a length histogram bucket for metrics").
    pub fn record_message_length(&self, total_length: u32) {
        let bucket = (32 - total_length.leading_zeros()) as usize;
        let bucket = bucket.min(Self::NUM_LENGTH_BUCKETS - 1);
        Self::inc(&self.length_buckets[bucket]);
    }

    pub fn length_bucket(&self, bucket: usize) -> u64 {
        self.length_buckets[bucket].load(Ordering::Relaxed)
    }
}
