//! Per-RPC inbound message reassembly (spec §4.1): the receive-side
//! counterpart of `elvis-core`'s datagram reassembly in
//! `protocols/ipv4/reassembly.rs`, but keyed on byte offset instead of IP
//! fragment id, and draining forward into a user buffer pool instead of
//! concatenating into one in-memory datagram.

use std::collections::VecDeque;

use crate::buffer_pool::{BufferPool, BufferPoolError};
use crate::rpc::fragment::Fragment;

/// Length of the probe RESEND range sent for an uninitialised message, so
/// the peer learns we exist without yet knowing `total_length`.
pub const UNINITIALISED_RESEND_PROBE_LEN: u32 = 100;

/// The receive-side state of one inbound message (spec §3 "Inbound
/// Message").
#[derive(Debug)]
pub struct Msgin {
    /// Declared total length, or `-1` before the first DATA packet arrives.
    total_length: i64,
    /// The receiver's current grant ceiling: bytes the sender is authorised
    /// to transmit.
    pub incoming: u32,
    /// `total_length` minus bytes actually received into the fragment set,
    /// clamped to never go negative.
    bytes_remaining: i64,
    /// Bytes already delivered to user memory. Monotonically non-decreasing.
    copied_out: u32,
    /// Whether this message exceeds the unscheduled threshold and therefore
    /// needs grants beyond its initial burst.
    pub scheduled: bool,
    /// Fragments kept sorted by offset with no duplicate or fully-redundant
    /// entries.
    fragments: VecDeque<Fragment>,
    pub num_skbs: usize,
    pub birth: u64,
}

impl Msgin {
    /// An uninitialised msgin, as it exists before the first DATA packet for
    /// an RPC arrives.
    pub fn uninitialised(birth: u64) -> Self {
        Self {
            total_length: -1,
            incoming: 0,
            bytes_remaining: 0,
            copied_out: 0,
            scheduled: false,
            fragments: VecDeque::new(),
            num_skbs: 0,
            birth,
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.total_length >= 0
    }

    pub fn total_length(&self) -> Option<u32> {
        (self.total_length >= 0).then_some(self.total_length as u32)
    }

    pub fn bytes_remaining(&self) -> u32 {
        self.bytes_remaining.max(0) as u32
    }

    pub fn copied_out(&self) -> u32 {
        self.copied_out
    }

    /// Initialises a freshly-created msgin from the first DATA packet's
    /// header fields. `unsched` is the local unscheduled-byte cutoff for the
    /// priority this message arrived at.
    pub fn init(&mut self, total_length: u32, unsched: u32) {
        self.total_length = total_length as i64;
        self.scheduled = total_length > unsched;
        self.incoming = if self.scheduled { unsched } else { total_length };
        self.bytes_remaining = total_length as i64;
    }

    /// Inserts a fragment into the ordered set, applying the dedup/overlap
    /// rules of spec §4.1. Returns whether the fragment was actually stored
    /// (a caller can use this to skip re-feeding the grantable index on a
    /// pure duplicate).
    pub fn add_packet(&mut self, fragment: Fragment) -> bool {
        if fragment.end() <= self.copied_out {
            return false;
        }
        let mut insert_at = self.fragments.len();
        for (i, existing) in self.fragments.iter().enumerate() {
            if existing.offset == fragment.offset {
                return false;
            }
            if existing.fully_contains(fragment.offset, fragment.end()) {
                return false;
            }
            if existing.offset > fragment.offset {
                insert_at = i;
                break;
            }
        }
        let len = fragment.len() as i64;
        self.fragments.insert(insert_at, fragment);
        self.bytes_remaining = (self.bytes_remaining - len).max(0);
        self.num_skbs += 1;
        true
    }

    /// Finds the lowest unreceived byte range below `min(incoming,
    /// total_length)`, for a RESEND request.
    pub fn get_resend_range(&self) -> (u32, u32) {
        if !self.is_initialised() {
            return (0, UNINITIALISED_RESEND_PROBE_LEN);
        }
        let ceiling = self.incoming.min(self.total_length as u32);
        let mut expected = self.copied_out;
        for fragment in &self.fragments {
            if fragment.offset > expected {
                let gap_end = fragment.offset.min(ceiling);
                if expected < gap_end {
                    return (expected, gap_end - expected);
                }
            }
            expected = expected.max(fragment.end());
            if expected >= ceiling {
                return (0, 0);
            }
        }
        if expected < ceiling {
            return (expected, ceiling - expected);
        }
        (0, 0)
    }

    /// Copies every contiguous byte available at the front of the fragment
    /// set into `pool`, `bpage_size` bytes at a time. Stops at the first
    /// gap, at `total_length`, or when the pool reports an error. Must be
    /// called without holding the RPC lock; concurrent `add_packet` calls
    /// may still extend the tail of the fragment set while this runs.
    pub fn copy_to_user(&mut self, pool: &dyn BufferPool) -> Result<(), BufferPoolError> {
        loop {
            if let Some(total_length) = self.total_length() {
                if self.copied_out >= total_length {
                    break;
                }
            }
            let Some(front) = self.fragments.front_mut() else {
                break;
            };
            if front.offset != self.copied_out {
                break;
            }
            let chunk_len = (front.len() as usize).min(pool.bpage_size());
            if chunk_len == 0 {
                self.fragments.pop_front();
                continue;
            }
            let copied = pool.copy_datagram_iter(&front.data, 0, chunk_len)?;
            if copied == 0 {
                break;
            }
            front.data.remove_front(copied);
            front.offset += copied as u32;
            self.copied_out += copied as u32;
            if front.is_empty() {
                self.fragments.pop_front();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::test_pool::{FailingBufferPool, RecordingBufferPool};
    use crate::Message;

    fn frag(offset: u32, len: usize) -> Fragment {
        Fragment::new(offset, Message::new(vec![0u8; len]))
    }

    #[test]
    fn out_of_order_reassembly_tracks_bytes_remaining() {
        let mut msgin = Msgin::uninitialised(0);
        msgin.init(10_000, 10_000);
        msgin.add_packet(frag(1400, 1400));
        msgin.add_packet(frag(4200, 800));
        msgin.add_packet(frag(0, 1400));

        let offsets: Vec<u32> = msgin.fragments.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 1400, 4200]);
        assert_eq!(msgin.bytes_remaining(), 6400);
    }

    #[test]
    fn resend_range_reports_lowest_gap() {
        let mut msgin = Msgin::uninitialised(0);
        msgin.init(10_000, 10_000);
        msgin.add_packet(frag(0, 1400));
        msgin.add_packet(frag(8600, 1400));
        assert_eq!(msgin.get_resend_range(), (1400, 7200));
    }

    #[test]
    fn resend_range_probes_uninitialised_message() {
        let msgin = Msgin::uninitialised(0);
        assert_eq!(
            msgin.get_resend_range(),
            (0, UNINITIALISED_RESEND_PROBE_LEN)
        );
    }

    #[test]
    fn resend_range_is_empty_when_fully_covered() {
        let mut msgin = Msgin::uninitialised(0);
        msgin.init(2000, 2000);
        msgin.add_packet(frag(0, 2000));
        assert_eq!(msgin.get_resend_range(), (0, 0));
    }

    #[test]
    fn duplicate_and_overlapping_fragments_are_dropped() {
        let mut msgin = Msgin::uninitialised(0);
        msgin.init(10_000, 10_000);
        assert!(msgin.add_packet(frag(0, 1400)));
        assert!(!msgin.add_packet(frag(0, 1400)));
        assert!(!msgin.add_packet(frag(100, 200)));
        assert_eq!(msgin.bytes_remaining(), 8600);
    }

    #[test]
    fn fragments_before_copied_out_are_dropped_on_arrival() {
        let mut msgin = Msgin::uninitialised(0);
        msgin.init(10_000, 10_000);
        msgin.add_packet(frag(0, 1400));
        let pool = RecordingBufferPool::new(4096);
        msgin.copy_to_user(&pool).unwrap();
        assert_eq!(msgin.copied_out(), 1400);
        assert!(!msgin.add_packet(frag(0, 1400)));
    }

    #[test]
    fn copy_to_user_stops_at_gap_and_resumes() {
        let mut msgin = Msgin::uninitialised(0);
        msgin.init(3000, 3000);
        msgin.add_packet(frag(0, 1000));
        msgin.add_packet(frag(2000, 1000));
        let pool = RecordingBufferPool::new(4096);
        msgin.copy_to_user(&pool).unwrap();
        assert_eq!(msgin.copied_out(), 1000);
        assert_eq!(pool.received().len(), 1000);

        msgin.add_packet(frag(1000, 1000));
        msgin.copy_to_user(&pool).unwrap();
        assert_eq!(msgin.copied_out(), 3000);
        assert_eq!(pool.received().len(), 3000);
    }

    #[test]
    fn copy_to_user_chunks_by_bpage_size() {
        let mut msgin = Msgin::uninitialised(0);
        msgin.init(100, 100);
        msgin.add_packet(frag(0, 100));
        let pool = RecordingBufferPool::new(30);
        msgin.copy_to_user(&pool).unwrap();
        assert_eq!(msgin.copied_out(), 100);
        assert_eq!(pool.received().len(), 100);
    }

    #[test]
    fn copy_to_user_failure_is_idempotent_on_retry() {
        let mut msgin = Msgin::uninitialised(0);
        msgin.init(1000, 1000);
        msgin.add_packet(frag(0, 1000));
        let failing = FailingBufferPool;
        assert!(msgin.copy_to_user(&failing).is_err());
        assert_eq!(msgin.copied_out(), 0);

        let pool = RecordingBufferPool::new(4096);
        msgin.copy_to_user(&pool).unwrap();
        assert_eq!(msgin.copied_out(), 1000);
        assert_eq!(pool.received().len(), 1000);
    }
}
