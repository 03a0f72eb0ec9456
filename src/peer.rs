//! Per-peer state: the cutoffs we last heard from a peer, pending
//! piggybacked ACKs, and resend bookkeeping (spec §4.3, §6).
//!
//! Grounded on `elvis-core`'s `protocols/sockets.rs`, which keeps one shared,
//! lock-protected record per remote address in a `DashMap` rather than a
//! plain `HashMap` behind a single mutex, so lookups for unrelated peers
//! never contend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::config::NUM_CUTOFF_SLOTS;
use crate::endpoint::PeerAddress;
use crate::wire::AckDescriptor;

/// The unscheduled-priority cutoffs a peer last advertised to us, and the
/// version counter that goes with them (spec §4.3 "CUTOFFS ... version").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCutoffs {
    pub unsched_cutoffs: [u32; NUM_CUTOFF_SLOTS],
    pub cutoff_version: u32,
}

impl Default for PeerCutoffs {
    fn default() -> Self {
        Self {
            unsched_cutoffs: [u32::MAX; NUM_CUTOFF_SLOTS],
            cutoff_version: 0,
        }
    }
}

/// State kept about one remote Homa endpoint, shared by every RPC talking to
/// that peer.
#[derive(Debug)]
pub struct Peer {
    pub address: PeerAddress,
    cutoffs: Mutex<PeerCutoffs>,
    /// ACK descriptors queued to piggyback on the next DATA packet we send
    /// this peer, or to flush in a standalone ACK packet.
    pending_acks: Mutex<VecDeque<AckDescriptor>>,
    /// RESEND requests sent to this peer with no DATA seen in response yet;
    /// used to back off how aggressively we keep asking.
    outstanding_resends: AtomicU32,
    /// Monotonic clock reading (caller-supplied units) of the last CUTOFFS
    /// packet sent to this peer, for [`Config::cutoff_cooldown_micros`](crate::config::Config).
    last_cutoffs_sent_micros: AtomicU64,
}

impl Peer {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            cutoffs: Mutex::new(PeerCutoffs::default()),
            pending_acks: Mutex::new(VecDeque::new()),
            outstanding_resends: AtomicU32::new(0),
            last_cutoffs_sent_micros: AtomicU64::new(0),
        }
    }

    pub fn cutoffs(&self) -> PeerCutoffs {
        *self.cutoffs.lock().unwrap()
    }

    /// Records cutoffs received in a CUTOFFS packet, ignoring the update if
    /// it's stale (an older or equal version than what we already have).
    pub fn update_cutoffs(&self, new_cutoffs: PeerCutoffs) {
        let mut current = self.cutoffs.lock().unwrap();
        if new_cutoffs.cutoff_version > current.cutoff_version {
            *current = new_cutoffs;
        }
    }

    pub fn queue_ack(&self, ack: AckDescriptor) {
        self.pending_acks.lock().unwrap().push_back(ack);
    }

    /// Drains up to `limit` queued ACK descriptors for piggybacking on an
    /// outgoing packet, per [`Config::max_piggybacked_acks`](crate::config::Config).
    pub fn drain_acks(&self, limit: usize) -> Vec<AckDescriptor> {
        let mut pending = self.pending_acks.lock().unwrap();
        let take = limit.min(pending.len());
        pending.drain(..take).collect()
    }

    pub fn outstanding_resends(&self) -> u32 {
        self.outstanding_resends.load(Ordering::Relaxed)
    }

    pub fn record_resend_sent(&self) {
        self.outstanding_resends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear_resends(&self) {
        self.outstanding_resends.store(0, Ordering::Relaxed);
    }

    /// Returns whether enough time (per `cooldown_micros`) has passed since
    /// the last CUTOFFS packet to this peer, and if so records `now_micros`
    /// as the new high-water mark.
    pub fn try_start_cutoffs_cooldown(&self, now_micros: u64, cooldown_micros: u64) -> bool {
        let last = self.last_cutoffs_sent_micros.load(Ordering::Relaxed);
        if now_micros.saturating_sub(last) < cooldown_micros {
            return false;
        }
        self.last_cutoffs_sent_micros
            .store(now_micros, Ordering::Relaxed);
        true
    }
}

/// A concurrent directory of [`Peer`]s, keyed by address, created lazily on
/// first contact.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: crate::FxDashMap<PeerAddress, std::sync::Arc<Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, address: PeerAddress) -> std::sync::Arc<Peer> {
        self.peers
            .entry(address)
            .or_insert_with(|| std::sync::Arc::new(Peer::new(address)))
            .clone()
    }

    pub fn get(&self, address: PeerAddress) -> Option<std::sync::Arc<Peer>> {
        self.peers.get(&address).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
