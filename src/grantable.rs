//! The Grantable Index (spec §3, §4.3): a two-level ordering over every
//! scheduled RPC that still needs grants, used by [`crate::scheduler`] to
//! find the next RPC to grant.
//!
//! The reference implementation keeps both levels as O(1) intrusive
//! doubly-linked lists; spec §9 explicitly allows "implementers using
//! ownership-disciplined languages" to trade that for a simpler
//! representation. This keeps each peer's list and the global peer list as
//! plain sorted `Vec`s behind one coarse lock (spec §5 lock #4), the way
//! `elvis-core`'s `reassembly.rs` keeps a fragment set in a sorted `Vec`
//! rather than a linked list.

use std::sync::Mutex;

use crate::endpoint::{PeerAddress, RpcId};

/// One RPC's position in its peer's grantable list: enough to order it and
/// to look it up again without walking the whole structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GrantableEntry {
    id: RpcId,
    bytes_remaining: u32,
    birth: u64,
}

impl GrantableEntry {
    /// Ascending by `bytes_remaining`, older birth wins ties (spec §4.3
    /// "sorted ascending by bytes_remaining, with birth as tiebreak").
    fn precedes(&self, other: &Self) -> bool {
        (self.bytes_remaining, self.birth) < (other.bytes_remaining, other.birth)
    }
}

struct PeerList {
    address: PeerAddress,
    entries: Vec<GrantableEntry>,
}

impl PeerList {
    fn head(&self) -> Option<&GrantableEntry> {
        self.entries.first()
    }
}

/// The two-level grantable structure: each peer's RPCs ordered by
/// bytes-remaining, and peers ordered by their head RPC's bytes-remaining.
#[derive(Default)]
pub struct GrantableIndex {
    inner: Mutex<GrantableInner>,
}

#[derive(Default)]
struct GrantableInner {
    peers: Vec<PeerList>,
}

impl GrantableInner {
    fn peer_index(&self, address: PeerAddress) -> Option<usize> {
        self.peers.iter().position(|p| p.address == address)
    }

    /// Re-seats `peers[index]` so the global list stays ordered by head
    /// bytes-remaining (spec §4.3 step 2, "re-position the peer in the
    /// global list").
    fn resort_peer(&mut self, index: usize) {
        let peer = self.peers.remove(index);
        let Some(head) = peer.head().copied() else {
            return;
        };
        let insert_at = self
            .peers
            .iter()
            .position(|other| {
                other
                    .head()
                    .map(|other_head| head.precedes(other_head))
                    .unwrap_or(false)
            })
            .unwrap_or(self.peers.len());
        self.peers.insert(insert_at, peer);
    }
}

impl GrantableIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or re-sorts `id` within its peer's list (spec §4.3 insertion
    /// policy). Called whenever a DATA packet leaves the RPC with unreceived
    /// granted bytes.
    pub fn insert_or_update(
        &self,
        peer: PeerAddress,
        id: RpcId,
        bytes_remaining: u32,
        birth: u64,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let entry = GrantableEntry {
            id,
            bytes_remaining,
            birth,
        };

        let peer_idx = match inner.peer_index(peer) {
            Some(idx) => idx,
            None => {
                inner.peers.push(PeerList {
                    address: peer,
                    entries: Vec::new(),
                });
                inner.peers.len() - 1
            }
        };

        {
            let list = &mut inner.peers[peer_idx];
            list.entries.retain(|existing| existing.id != id);
            let insert_at = list
                .entries
                .iter()
                .position(|existing| entry.precedes(existing))
                .unwrap_or(list.entries.len());
            list.entries.insert(insert_at, entry);
        }

        inner.resort_peer(peer_idx);
    }

    /// Removes `id` from its peer's list, dropping the peer entirely if the
    /// list becomes empty (spec §4.3 "Removal").
    pub fn remove(&self, peer: PeerAddress, id: RpcId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(peer_idx) = inner.peer_index(peer) else {
            return;
        };
        inner.peers[peer_idx]
            .entries
            .retain(|existing| existing.id != id);
        if inner.peers[peer_idx].entries.is_empty() {
            inner.peers.remove(peer_idx);
        } else {
            inner.resort_peer(peer_idx);
        }
    }

    pub fn num_grantable_peers(&self) -> usize {
        self.inner.lock().unwrap().peers.len()
    }

    /// Returns the head RPC id of each peer, in global order — the snapshot
    /// [`crate::scheduler::GrantScheduler::pass`] walks (spec §4.4 step 2).
    pub fn peer_heads(&self) -> Vec<RpcId> {
        self.inner
            .lock()
            .unwrap()
            .peers
            .iter()
            .filter_map(|p| p.head())
            .map(|entry| entry.id)
            .collect()
    }

    /// Every grantable id that is not the head of its peer's list, oldest
    /// birth first — candidates for the FIFO pity grant (spec §4.4 step 6).
    pub fn non_head_ids_by_birth(&self) -> Vec<RpcId> {
        let inner = self.inner.lock().unwrap();
        let mut candidates: Vec<(u64, RpcId)> = inner
            .peers
            .iter()
            .flat_map(|p| p.entries.iter().skip(1))
            .map(|entry| (entry.birth, entry.id))
            .collect();
        candidates.sort_by_key(|(birth, _)| *birth);
        candidates.into_iter().map(|(_, id)| id).collect()
    }
}
