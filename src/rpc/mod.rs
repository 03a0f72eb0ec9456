//! The per-RPC record and its receive-side state (spec §3, §4.2).
//!
//! Grounded on `elvis-core`'s `protocols/tcp/tcb.rs`: a single struct
//! guarding its mutable protocol state behind one lock, with a handful of
//! atomics (here, the handoff flags and silent-tick counter) exposed
//! outside the lock for the hot paths that must never block.

pub mod fragment;
pub mod msgout;
pub mod reassembly;
pub mod state;

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::endpoint::{RpcId, Role};
use crate::handoff::Interest;
use crate::peer::Peer;
use msgout::Msgout;
use reassembly::Msgin;
use state::RpcState;

/// Data or an error is available for delivery to a waiting thread.
pub const PKTS_READY: u8 = 1 << 0;
/// A thread is inside [`Rpc::lock`]-free copy of reassembled data; reap must
/// wait for this to clear.
pub const COPYING_TO_USER: u8 = 1 << 1;
/// A handoff is in progress: another thread already owns delivering this
/// RPC and a concurrent [`crate::handoff::handoff`] call must no-op.
pub const HANDING_OFF: u8 = 1 << 2;
/// The RPC is sitting on one of the socket's ready lists (spec §3 "An RPC
/// is on at most one ready list").
pub const ON_READY_LIST: u8 = 1 << 3;

/// State behind the per-RPC lock (spec §5 lock #3): protocol state, both
/// message directions, and the interest back-pointer.
pub struct RpcInner {
    pub state: RpcState,
    pub msgin: Msgin,
    pub msgout: Msgout,
    /// The thread, if any, whose [`Interest`] is waiting specifically on
    /// this RPC. Cleared together with `Interest::reg_rpc` under this lock.
    pub interest: Option<Weak<Interest>>,
}

/// One RPC: identified by [`RpcId`], role, and the mutable state behind its
/// own lock (spec §3 "RPC").
pub struct Rpc {
    pub id: RpcId,
    pub role: Role,
    pub peer: Arc<Peer>,
    pub birth: u64,
    silent_ticks: AtomicU32,
    /// Negative errno-shaped code, or 0 for no error (spec §7).
    error: AtomicI32,
    flags: AtomicU8,
    inner: Mutex<RpcInner>,
}

impl Rpc {
    pub fn new(id: RpcId, role: Role, peer: Arc<Peer>, birth: u64) -> Self {
        let initial_state = match role {
            Role::Client => RpcState::Outgoing,
            Role::Server => RpcState::Incoming,
        };
        Self {
            id,
            role,
            peer,
            birth,
            silent_ticks: AtomicU32::new(0),
            error: AtomicI32::new(0),
            flags: AtomicU8::new(0),
            inner: Mutex::new(RpcInner {
                state: initial_state,
                msgin: Msgin::uninitialised(birth),
                msgout: Msgout::new(0),
                interest: None,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, RpcInner> {
        self.inner.lock().unwrap()
    }

    pub fn state(&self) -> RpcState {
        self.lock().state
    }

    pub fn set_state(&self, state: RpcState) {
        self.lock().state = state;
    }

    pub fn error(&self) -> i32 {
        self.error.load(Ordering::Acquire)
    }

    /// Records an error and marks the RPC ready for handoff so the waiting
    /// `recv` caller observes it (spec §7 "Propagation policy").
    pub fn set_error(&self, code: i32) {
        self.error.store(code, Ordering::Release);
        self.set_pkts_ready();
    }

    pub fn reset_silent_ticks(&self) {
        self.silent_ticks.store(0, Ordering::Relaxed);
    }

    pub fn increment_silent_ticks(&self) -> u32 {
        self.silent_ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn silent_ticks(&self) -> u32 {
        self.silent_ticks.load(Ordering::Relaxed)
    }

    pub fn set_pkts_ready(&self) {
        self.flags.fetch_or(PKTS_READY, Ordering::AcqRel);
    }

    pub fn clear_pkts_ready(&self) {
        self.flags.fetch_and(!PKTS_READY, Ordering::AcqRel);
    }

    pub fn is_pkts_ready(&self) -> bool {
        self.flags.load(Ordering::Acquire) & PKTS_READY != 0
    }

    /// Attempts to claim `HANDING_OFF`. Returns `true` if this call won the
    /// race and now owns delivering the RPC (spec §4.6 step 1).
    pub fn try_start_handoff(&self) -> bool {
        self.flags.fetch_or(HANDING_OFF, Ordering::AcqRel) & HANDING_OFF == 0
    }

    pub fn clear_handing_off(&self) {
        self.flags.fetch_and(!HANDING_OFF, Ordering::AcqRel);
    }

    pub fn is_handing_off(&self) -> bool {
        self.flags.load(Ordering::Acquire) & HANDING_OFF != 0
    }

    pub fn start_copying_to_user(&self) {
        self.flags.fetch_or(COPYING_TO_USER, Ordering::AcqRel);
    }

    pub fn finish_copying_to_user(&self) {
        self.flags.fetch_and(!COPYING_TO_USER, Ordering::AcqRel);
    }

    pub fn is_copying_to_user(&self) -> bool {
        self.flags.load(Ordering::Acquire) & COPYING_TO_USER != 0
    }

    pub fn set_on_ready_list(&self) {
        self.flags.fetch_or(ON_READY_LIST, Ordering::AcqRel);
    }

    pub fn clear_on_ready_list(&self) {
        self.flags.fetch_and(!ON_READY_LIST, Ordering::AcqRel);
    }

    pub fn is_on_ready_list(&self) -> bool {
        self.flags.load(Ordering::Acquire) & ON_READY_LIST != 0
    }

    /// Whether this RPC may be reaped: dead, and no concurrent copy or
    /// handoff references it (spec §4.5 "Forced reap").
    pub fn is_reapable(&self) -> bool {
        self.state() == RpcState::Dead && !self.is_copying_to_user() && !self.is_handing_off()
    }
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rpc")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

/// A concurrent directory of RPCs, sharded internally by `DashMap` the way
/// `elvis-core`'s `Sockets` shards its socket table (spec §5 lock #2, "RPC
/// bucket lock (sharded by id)").
#[derive(Debug, Default)]
pub struct RpcTable {
    rpcs: crate::FxDashMap<RpcId, Arc<Rpc>>,
}

impl RpcTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, rpc: Arc<Rpc>) {
        self.rpcs.insert(rpc.id, rpc);
    }

    pub fn get(&self, id: &RpcId) -> Option<Arc<Rpc>> {
        self.rpcs.get(id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: &RpcId) -> Option<Arc<Rpc>> {
        self.rpcs.remove(id).map(|(_, rpc)| rpc)
    }

    pub fn len(&self) -> usize {
        self.rpcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rpcs.is_empty()
    }

    /// RPCs currently matching `predicate`, for abort/reap sweeps (spec
    /// §4.7).
    pub fn retain_matching(&self, mut predicate: impl FnMut(&Rpc) -> bool) -> Vec<Arc<Rpc>> {
        self.rpcs
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::PeerAddress;
    use std::net::Ipv4Addr;

    fn test_rpc(role: Role) -> Rpc {
        let peer = Arc::new(Peer::new(PeerAddress::new(Ipv4Addr::new(10, 0, 0, 1))));
        let id = RpcId::new(1, peer.address, 80, 42);
        Rpc::new(id, role, peer, 0)
    }

    #[test]
    fn client_rpc_starts_outgoing_server_rpc_starts_incoming() {
        assert_eq!(test_rpc(Role::Client).state(), RpcState::Outgoing);
        assert_eq!(test_rpc(Role::Server).state(), RpcState::Incoming);
    }

    #[test]
    fn only_one_caller_wins_handoff() {
        let rpc = test_rpc(Role::Server);
        assert!(rpc.try_start_handoff());
        assert!(!rpc.try_start_handoff());
        rpc.clear_handing_off();
        assert!(rpc.try_start_handoff());
    }

    #[test]
    fn set_error_also_marks_pkts_ready() {
        let rpc = test_rpc(Role::Client);
        assert!(!rpc.is_pkts_ready());
        rpc.set_error(-5);
        assert!(rpc.is_pkts_ready());
        assert_eq!(rpc.error(), -5);
    }

    #[test]
    fn dead_rpc_is_reapable_only_once_flags_clear() {
        let rpc = test_rpc(Role::Server);
        rpc.set_state(RpcState::Dead);
        rpc.start_copying_to_user();
        assert!(!rpc.is_reapable());
        rpc.finish_copying_to_user();
        assert!(rpc.is_reapable());
    }

    #[test]
    fn rpc_table_insert_get_remove() {
        let table = RpcTable::new();
        let peer = Arc::new(Peer::new(PeerAddress::new(Ipv4Addr::new(10, 0, 0, 1))));
        let id = RpcId::new(1, peer.address, 80, 42);
        let rpc = Arc::new(Rpc::new(id, Role::Server, peer, 0));
        table.insert(rpc.clone());
        assert!(table.get(&id).is_some());
        assert_eq!(table.len(), 1);
        table.remove(&id);
        assert!(table.get(&id).is_none());
    }
}
