//! A Homa socket's ready lists and interest lists (spec §3 "Socket (ready
//! lists)"), the rendezvous surface [`crate::handoff`] operates on.
//!
//! Grounded on `elvis-core`'s `protocols/sockets.rs` `Socket`, which also
//! pairs a small piece of shared, lock-protected queue state with a
//! [`Shutdown`] handle for wakeups.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::endpoint::SocketId;
use crate::handoff::Interest;
use crate::rpc::Rpc;
use crate::shutdown::Shutdown;

#[derive(Default)]
struct ReadyLists {
    ready_requests: VecDeque<Arc<Rpc>>,
    ready_responses: VecDeque<Arc<Rpc>>,
    request_interests: VecDeque<Arc<Interest>>,
    response_interests: VecDeque<Arc<Interest>>,
}

/// One application-visible Homa socket: the four ready/interest lists from
/// spec §3, a shutdown flag, and dead-RPC accounting for forced reap (spec
/// §4.5).
pub struct HomaSocket {
    pub id: SocketId,
    lists: Mutex<ReadyLists>,
    /// Signalled whenever an RPC is appended to a ready list with no
    /// interest to claim it immediately (spec §4.6 step 3c, "invoke the
    /// socket's data-ready signal").
    data_ready: Notify,
    pub shutdown: Shutdown,
    dead_rpc_count: AtomicUsize,
}

impl HomaSocket {
    pub fn new(id: SocketId) -> Self {
        Self {
            id,
            lists: Mutex::new(ReadyLists::default()),
            data_ready: Notify::new(),
            shutdown: Shutdown::new(),
            dead_rpc_count: AtomicUsize::new(0),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.try_get_status().is_some()
    }

    pub fn shut_down(&self) {
        self.shutdown.shut_down();
    }

    pub async fn wait_for_data_ready(&self) {
        self.data_ready.notified().await;
    }

    pub fn signal_data_ready(&self) {
        self.data_ready.notify_one();
    }

    pub fn push_ready_request(&self, rpc: Arc<Rpc>) {
        rpc.set_on_ready_list();
        self.lists.lock().unwrap().ready_requests.push_back(rpc);
        self.signal_data_ready();
    }

    pub fn push_ready_response(&self, rpc: Arc<Rpc>) {
        rpc.set_on_ready_list();
        self.lists.lock().unwrap().ready_responses.push_back(rpc);
        self.signal_data_ready();
    }

    pub fn pop_ready_request(&self) -> Option<Arc<Rpc>> {
        let rpc = self.lists.lock().unwrap().ready_requests.pop_front();
        if let Some(rpc) = &rpc {
            rpc.clear_on_ready_list();
        }
        rpc
    }

    pub fn pop_ready_response(&self) -> Option<Arc<Rpc>> {
        let rpc = self.lists.lock().unwrap().ready_responses.pop_front();
        if let Some(rpc) = &rpc {
            rpc.clear_on_ready_list();
        }
        rpc
    }

    pub fn push_request_interest(&self, interest: Arc<Interest>) {
        self.lists
            .lock()
            .unwrap()
            .request_interests
            .push_back(interest);
    }

    pub fn push_response_interest(&self, interest: Arc<Interest>) {
        self.lists
            .lock()
            .unwrap()
            .response_interests
            .push_back(interest);
    }

    pub fn pop_request_interest(&self) -> Option<Arc<Interest>> {
        self.lists.lock().unwrap().request_interests.pop_front()
    }

    pub fn pop_response_interest(&self) -> Option<Arc<Interest>> {
        self.lists.lock().unwrap().response_interests.pop_front()
    }

    /// Removes `interest` from both interest lists, if present (spec §4.6
    /// step 4, "deregister from any lists still holding the interest").
    pub fn remove_interest(&self, interest: &Arc<Interest>) {
        let mut lists = self.lists.lock().unwrap();
        lists
            .request_interests
            .retain(|entry| !Arc::ptr_eq(entry, interest));
        lists
            .response_interests
            .retain(|entry| !Arc::ptr_eq(entry, interest));
    }

    /// Removes `rpc` from both ready lists, if present: used when an RPC is
    /// freed while still queued (spec §8 scenario 7).
    pub fn remove_ready_rpc(&self, rpc: &Arc<Rpc>) {
        let mut lists = self.lists.lock().unwrap();
        lists.ready_requests.retain(|entry| !Arc::ptr_eq(entry, rpc));
        lists
            .ready_responses
            .retain(|entry| !Arc::ptr_eq(entry, rpc));
        rpc.clear_on_ready_list();
    }

    pub fn record_dead_rpc(&self) -> usize {
        self.dead_rpc_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_reaped(&self, count: usize) {
        self.dead_rpc_count.fetch_sub(count, Ordering::AcqRel);
    }

    pub fn dead_rpc_count(&self) -> usize {
        self.dead_rpc_count.load(Ordering::Acquire)
    }

    /// Wakes every registered interest with the shutdown sentinel (spec §5
    /// "Cancellation").
    pub fn wake_all_for_shutdown(&self) {
        self.shut_down();
        let mut lists = self.lists.lock().unwrap();
        for interest in lists.request_interests.drain(..) {
            interest.notify();
        }
        for interest in lists.response_interests.drain(..) {
            interest.notify();
        }
    }
}

/// A concurrent directory of sockets, keyed by [`SocketId`] — the table
/// [`crate::abort::abort_rpcs`] walks to find every socket that might own a
/// matching RPC.
#[derive(Default)]
pub struct SocketTable {
    sockets: crate::FxDashMap<SocketId, Arc<HomaSocket>>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, socket: Arc<HomaSocket>) {
        self.sockets.insert(socket.id, socket);
    }

    pub fn get(&self, id: SocketId) -> Option<Arc<HomaSocket>> {
        self.sockets.get(&id).map(|entry| entry.clone())
    }

    pub fn remove(&self, id: SocketId) -> Option<Arc<HomaSocket>> {
        self.sockets.remove(&id).map(|(_, socket)| socket)
    }

    pub fn iter(&self) -> Vec<Arc<HomaSocket>> {
        self.sockets.iter().map(|entry| entry.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{PeerAddress, Role};
    use crate::peer::Peer;
    use crate::rpc::Rpc;
    use std::net::Ipv4Addr;

    fn test_rpc() -> Arc<Rpc> {
        let peer = Arc::new(Peer::new(PeerAddress::new(Ipv4Addr::new(10, 0, 0, 1))));
        let id = crate::endpoint::RpcId::new(1, peer.address, 80, 2);
        Arc::new(Rpc::new(id, Role::Server, peer, 0))
    }

    #[test]
    fn ready_requests_are_fifo() {
        let socket = HomaSocket::new(1);
        let a = test_rpc();
        let b = test_rpc();
        socket.push_ready_request(a.clone());
        socket.push_ready_request(b.clone());
        assert!(Arc::ptr_eq(&socket.pop_ready_request().unwrap(), &a));
        assert!(Arc::ptr_eq(&socket.pop_ready_request().unwrap(), &b));
    }

    #[test]
    fn dead_rpc_accounting_tracks_reaps() {
        let socket = HomaSocket::new(1);
        socket.record_dead_rpc();
        socket.record_dead_rpc();
        assert_eq!(socket.dead_rpc_count(), 2);
        socket.record_reaped(1);
        assert_eq!(socket.dead_rpc_count(), 1);
    }
}
