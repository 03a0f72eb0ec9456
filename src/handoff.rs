//! Handoff & Wait (spec §4.6): delivering a completed RPC to exactly one
//! waiting thread, and the application-facing `recv` blocking path.
//!
//! Grounded on `elvis-core`'s `Shutdown` (`shutdown.rs`) for the
//! wake-exactly-once broadcast shape, generalised here into a per-thread
//! [`tokio::sync::Notify`] rendezvous since each `Interest` belongs to one
//! waiter rather than being shared by every clone.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::endpoint::{RecvFlags, RpcId, Role};
use crate::error::RecvError;
use crate::rpc::{Rpc, RpcTable};
use crate::socket::HomaSocket;

/// The rendezvous structure a waiting thread registers (spec §3
/// "Interest"). `reg_rpc` is set when the caller named a specific id to
/// wait on; `ready_rpc` is deposited by [`handoff`] once a match is found.
pub struct Interest {
    ready_rpc: Mutex<Option<Arc<Rpc>>>,
    reg_rpc: Mutex<Option<RpcId>>,
    wake: Notify,
}

impl Interest {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ready_rpc: Mutex::new(None),
            reg_rpc: Mutex::new(None),
            wake: Notify::new(),
        })
    }

    pub fn reg_rpc(&self) -> Option<RpcId> {
        *self.reg_rpc.lock().unwrap()
    }

    pub fn set_reg_rpc(&self, id: Option<RpcId>) {
        *self.reg_rpc.lock().unwrap() = id;
    }

    pub fn peek_ready(&self) -> bool {
        self.ready_rpc.lock().unwrap().is_some()
    }

    pub fn take_ready(&self) -> Option<Arc<Rpc>> {
        self.ready_rpc.lock().unwrap().take()
    }

    /// Deposits `rpc` and wakes whatever thread is waiting on this
    /// interest, exactly once per deposit (spec §4.6 step 3a).
    pub fn deposit(&self, rpc: Arc<Rpc>) {
        *self.ready_rpc.lock().unwrap() = Some(rpc);
        self.wake.notify_one();
    }

    /// Wakes the waiting thread without depositing an RPC — used for the
    /// shutdown sentinel (spec §5 "Cancellation"), where the waiter learns
    /// what happened by checking the socket's shutdown flag on wake.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    async fn wait(&self) {
        self.wake.notified().await;
    }
}

/// Delivers `rpc` to exactly one waiting thread, or queues it on the
/// socket's ready lists if none is available (spec §4.6 `handoff`).
pub fn handoff(socket: &HomaSocket, rpc: &Arc<Rpc>) {
    if !rpc.try_start_handoff() {
        return;
    }

    if rpc.is_on_ready_list() {
        rpc.clear_handing_off();
        return;
    }

    let registered_interest = {
        let mut guard = rpc.lock();
        guard.interest.take().and_then(|weak| weak.upgrade())
    };

    if let Some(interest) = registered_interest {
        interest.set_reg_rpc(None);
        socket.remove_interest(&interest);
        interest.deposit(rpc.clone());
        rpc.clear_handing_off();
        return;
    }

    let waiting_interest = match rpc.role {
        Role::Client => socket.pop_response_interest(),
        Role::Server => socket.pop_request_interest(),
    };

    if let Some(interest) = waiting_interest {
        interest.deposit(rpc.clone());
        rpc.clear_handing_off();
        return;
    }

    match rpc.role {
        Role::Client => socket.push_ready_response(rpc.clone()),
        Role::Server => socket.push_ready_request(rpc.clone()),
    }
    rpc.clear_handing_off();
}

/// Blocks (or polls briefly, then sleeps) until exactly one RPC becomes
/// available and returns it (spec §4.6 `wait_for_message`).
pub async fn wait_for_message(
    socket: &HomaSocket,
    rpcs: &RpcTable,
    flags: RecvFlags,
    id: u64,
    poll_duration: Duration,
    buffer_pool: &dyn crate::buffer_pool::BufferPool,
) -> Result<Arc<Rpc>, RecvError> {
    let interest = Interest::new();

    if id != 0 {
        let target = rpcs
            .retain_matching(|rpc| rpc.id.id == id)
            .into_iter()
            .next()
            .ok_or(RecvError::Inval)?;
        if target.role != Role::Client
            || matches!(target.state(), crate::rpc::state::RpcState::Dead)
        {
            return Err(RecvError::Inval);
        }
        {
            let mut guard = target.lock();
            if guard.interest.is_some() {
                return Err(RecvError::Inval);
            }
            guard.interest = Some(Arc::downgrade(&interest));
        }
        interest.set_reg_rpc(Some(target.id));
        if target.is_pkts_ready() {
            interest.deposit(target.clone());
        }
    } else {
        if flags.request {
            if let Some(rpc) = socket.pop_ready_request() {
                interest.deposit(rpc);
            } else {
                socket.push_request_interest(interest.clone());
            }
        }
        if flags.response && !interest.peek_ready() {
            if let Some(rpc) = socket.pop_ready_response() {
                interest.deposit(rpc);
            } else {
                socket.push_response_interest(interest.clone());
            }
        }
    }

    let rpc = loop {
        if let Some(rpc) = interest.take_ready() {
            break rpc;
        }
        if socket.is_shut_down() {
            cleanup_interest(socket, &interest);
            return Err(RecvError::Shutdown);
        }
        if flags.nonblocking {
            cleanup_interest(socket, &interest);
            return Err(RecvError::Again);
        }

        let deadline = Instant::now() + poll_duration;
        let mut polled = false;
        while Instant::now() < deadline {
            if interest.peek_ready() {
                polled = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        if polled {
            continue;
        }

        tokio::select! {
            _ = interest.wait() => {},
        }
    };

    cleanup_interest(socket, &interest);

    if rpc.is_copying_to_user() {
        return Err(RecvError::Again);
    }
    let has_unread_data = {
        let guard = rpc.lock();
        guard.msgin.copied_out() < guard.msgin.total_length().unwrap_or(0)
    };
    if has_unread_data {
        rpc.start_copying_to_user();
        let result = {
            let mut guard = rpc.lock();
            guard.msgin.copy_to_user(buffer_pool)
        };
        rpc.finish_copying_to_user();
        if result.is_err() {
            rpc.set_error(RecvError::NoMem.code());
        }
    }

    Ok(rpc)
}

fn cleanup_interest(socket: &HomaSocket, interest: &Arc<Interest>) {
    socket.remove_interest(interest);
    interest.set_reg_rpc(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::test_pool::RecordingBufferPool;
    use crate::endpoint::PeerAddress;
    use crate::peer::Peer;
    use crate::rpc::state::RpcState;
    use std::net::Ipv4Addr;

    fn test_rpc(role: Role, id: u64) -> Arc<Rpc> {
        let peer = Arc::new(Peer::new(PeerAddress::new(Ipv4Addr::new(10, 0, 0, 1))));
        let rpc_id = RpcId::new(1, peer.address, 80, id);
        Arc::new(Rpc::new(rpc_id, role, peer, 0))
    }

    #[test]
    fn handoff_delivers_to_registered_interest() {
        let socket = HomaSocket::new(1);
        let rpc = test_rpc(Role::Client, 2);
        rpc.set_state(RpcState::Incoming);
        let interest = Interest::new();
        rpc.lock().interest = Some(Arc::downgrade(&interest));
        interest.set_reg_rpc(Some(rpc.id));
        rpc.set_pkts_ready();

        handoff(&socket, &rpc);

        assert!(interest.peek_ready());
        assert!(interest.reg_rpc().is_none());
        assert!(!rpc.is_handing_off());
    }

    #[test]
    fn second_handoff_while_in_progress_is_a_no_op() {
        let socket = HomaSocket::new(1);
        let rpc = test_rpc(Role::Server, 2);
        assert!(rpc.try_start_handoff());
        handoff(&socket, &rpc);
        assert!(rpc.is_handing_off());
        assert!(socket.pop_ready_request().is_none());
    }

    #[test]
    fn handoff_with_no_interest_queues_on_ready_list() {
        let socket = HomaSocket::new(1);
        let rpc = test_rpc(Role::Server, 2);
        rpc.set_pkts_ready();
        handoff(&socket, &rpc);
        assert!(socket.pop_ready_request().is_some());
        assert!(!rpc.is_handing_off());
    }

    #[tokio::test]
    async fn wait_for_message_returns_rpc_copied_to_user() {
        let socket = HomaSocket::new(1);
        let rpcs = RpcTable::new();
        let rpc = test_rpc(Role::Client, 4);
        rpc.set_state(RpcState::Incoming);
        {
            let mut guard = rpc.lock();
            guard.msgin.init(5, 5);
            guard
                .msgin
                .add_packet(crate::rpc::fragment::Fragment::new(
                    0,
                    crate::Message::new(b"hello".to_vec()),
                ));
        }
        rpc.set_pkts_ready();
        rpcs.insert(rpc.clone());

        let pool = RecordingBufferPool::new(4096);
        let result = wait_for_message(
            &socket,
            &rpcs,
            RecvFlags::RESPONSE,
            rpc.id.id,
            Duration::from_millis(5),
            &pool,
        )
        .await
        .unwrap();

        assert_eq!(result.id, rpc.id);
        assert_eq!(pool.received(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn wait_for_message_nonblocking_returns_again() {
        let socket = HomaSocket::new(1);
        let rpcs = RpcTable::new();
        let pool = RecordingBufferPool::new(4096);
        let result = wait_for_message(
            &socket,
            &rpcs,
            RecvFlags::REQUEST.nonblocking(),
            0,
            Duration::from_millis(1),
            &pool,
        )
        .await;
        assert_eq!(result.unwrap_err(), RecvError::Again);
    }

    #[tokio::test]
    async fn wait_for_message_invalid_id_returns_inval() {
        let socket = HomaSocket::new(1);
        let rpcs = RpcTable::new();
        let pool = RecordingBufferPool::new(4096);
        let result = wait_for_message(
            &socket,
            &rpcs,
            RecvFlags::RESPONSE,
            999,
            Duration::from_millis(1),
            &pool,
        )
        .await;
        assert_eq!(result.unwrap_err(), RecvError::Inval);
    }
}
