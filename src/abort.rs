//! RPC teardown: freeing a completed RPC, and the abort sweeps spec §4.7
//! describes for peer timeout and socket shutdown.
//!
//! Grounded on `elvis-core`'s `protocols/sockets.rs` shutdown path, which
//! walks a table of live connections and tears each down through a single
//! shared helper rather than duplicating cleanup at every call site.

use std::sync::Arc;

use crate::endpoint::{PeerAddress, Role};
use crate::grantable::GrantableIndex;
use crate::handoff::handoff;
use crate::rpc::state::RpcState;
use crate::rpc::{Rpc, RpcTable};
use crate::socket::{HomaSocket, SocketTable};

/// Unconditionally tears down `rpc`: marks it dead, drops it from the
/// grantable index (if present), removes it from the RPC table, and removes
/// it from the owning socket's ready lists, accounting for the reap (spec
/// §4.7 "server RPCs are freed directly").
pub fn free_rpc(socket: &HomaSocket, rpcs: &RpcTable, grantable: &GrantableIndex, rpc: &Arc<Rpc>) {
    rpc.set_state(RpcState::Dead);
    grantable.remove(rpc.peer.address, rpc.id);
    socket.remove_ready_rpc(rpc);
    rpcs.remove(&rpc.id);
    socket.record_dead_rpc();
}

/// Aborts every RPC belonging to `sock_id` that talks to `addr` (and, if
/// `port` is nonzero, specifically `(addr, port)`), recording `err` on each
/// (spec §4.7 "abort_rpcs").
///
/// Client RPCs are handed the error and handed off to their waiting reader,
/// unless the owning socket is already shutting down (in which case there's
/// no reader left to hand off to, so the RPC is just freed). Server RPCs have
/// no client waiting on this side; they're freed outright. RPCs already dead
/// are left alone.
pub fn abort_rpcs(
    sockets: &SocketTable,
    rpcs: &RpcTable,
    grantable: &GrantableIndex,
    addr: PeerAddress,
    port: u16,
    err: i32,
) {
    let matching = rpcs.retain_matching(|rpc| {
        rpc.peer.address == addr
            && (port == 0 || rpc.id.peer_port == port)
            && rpc.state() != RpcState::Dead
    });

    for rpc in matching {
        let Some(socket) = sockets.get(rpc.id.socket) else {
            continue;
        };
        abort_one(&socket, rpcs, grantable, &rpc, err);
    }
}

/// Aborts every live RPC owned by `sock_id`, the way socket shutdown or close
/// tears down whatever is still outstanding (spec §4.7 "abort_sock_rpcs").
pub fn abort_sock_rpcs(
    socket: &HomaSocket,
    rpcs: &RpcTable,
    grantable: &GrantableIndex,
    sock_id: crate::endpoint::SocketId,
    err: i32,
) {
    let matching =
        rpcs.retain_matching(|rpc| rpc.id.socket == sock_id && rpc.state() != RpcState::Dead);
    for rpc in matching {
        abort_one(socket, rpcs, grantable, &rpc, err);
    }
}

fn abort_one(
    socket: &HomaSocket,
    rpcs: &RpcTable,
    grantable: &GrantableIndex,
    rpc: &Arc<Rpc>,
    err: i32,
) {
    match rpc.role {
        Role::Client => {
            if socket.is_shut_down() {
                free_rpc(socket, rpcs, grantable, rpc);
            } else {
                rpc.set_error(err);
                handoff(socket, rpc);
            }
        }
        Role::Server => free_rpc(socket, rpcs, grantable, rpc),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RpcId;
    use crate::peer::Peer;
    use std::net::Ipv4Addr;

    fn make_rpc(
        sockets: &SocketTable,
        rpcs: &RpcTable,
        sock_id: u32,
        role: Role,
        addr: Ipv4Addr,
        port: u16,
        id: u64,
    ) -> (Arc<HomaSocket>, Arc<Rpc>) {
        let socket = sockets
            .get(sock_id)
            .unwrap_or_else(|| {
                let s = Arc::new(HomaSocket::new(sock_id));
                sockets.insert(s.clone());
                s
            });
        let peer = Arc::new(Peer::new(PeerAddress::new(addr)));
        let rpc_id = RpcId::new(sock_id, peer.address, port, id);
        let rpc = Arc::new(Rpc::new(rpc_id, role, peer, 0));
        rpcs.insert(rpc.clone());
        (socket, rpc)
    }

    #[test]
    fn abort_sock_rpcs_frees_server_rpcs_and_hands_off_client_rpcs() {
        let sockets = SocketTable::new();
        let rpcs = RpcTable::new();
        let grantable = GrantableIndex::new();
        let addr = Ipv4Addr::new(10, 0, 0, 1);

        let (socket, client_rpc) =
            make_rpc(&sockets, &rpcs, 1, Role::Client, addr, 80, 2);
        let (_, server_rpc) = make_rpc(&sockets, &rpcs, 1, Role::Server, addr, 80, 3);

        abort_sock_rpcs(&socket, &rpcs, &grantable, 1, -5);

        assert_eq!(client_rpc.state(), RpcState::Dead);
        assert_eq!(client_rpc.error(), -5);
        assert!(client_rpc.is_pkts_ready());
        assert!(rpcs.get(&server_rpc.id).is_none());
    }

    #[test]
    fn abort_sock_rpcs_on_shutting_down_socket_frees_client_rpcs_too() {
        let sockets = SocketTable::new();
        let rpcs = RpcTable::new();
        let grantable = GrantableIndex::new();
        let addr = Ipv4Addr::new(10, 0, 0, 1);

        let (socket, client_rpc) =
            make_rpc(&sockets, &rpcs, 1, Role::Client, addr, 80, 2);
        socket.shut_down();

        abort_sock_rpcs(&socket, &rpcs, &grantable, 1, -5);

        assert!(rpcs.get(&client_rpc.id).is_none());
    }

    #[test]
    fn abort_rpcs_matches_on_peer_and_optional_port() {
        let sockets = SocketTable::new();
        let rpcs = RpcTable::new();
        let grantable = GrantableIndex::new();
        let addr = Ipv4Addr::new(10, 0, 0, 1);
        let other = Ipv4Addr::new(10, 0, 0, 2);

        let (_, matching) = make_rpc(&sockets, &rpcs, 1, Role::Server, addr, 80, 2);
        let (_, other_peer) = make_rpc(&sockets, &rpcs, 1, Role::Server, other, 80, 4);

        abort_rpcs(&sockets, &rpcs, &grantable, PeerAddress::new(addr), 0, -110);

        assert!(rpcs.get(&matching.id).is_none());
        assert!(rpcs.get(&other_peer.id).is_some());
    }

    #[test]
    fn dead_rpcs_are_skipped() {
        let sockets = SocketTable::new();
        let rpcs = RpcTable::new();
        let grantable = GrantableIndex::new();
        let addr = Ipv4Addr::new(10, 0, 0, 1);

        let (socket, rpc) = make_rpc(&sockets, &rpcs, 1, Role::Server, addr, 80, 2);
        rpc.set_state(RpcState::Dead);

        abort_sock_rpcs(&socket, &rpcs, &grantable, 1, -5);

        // Already dead, so the sweep must not touch dead-rpc accounting twice.
        assert_eq!(socket.dead_rpc_count(), 0);
    }
}
