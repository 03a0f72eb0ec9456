//! Addressing types that identify sockets, peers, and RPCs.
//!
//! Grounded on `elvis-core`'s `protocols/utility.rs` `Endpoint`/`Endpoints`
//! pair (an address+port, and a local/remote pair of them) used throughout
//! `tcb.rs` as `Endpoints`. Homa's identifiers add the 64-bit RPC id on top of
//! the same local/remote shape (spec §3 "RPC ... Identified by
//! (local-socket, peer-address, peer-port, 64-bit id)").

use std::net::Ipv4Addr;

/// A local socket identifier, assigned by whatever embeds this crate (e.g. an
/// fd number or a slab index). Opaque to the core beyond equality and
/// hashing.
pub type SocketId = u32;

/// The address of a remote Homa peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(pub Ipv4Addr);

impl PeerAddress {
    pub fn new(addr: Ipv4Addr) -> Self {
        Self(addr)
    }
}

impl From<Ipv4Addr> for PeerAddress {
    fn from(addr: Ipv4Addr) -> Self {
        Self(addr)
    }
}

/// Identifies one RPC: the local socket it belongs to, the peer it talks to,
/// and the 64-bit id the client assigned (or the server remapped to an odd
/// value; see [`RpcId::is_client_assigned`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcId {
    pub socket: SocketId,
    pub peer: PeerAddress,
    pub peer_port: u16,
    pub id: u64,
}

impl RpcId {
    pub fn new(socket: SocketId, peer: PeerAddress, peer_port: u16, id: u64) -> Self {
        Self {
            socket,
            peer,
            peer_port,
            id,
        }
    }

    /// Sender-id low bit distinguishes client-assigned ids (even) from
    /// server-side remappings (odd), per spec §6.
    pub fn is_client_assigned(&self) -> bool {
        self.id & 1 == 0
    }
}

/// Which side of the RPC exchange a [`crate::rpc::Rpc`] plays, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// Flags accepted by the `HOMA_RECVMSG` equivalent, [`crate::handoff::wait_for_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvFlags {
    pub request: bool,
    pub response: bool,
    pub nonblocking: bool,
}

impl RecvFlags {
    pub const REQUEST: Self = Self {
        request: true,
        response: false,
        nonblocking: false,
    };
    pub const RESPONSE: Self = Self {
        request: false,
        response: true,
        nonblocking: false,
    };

    pub fn nonblocking(mut self) -> Self {
        self.nonblocking = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_assigned_ids_are_even() {
        let id = RpcId::new(0, PeerAddress::new(Ipv4Addr::LOCALHOST), 80, 42);
        assert!(id.is_client_assigned());
        let id = RpcId::new(0, PeerAddress::new(Ipv4Addr::LOCALHOST), 80, 43);
        assert!(!id.is_client_assigned());
    }
}
