//! The RPC lifecycle state machine (spec §4.2).
//!
//! Grounded on `elvis-core`'s `protocols/tcp/tcb/state.rs`, which keeps TCB
//! states as a plain enum with helper predicates rather than a trait per
//! state; Homa's receive-side states are few enough that the same shape
//! fits without needing a state pattern.

/// Receive-side RPC lifecycle state (spec §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcState {
    /// A client RPC whose request has not yet produced a reply, or a server
    /// RPC that forgot its msgin after an UNKNOWN and awaits retransmission.
    Outgoing,
    /// Actively receiving (or fully received, awaiting handoff/copy) a
    /// message from the peer.
    Incoming,
    /// Freed: explicit free, ACK receipt, or unrecoverable error. Only
    /// reclaimed once no concurrent copy-to-user or handoff references it.
    Dead,
}

impl RpcState {
    pub fn is_dead(self) -> bool {
        matches!(self, RpcState::Dead)
    }

    /// Whether an RPC in this state accepts an incoming DATA packet (spec
    /// §4.2 "DATA handling rule"): a client still `Outgoing` for its own
    /// request, or a `Dead` RPC, silently drops DATA instead.
    pub fn accepts_data(self, role: crate::endpoint::Role) -> bool {
        use crate::endpoint::Role;
        match (self, role) {
            (RpcState::Dead, _) => false,
            (RpcState::Outgoing, Role::Client) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Role;

    #[test]
    fn client_outgoing_does_not_accept_data() {
        assert!(!RpcState::Outgoing.accepts_data(Role::Client));
    }

    #[test]
    fn server_outgoing_accepts_data() {
        assert!(RpcState::Outgoing.accepts_data(Role::Server));
    }

    #[test]
    fn dead_never_accepts_data() {
        assert!(!RpcState::Dead.accepts_data(Role::Client));
        assert!(!RpcState::Dead.accepts_data(Role::Server));
    }

    #[test]
    fn incoming_accepts_data_for_either_role() {
        assert!(RpcState::Incoming.accepts_data(Role::Client));
        assert!(RpcState::Incoming.accepts_data(Role::Server));
    }
}
