//! The outbound transmission interface the dispatcher drives (spec §6
//! "Outbound interface (consumed)"). Packet serialisation and the
//! sender-side pacer live outside this core; this trait is the seam.
//!
//! Grounded on `elvis-core`'s `Pci`/`Network` split in `network_api.rs`:
//! a thin `Send + Sync` trait consumed as `Arc<dyn Trait>`, rather than an
//! `async fn` in a trait, since transmission from the core's perspective is
//! fire-and-forget (queuing onto the pacer), not a suspension point (spec
//! §5 "Suspension points").

use std::sync::Arc;

use crate::peer::Peer;
use crate::rpc::Rpc;
use crate::wire::Packet;

/// Consumed by [`crate::dispatch::Dispatcher`] to hand off everything this
/// core decides to transmit.
pub trait Outbound: Send + Sync {
    /// Transmits a fully-built control packet (GRANT, RESEND, UNKNOWN,
    /// BUSY, CUTOFFS, NEED_ACK, or ACK) to `peer`.
    fn xmit_control(&self, packet: Packet, peer: &Arc<Peer>);

    /// Requests (re)transmission of `rpc`'s outbound message data; when
    /// `retransmit` is set the sender should mark the packets as a
    /// retransmission (spec §6 DATA "retransmit flag").
    fn xmit_data(&self, rpc: &Arc<Rpc>, retransmit: bool);
}

#[cfg(test)]
pub(crate) mod test_outbound {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingOutbound {
        pub control: Mutex<Vec<Packet>>,
        pub data_requests: Mutex<Vec<(crate::endpoint::RpcId, bool)>>,
    }

    impl Outbound for RecordingOutbound {
        fn xmit_control(&self, packet: Packet, _peer: &Arc<Peer>) {
            self.control.lock().unwrap().push(packet);
        }

        fn xmit_data(&self, rpc: &Arc<Rpc>, retransmit: bool) {
            self.data_requests
                .lock()
                .unwrap()
                .push((rpc.id, retransmit));
        }
    }
}
