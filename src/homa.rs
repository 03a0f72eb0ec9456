//! The crate's facade: one [`Homa`] instance ties every receive-side table,
//! the dispatcher, and the grant scheduler together behind the handful of
//! entry points an embedder drives (inbound bytes, a periodic grant pass,
//! socket lifecycle, and `recv`).
//!
//! Grounded on `elvis-core`'s `Machine`/`internet.rs`: a thin owning struct
//! that wires up collaborators constructed elsewhere and exposes them as one
//! handle, rather than a god object that reimplements their logic.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use crate::abort::{abort_rpcs, abort_sock_rpcs};
use crate::buffer_pool::BufferPool;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::endpoint::{PeerAddress, RecvFlags, SocketId};
use crate::error::RecvError;
use crate::handoff::wait_for_message;
use crate::outbound::Outbound;
use crate::rpc::Rpc;
use crate::scheduler::GrantScheduler;
use crate::socket::HomaSocket;
use crate::wire::{Packet, WireError};

/// Owns the dispatcher, the grant scheduler, and the buffer pool handle; the
/// single object an embedder constructs once per host.
pub struct Homa {
    pub dispatcher: Dispatcher,
    pub scheduler: GrantScheduler,
    pub buffer_pool: Arc<dyn BufferPool>,
}

impl Homa {
    pub fn new(config: Config, outbound: Arc<dyn Outbound>, buffer_pool: Arc<dyn BufferPool>) -> Self {
        let scheduler = GrantScheduler::new(&config);
        Self {
            dispatcher: Dispatcher::new(config, outbound),
            scheduler,
            buffer_pool,
        }
    }

    /// Registers a new local socket, ready to receive dispatches and own
    /// RPCs (spec §3 "Socket"). The caller is responsible for choosing
    /// `id` uniquely; bind/port assignment lives outside this core.
    pub fn open_socket(&self, id: SocketId) -> Arc<HomaSocket> {
        let socket = Arc::new(HomaSocket::new(id));
        self.dispatcher.sockets.insert(socket.clone());
        socket
    }

    /// Tears down every live RPC owned by `id`, then removes the socket
    /// (spec §4.7 "abort_sock_rpcs" on close).
    pub fn close_socket(&self, id: SocketId, err: i32) {
        let Some(socket) = self.dispatcher.sockets.get(id) else {
            return;
        };
        socket.wake_all_for_shutdown();
        abort_sock_rpcs(
            &socket,
            &self.dispatcher.rpcs,
            &self.dispatcher.grantable,
            id,
            err,
        );
        self.dispatcher.sockets.remove(id);
    }

    /// Parses and dispatches one inbound frame (spec §4.5 step 1). Malformed
    /// bytes are logged and counted rather than propagated, per §7 "the
    /// dispatcher never throws".
    pub fn receive(&self, socket_id: SocketId, src_addr: Ipv4Addr, bytes: &[u8], now_micros: u64) {
        match Packet::from_bytes(bytes) {
            Ok(packet) => self.dispatcher.dispatch(socket_id, src_addr, packet, now_micros),
            Err(WireError::UnknownPacketType) => {
                tracing::warn!(socket_id, "dropped packet with unrecognised type");
                self.dispatcher.metrics.record_unknown_packet_type();
            }
            Err(WireError::TooShort) => {
                tracing::warn!(socket_id, "dropped truncated packet");
                self.dispatcher.metrics.record_malformed_packet();
            }
        }
    }

    /// Runs one grant-scheduler pass and transmits the resulting GRANT
    /// packets (spec §4.4). An embedder calls this on its own cadence (the
    /// reference implementation drives it from a timer); the pass itself is
    /// synchronous and bounded by `Config::max_overcommit`.
    pub fn run_grant_pass(&self) {
        let emissions = self.scheduler.pass(
            &self.dispatcher.config,
            &self.dispatcher.rpcs,
            &self.dispatcher.grantable,
            &self.dispatcher.metrics,
        );
        for emission in emissions {
            let Some(peer) = self.dispatcher.peers.get(emission.peer) else {
                continue;
            };
            let common = crate::wire::CommonHeader {
                src_port: 0,
                dst_port: 0,
                packet_type: crate::wire::PacketType::Grant,
                sender_id: emission.rpc.id,
            };
            self.dispatcher.outbound.xmit_control(
                Packet::control(
                    common,
                    crate::wire::PacketBody::Grant(crate::wire::GrantHeader {
                        offset: emission.offset,
                        priority: emission.priority,
                    }),
                ),
                &peer,
            );
        }
    }

    /// Aborts every RPC talking to `addr` (optionally narrowed to `port`)
    /// across every socket on this host (spec §4.7 "abort_rpcs", used for
    /// peer-timeout recovery).
    pub fn abort_peer(&self, addr: PeerAddress, port: u16, err: i32) {
        abort_rpcs(
            &self.dispatcher.sockets,
            &self.dispatcher.rpcs,
            &self.dispatcher.grantable,
            addr,
            port,
            err,
        );
    }

    /// Blocks the calling thread until exactly one RPC is ready for `socket`,
    /// copying its reassembled data into the buffer pool (spec §4.6
    /// `wait_for_message`).
    pub async fn recv(
        &self,
        socket: &HomaSocket,
        flags: RecvFlags,
        id: u64,
    ) -> Result<Arc<Rpc>, RecvError> {
        let poll_duration = Duration::from_micros(self.dispatcher.config.poll_usecs as u64);
        wait_for_message(
            socket,
            &self.dispatcher.rpcs,
            flags,
            id,
            poll_duration,
            self.buffer_pool.as_ref(),
        )
        .await
    }
}
