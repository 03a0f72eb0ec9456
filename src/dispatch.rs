//! The Packet Dispatcher (spec §4.5): demultiplexes inbound packets by type
//! and drives every other receive-side component from there.
//!
//! Grounded on `elvis-core`'s `protocol.rs` `Protocol::demux`, which is the
//! single entry point a lower layer calls with one parsed frame and fans out
//! by a type tag; here the tag is [`PacketType`] instead of an ethertype.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::abort::free_rpc;
use crate::config::Config;
use crate::endpoint::{PeerAddress, Role, RpcId, SocketId};
use crate::grantable::GrantableIndex;
use crate::handoff::handoff;
use crate::metrics::Metrics;
use crate::outbound::Outbound;
use crate::peer::{Peer, PeerCutoffs, PeerTable};
use crate::rpc::fragment::Fragment;
use crate::rpc::state::RpcState;
use crate::rpc::{Rpc, RpcTable};
use crate::socket::{HomaSocket, SocketTable};
use crate::wire::{
    AckDescriptor, AckHeader, CommonHeader, CutoffsHeader, DataHeader, GrantHeader, Packet,
    PacketBody, PacketType,
};

/// Ties every receive-side table together and demuxes inbound packets onto
/// them (spec §4.5). One instance is shared across every socket this host
/// owns.
pub struct Dispatcher {
    pub config: Config,
    pub rpcs: RpcTable,
    pub peers: PeerTable,
    pub grantable: GrantableIndex,
    pub sockets: SocketTable,
    pub metrics: Metrics,
    pub outbound: Arc<dyn Outbound>,
}

impl Dispatcher {
    pub fn new(config: Config, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            config,
            rpcs: RpcTable::new(),
            peers: PeerTable::new(),
            grantable: GrantableIndex::new(),
            sockets: SocketTable::new(),
            metrics: Metrics::new(),
            outbound,
        }
    }

    /// Dispatches one inbound packet addressed to `socket_id`, arriving from
    /// `src_addr`, at logical time `now_micros` (spec §4.5 step 1, "demux by
    /// packet type"). The caller is responsible for resolving which local
    /// socket a packet's destination port names; that port table lives
    /// outside this core, the same way `elvis-core` leaves MAC/port
    /// resolution to the layer below `Protocol::demux`.
    #[tracing::instrument(name = "Dispatcher::dispatch", skip_all, fields(socket_id, packet_type = ?packet.common.packet_type))]
    pub fn dispatch(
        &self,
        socket_id: SocketId,
        src_addr: Ipv4Addr,
        packet: Packet,
        now_micros: u64,
    ) {
        let Some(socket) = self.sockets.get(socket_id) else {
            tracing::error!("dispatch for unknown socket {socket_id}");
            return;
        };
        let peer_addr = PeerAddress::new(src_addr);
        let common = packet.common;

        match packet.body {
            PacketBody::Data(header) => self.handle_data(
                &socket,
                socket_id,
                peer_addr,
                common,
                header,
                packet.payload,
                now_micros,
            ),
            PacketBody::Grant(header) => self.handle_grant(socket_id, peer_addr, common, header),
            PacketBody::Resend(_) => self.handle_resend(socket_id, peer_addr, common),
            PacketBody::Unknown => self.handle_unknown(&socket, socket_id, peer_addr, common),
            PacketBody::Busy => self.handle_busy(socket_id, peer_addr, common),
            PacketBody::Cutoffs(header) => self.handle_cutoffs(peer_addr, header),
            PacketBody::NeedAck => self.handle_need_ack(socket_id, peer_addr, common),
            PacketBody::Ack(header) => {
                for ack in header.acks {
                    self.process_ack(&socket, socket_id, peer_addr, ack);
                }
            }
        }

        self.maybe_forced_reap(&socket, socket_id);
    }

    fn lookup(&self, socket_id: SocketId, peer: PeerAddress, common: CommonHeader) -> Option<Arc<Rpc>> {
        let id = RpcId::new(socket_id, peer, common.src_port, common.sender_id);
        self.rpcs.get(&id)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_data(
        &self,
        socket: &HomaSocket,
        socket_id: SocketId,
        peer_addr: PeerAddress,
        common: CommonHeader,
        header: DataHeader,
        payload: crate::Message,
        now_micros: u64,
    ) {
        let peer = self.peers.get_or_create(peer_addr);
        let id = RpcId::new(socket_id, peer_addr, common.src_port, common.sender_id);

        let rpc = match self.rpcs.get(&id) {
            Some(rpc) => rpc,
            None => {
                // A previously unseen id is a fresh request: create the
                // server-side RPC (spec §4.2 "first DATA from a client
                // creates a new server RPC").
                let rpc = Arc::new(Rpc::new(id, Role::Server, peer.clone(), now_micros));
                self.rpcs.insert(rpc.clone());
                rpc
            }
        };

        if !rpc.state().accepts_data(rpc.role) {
            return;
        }

        rpc.reset_silent_ticks();
        peer.clear_resends();

        if header.cutoff_version != self.config.cutoff_version
            && peer.try_start_cutoffs_cooldown(now_micros, self.config.cutoff_cooldown_micros)
        {
            self.send_cutoffs(&peer);
        }

        let was_uninitialised = { !rpc.lock().msgin.is_initialised() };
        let unsched = self.config.unsched_cutoffs[0];

        let stored = {
            let mut guard = rpc.lock();
            if was_uninitialised {
                guard.msgin.init(header.message_length, unsched);
                if rpc.role == Role::Client {
                    guard.state = RpcState::Incoming;
                }
            }
            guard.msgin.add_packet(Fragment::new(header.offset, payload))
        };

        if was_uninitialised {
            self.metrics.record_message_length(header.message_length);
        }

        if stored {
            let (bytes_remaining, scheduled) = {
                let guard = rpc.lock();
                (guard.msgin.bytes_remaining(), guard.msgin.scheduled)
            };
            if scheduled && bytes_remaining > 0 {
                self.grantable
                    .insert_or_update(peer_addr, id, bytes_remaining, rpc.birth);
            } else {
                self.grantable.remove(peer_addr, id);
            }
            if bytes_remaining == 0 {
                rpc.set_pkts_ready();
                if rpc.role == Role::Client {
                    // We've fully received the reply: we now owe this peer
                    // an ack for the RPC, to piggyback on a future packet or
                    // flush on the next NEED_ACK probe.
                    peer.queue_ack(AckDescriptor {
                        client_port: common.dst_port,
                        server_port: common.src_port,
                        client_id: id.id,
                    });
                }
                handoff(socket, &rpc);
            }
        }

        if let Some(ack) = header.ack {
            self.process_ack(socket, socket_id, peer_addr, ack);
        }
    }

    fn handle_grant(
        &self,
        socket_id: SocketId,
        peer_addr: PeerAddress,
        common: CommonHeader,
        header: GrantHeader,
    ) {
        let Some(rpc) = self.lookup(socket_id, peer_addr, common) else {
            return;
        };
        rpc.reset_silent_ticks();
        rpc.lock().msgout.apply_grant(header.offset, header.priority);
    }

    fn handle_resend(&self, socket_id: SocketId, peer_addr: PeerAddress, common: CommonHeader) {
        let id = RpcId::new(socket_id, peer_addr, common.src_port, common.sender_id);
        match self.rpcs.get(&id) {
            Some(rpc) => self.outbound.xmit_data(&rpc, true),
            None => {
                let Some(peer) = self.peers.get(peer_addr) else {
                    return;
                };
                self.outbound.xmit_control(
                    Packet::control(self.reply_header(common, PacketType::Unknown), PacketBody::Unknown),
                    &peer,
                );
            }
        }
    }

    fn handle_unknown(&self, socket: &HomaSocket, socket_id: SocketId, peer_addr: PeerAddress, common: CommonHeader) {
        let id = RpcId::new(socket_id, peer_addr, common.src_port, common.sender_id);
        let Some(rpc) = self.rpcs.get(&id) else {
            return;
        };
        rpc.reset_silent_ticks();
        match rpc.role {
            // The server forgot our request: restart it from scratch.
            Role::Client => {
                rpc.set_state(RpcState::Outgoing);
                self.outbound.xmit_data(&rpc, true);
            }
            // The client forgot us: nothing left to serve.
            Role::Server => free_rpc(socket, &self.rpcs, &self.grantable, &rpc),
        }
    }

    fn handle_busy(&self, socket_id: SocketId, peer_addr: PeerAddress, common: CommonHeader) {
        if let Some(rpc) = self.lookup(socket_id, peer_addr, common) {
            rpc.reset_silent_ticks();
        }
    }

    fn handle_cutoffs(&self, peer_addr: PeerAddress, header: CutoffsHeader) {
        let peer = self.peers.get_or_create(peer_addr);
        peer.update_cutoffs(PeerCutoffs {
            unsched_cutoffs: header.unsched_cutoffs,
            cutoff_version: header.cutoff_version,
        });
    }

    /// NEED_ACK is only answered when the addressed RPC is a client that has
    /// fully received its response; a server RPC or an incomplete client RPC
    /// is dropped silently (spec §4.5 "NEED_ACK").
    fn handle_need_ack(&self, socket_id: SocketId, peer_addr: PeerAddress, common: CommonHeader) {
        let Some(peer) = self.peers.get(peer_addr) else {
            return;
        };
        let Some(rpc) = self.lookup(socket_id, peer_addr, common) else {
            return;
        };
        if rpc.role != Role::Client {
            return;
        }
        let fully_received = {
            let guard = rpc.lock();
            guard.msgin.is_initialised() && guard.msgin.bytes_remaining() == 0
        };
        if !fully_received {
            return;
        }

        let ack = AckDescriptor {
            client_port: common.dst_port,
            server_port: common.src_port,
            client_id: rpc.id.id,
        };
        let mut acks = vec![ack];
        acks.extend(peer.drain_acks(self.config.max_piggybacked_acks));

        self.outbound.xmit_control(
            Packet::control(
                self.reply_header(common, PacketType::Ack),
                PacketBody::Ack(AckHeader { acks }),
            ),
            &peer,
        );
    }

    fn process_ack(&self, socket: &HomaSocket, socket_id: SocketId, peer_addr: PeerAddress, ack: AckDescriptor) {
        let id = RpcId::new(socket_id, peer_addr, ack.client_port, ack.client_id);
        if let Some(rpc) = self.rpcs.get(&id) {
            if rpc.role == Role::Server {
                free_rpc(socket, &self.rpcs, &self.grantable, &rpc);
            }
        }
    }

    fn send_cutoffs(&self, peer: &Arc<Peer>) {
        self.outbound.xmit_control(
            Packet::control(
                CommonHeader {
                    src_port: 0,
                    dst_port: 0,
                    packet_type: PacketType::Cutoffs,
                    sender_id: 0,
                },
                PacketBody::Cutoffs(CutoffsHeader {
                    unsched_cutoffs: self.config.unsched_cutoffs,
                    cutoff_version: self.config.cutoff_version,
                }),
            ),
            peer,
        );
        self.metrics.record_cutoffs_sent();
    }

    fn reply_header(&self, common: CommonHeader, packet_type: PacketType) -> CommonHeader {
        CommonHeader {
            src_port: common.dst_port,
            dst_port: common.src_port,
            packet_type,
            sender_id: common.sender_id,
        }
    }

    /// Reaps up to [`Config::reap_limit`] dead, unreferenced RPCs belonging
    /// to `socket_id` once its dead-RPC backlog passes
    /// [`Config::dead_buffs_limit`] (spec §4.5 "Forced reap").
    fn maybe_forced_reap(&self, socket: &HomaSocket, socket_id: SocketId) {
        if socket.dead_rpc_count() <= self.config.dead_buffs_limit {
            return;
        }
        let candidates = self
            .rpcs
            .retain_matching(|rpc| rpc.id.socket == socket_id && rpc.is_reapable());
        let mut reaped = 0usize;
        for rpc in candidates.into_iter().take(self.config.reap_limit) {
            self.rpcs.remove(&rpc.id);
            reaped += 1;
        }
        if reaped > 0 {
            tracing::warn!(socket_id, reaped, "forced reap of dead-RPC backlog");
            socket.record_reaped(reaped);
            self.metrics.record_forced_reap(reaped as u64);
        }
    }
}
