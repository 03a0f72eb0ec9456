//! Homa: a low-latency, message-oriented, connectionless RPC transport.
//!
//! This crate implements the RECEIVE-SIDE CORE of a single Homa host:
//! inbound packet dispatch, per-message reassembly, the receive-side grant
//! scheduler, and the RPC-completion handoff path that wakes application
//! threads and copies data to user buffers.
//!
//! The sender-side pacer and transmission engine, the socket/bind layer, the
//! peer directory's route negotiation, and wire serialisation of outbound
//! bytes are treated as external collaborators, consumed through the
//! [`outbound::Outbound`] and [`buffer_pool::BufferPool`] traits.
//!
//! # Organization
//! - [`wire`] parses and serialises the Homa packet formats.
//! - [`endpoint`] holds the addressing types ([`endpoint::SocketId`],
//!   [`endpoint::PeerAddress`], [`endpoint::RpcId`]).
//! - [`rpc`] is the per-RPC record, its lifecycle ([`rpc::state`]), and its
//!   two message directions ([`rpc::reassembly`], [`rpc::msgout`]).
//! - [`peer`] tracks per-remote-host state (cutoffs, pending acks, resends).
//! - [`grantable`] and [`scheduler`] implement the SRPT grant scheduler.
//! - [`socket`] and [`handoff`] implement the ready-list/interest rendezvous
//!   an application thread blocks on.
//! - [`dispatch`] demultiplexes inbound packets onto all of the above.
//! - [`abort`] implements RPC teardown and the abort sweeps.
//! - [`homa`] is the facade tying every collaborator together.

pub mod abort;
pub mod buffer_pool;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod grantable;
pub mod handoff;
pub mod homa;
pub mod message;
pub mod metrics;
pub mod outbound;
pub mod peer;
pub mod rpc;
pub mod scheduler;
pub mod shutdown;
pub mod socket;
pub mod wire;

pub use homa::Homa;
pub use message::Message;
pub use shutdown::{ExitStatus, Shutdown};

use dashmap::DashMap;
use std::hash::BuildHasherDefault;

/// The hasher `elvis-core` picks for its concurrent maps, carried over here
/// for the same reason: these tables are looked up on every packet, and
/// `rustc_hash::FxHasher` is materially cheaper than SipHash for the small,
/// non-adversarial keys (`RpcId`, `PeerAddress`, `SocketId`) this crate uses.
pub type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<rustc_hash::FxHasher>>;
