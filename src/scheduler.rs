//! The Grant Scheduler (spec §4.4): walks the Grantable Index under a
//! global in-flight cap, emitting GRANT packets ordered by SRPT rank plus
//! a periodic FIFO "pity" grant.
//!
//! `pass` returns data (a list of [`GrantEmission`]s) instead of calling an
//! `Outbound` trait directly, so the scheduling logic is unit-testable
//! without a mock transmitter — the same separation `elvis-core`'s
//! `tcb/outgoing.rs` draws between deciding what to send and actually
//! sending it.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::Config;
use crate::endpoint::{PeerAddress, RpcId};
use crate::grantable::GrantableIndex;
use crate::metrics::Metrics;
use crate::rpc::RpcTable;

/// A GRANT to emit to one RPC's peer, produced by [`GrantScheduler::pass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantEmission {
    pub peer: PeerAddress,
    pub rpc: RpcId,
    pub offset: u32,
    pub priority: u8,
}

/// Process-wide in-flight byte accounting plus the FIFO pity-grant
/// countdown (spec §5 "total_incoming is a single atomic integer").
pub struct GrantScheduler {
    total_incoming: AtomicU32,
    grant_nonfifo_left: AtomicU32,
}

impl GrantScheduler {
    pub fn new(config: &Config) -> Self {
        Self {
            total_incoming: AtomicU32::new(0),
            grant_nonfifo_left: AtomicU32::new(Self::grant_nonfifo(config)),
        }
    }

    fn grant_nonfifo(config: &Config) -> u32 {
        if config.grant_fifo_fraction >= 1000 {
            0
        } else {
            config.rtt_bytes * (1000 - config.grant_fifo_fraction) / config.grant_fifo_fraction.max(1)
        }
    }

    pub fn total_incoming(&self) -> u32 {
        self.total_incoming.load(Ordering::Acquire)
    }

    /// Applies the net `incoming_delta` from one dispatched DATA packet
    /// (spec §4.2 "Incoming-budget accounting"). `delta` may be negative.
    pub fn apply_incoming_delta(&self, delta: i64) {
        if delta >= 0 {
            self.total_incoming
                .fetch_add(delta as u32, Ordering::AcqRel);
        } else {
            self.total_incoming
                .fetch_sub((-delta) as u32, Ordering::AcqRel);
        }
    }

    /// Runs one scheduling pass (spec §4.4). Mutates granted RPCs' `msgin`
    /// state and the grantable index in place; returns the GRANT packets
    /// the caller (the dispatcher, via `Outbound`) should transmit.
    pub fn pass(
        &self,
        config: &Config,
        rpcs: &RpcTable,
        grantable: &GrantableIndex,
        metrics: &Metrics,
    ) -> Vec<GrantEmission> {
        let mut emissions = Vec::new();
        let mut headroom = config.max_incoming as i64 - self.total_incoming() as i64;
        if headroom <= 0 {
            return emissions;
        }

        let heads = grantable.peer_heads();
        let mut bytes_granted_this_pass: u32 = 0;

        for (rank, id) in heads.into_iter().enumerate() {
            if emissions.len() >= config.max_overcommit || headroom <= 0 {
                break;
            }
            let Some(rpc) = rpcs.get(&id) else { continue };
            let priority = config.max_sched_prio - (rank as u8).min(config.max_sched_prio);

            let (total_length, received, existing_incoming) = {
                let guard = rpc.lock();
                let Some(total_length) = guard.msgin.total_length() else {
                    continue;
                };
                let received = total_length.saturating_sub(guard.msgin.bytes_remaining());
                (total_length, received, guard.msgin.incoming)
            };

            let target_incoming = total_length.min(
                existing_incoming
                    .max(received + config.rtt_bytes)
                    .max(received + config.max_grant_window),
            );

            if target_incoming <= existing_incoming {
                continue;
            }

            let delta = target_incoming - existing_incoming;
            rpc.lock().msgin.incoming = target_incoming;
            self.apply_incoming_delta(delta as i64);
            headroom -= delta as i64;
            bytes_granted_this_pass = bytes_granted_this_pass.saturating_add(delta);

            emissions.push(GrantEmission {
                peer: rpc.peer.address,
                rpc: id,
                offset: target_incoming,
                priority,
            });
        }

        self.apply_fifo_pity_grant(config, rpcs, grantable, metrics, bytes_granted_this_pass)
            .into_iter()
            .for_each(|grant| emissions.push(grant));

        emissions
    }

    fn apply_fifo_pity_grant(
        &self,
        config: &Config,
        rpcs: &RpcTable,
        grantable: &GrantableIndex,
        metrics: &Metrics,
        bytes_granted_this_pass: u32,
    ) -> Option<GrantEmission> {
        if config.grant_fifo_fraction == 0 {
            return None;
        }
        let previous = self.grant_nonfifo_left.load(Ordering::Acquire);
        let remaining = previous.saturating_sub(bytes_granted_this_pass);
        self.grant_nonfifo_left.store(remaining, Ordering::Release);
        if remaining > 0 {
            return None;
        }

        let candidate = grantable.non_head_ids_by_birth().into_iter().find(|id| {
            rpcs.get(id)
                .map(|rpc| {
                    let guard = rpc.lock();
                    let received = guard
                        .msgin
                        .total_length()
                        .unwrap_or(0)
                        .saturating_sub(guard.msgin.bytes_remaining());
                    guard.msgin.incoming > received && guard.msgin.bytes_remaining() > 0
                })
                .unwrap_or(false)
        });

        self.grant_nonfifo_left
            .store(Self::grant_nonfifo(config), Ordering::Release);

        match candidate {
            Some(id) => {
                let rpc = rpcs.get(&id)?;
                let mut guard = rpc.lock();
                let total_length = guard.msgin.total_length().unwrap_or(0);
                let new_incoming =
                    (guard.msgin.incoming + config.fifo_grant_increment).min(total_length);
                let delta = new_incoming.saturating_sub(guard.msgin.incoming);
                guard.msgin.incoming = new_incoming;
                drop(guard);
                self.apply_incoming_delta(delta as i64);
                metrics.record_fifo_pity_grant();
                Some(GrantEmission {
                    peer: rpc.peer.address,
                    rpc: id,
                    offset: new_incoming,
                    priority: config.max_sched_prio,
                })
            }
            None => {
                metrics.record_fifo_no_candidate();
                None
            }
        }
    }
}
