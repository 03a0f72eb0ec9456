//! Recognised configuration options (spec §6).
//!
//! Grounded on `elvis-core`'s pattern of a plain, `Default`-able parameter
//! struct rather than a builder (see `ReceiveSequenceSpace::default()` in
//! `protocols/tcp/tcb/receive_sequence_space.rs`): callers construct one with
//! `Config { max_incoming: 1_000_000, ..Default::default() }`.

/// The number of priority levels and unscheduled-cutoff slots Homa supports.
pub const NUM_CUTOFF_SLOTS: usize = 8;

/// Tunables for the grant scheduler, reassembler, and dispatcher.
///
/// Defaults follow the reference implementation's kernel module defaults
/// where `original_source/test/unit_homa_incoming.c` pins a value down;
/// otherwise a conservative, round value is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Baseline grant window: how far ahead of `received` a grant should
    /// reach so the pipe stays full for one round trip.
    pub rtt_bytes: u32,
    /// Global cap on bytes any RPC may have "in flight" (granted but not yet
    /// received) across the whole host.
    pub max_incoming: u32,
    /// Per-RPC cap on the grant window. Must be `>= rtt_bytes`.
    pub max_grant_window: u32,
    /// Maximum number of RPCs granted in a single scheduler pass.
    pub max_overcommit: usize,
    /// Highest scheduled priority level. Priorities `0..=max_sched_prio` are
    /// available to the scheduler; unscheduled traffic uses higher priorities
    /// that this core does not assign.
    pub max_sched_prio: u8,
    /// Total priority levels available on the wire, scheduled and
    /// unscheduled combined.
    pub num_priorities: u8,
    /// The unscheduled-byte cutoff for each of the 8 priority bands. Slot 0
    /// is conventionally unbounded (the shortest messages always fit inside
    /// it) and is not carried over the wire by CUTOFFS.
    pub unsched_cutoffs: [u32; NUM_CUTOFF_SLOTS],
    /// Version counter for this host's cutoff vector; bumped whenever
    /// `unsched_cutoffs` changes so peers know to refresh.
    pub cutoff_version: u32,
    /// Below this many grantable bytes remaining, an RPC no longer needs
    /// explicit grants (the rest fits in one more unscheduled burst).
    pub grant_threshold: u32,
    /// Fraction (in thousandths) of granted bytes that should go to the FIFO
    /// pity grant instead of SRPT order. 0 disables pity grants.
    pub grant_fifo_fraction: u32,
    /// Bytes added to an RPC's `incoming` by a FIFO pity grant.
    pub fifo_grant_increment: u32,
    /// How long a thread should busy-poll for a ready RPC before sleeping.
    pub poll_usecs: u32,
    /// Approximate CPU clock rate, used to convert `poll_usecs` into a spin
    /// iteration count.
    pub cpu_khz: u32,
    /// Maximum dead RPCs reaped inline by one forced-reap pass.
    pub reap_limit: usize,
    /// Dead-RPC backlog that triggers a forced reap.
    pub dead_buffs_limit: usize,
    /// Number of ACK descriptors piggybacked per outgoing ACK.
    pub max_piggybacked_acks: usize,
    /// Minimum time between unsolicited CUTOFFS packets sent to the same peer.
    pub cutoff_cooldown_micros: u64,
    /// Disables the sender-side pacer's throttling (out of this core's
    /// scope, but threaded through so embedders can read it back).
    pub dont_throttle: bool,
    /// Fraction (thousandths) of the sender pacer's output reserved for FIFO
    /// transmission order (out of scope here; carried for configuration
    /// completeness, per spec §6).
    pub pacer_fifo_fraction: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rtt_bytes: 60_000,
            max_incoming: 1_000_000,
            max_grant_window: 1_000_000,
            max_overcommit: 8,
            max_sched_prio: 6,
            num_priorities: 8,
            unsched_cutoffs: [u32::MAX; NUM_CUTOFF_SLOTS],
            cutoff_version: 1,
            grant_threshold: 0,
            grant_fifo_fraction: 50,
            fifo_grant_increment: 10_000,
            poll_usecs: 50,
            cpu_khz: 2_000_000,
            reap_limit: 10,
            dead_buffs_limit: 5_000,
            max_piggybacked_acks: 8,
            cutoff_cooldown_micros: 1_000,
            dont_throttle: false,
            pacer_fifo_fraction: 50,
        }
    }
}

impl Config {
    /// Converts [`Config::poll_usecs`] into a spin-loop iteration budget
    /// using [`Config::cpu_khz`], mirroring the kernel's `poll_cycles`
    /// computation from a wall-clock microsecond figure.
    pub fn poll_cycles(&self) -> u64 {
        (self.poll_usecs as u64) * (self.cpu_khz as u64) / 1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_grant_window_covers_rtt() {
        let config = Config::default();
        assert!(config.max_grant_window >= config.rtt_bytes);
    }

    #[test]
    fn poll_cycles_scales_with_cpu_khz() {
        let config = Config {
            poll_usecs: 10,
            cpu_khz: 3_000_000,
            ..Default::default()
        };
        assert_eq!(config.poll_cycles(), 30_000);
    }
}
