//! RFC 5227 timing and threshold constants (§1.1, §2.1).

/// Max initial random delay before the first probe, in milliseconds.
pub const PROBE_WAIT_MS: u64 = 1_000;

/// Number of probes sent before announcing.
pub const PROBE_NUM: u32 = 3;

/// Min inter-probe delay, in milliseconds.
pub const PROBE_MIN_MS: u64 = 1_000;

/// Max inter-probe delay, in milliseconds.
pub const PROBE_MAX_MS: u64 = 2_000;

/// Delay after the final probe before the first announce, in milliseconds.
pub const ANNOUNCE_WAIT_MS: u64 = 2_000;

/// Number of announces sent.
pub const ANNOUNCE_NUM: u32 = 2;

/// Delay between announces, in milliseconds.
pub const ANNOUNCE_INTERVAL_MS: u64 = 2_000;

/// Cumulative conflicts before the caller is told to abandon.
pub const MAX_CONFLICTS: u32 = 10;

/// Window for conflict-rate throttling, in milliseconds.
#[allow(dead_code)]
pub const RATE_LIMIT_INTERVAL_MS: u64 = 60_000;

/// Min gap between defensive announces for the same address, in milliseconds.
pub const DEFEND_INTERVAL_MS: u64 = 10_000;
