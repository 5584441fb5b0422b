//! Library defaults for [`LivepatchConfig`](super::LivepatchConfig)

/// Nudge stuck tasks every this many unsuccessful completion attempts
pub const SIGNALS_INTERVAL: u32 = 15;

/// log2 of the shadow variable hash table size
pub const SHADOW_HASH_BITS: u32 = 12;

/// Load companion modules for already-loaded targets after enabling
pub const REQUEST_COMPANIONS: bool = true;

/// Refuse to enable patches when stacks cannot be walked reliably
pub const REQUIRE_RELIABLE_STACK: bool = false;

/// Delay between completion attempts when waiting for a transition
pub const POLL_INTERVAL_MS: u64 = 1000;
