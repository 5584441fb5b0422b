//! Fallback for architectures without a reliable unwinder
//!
//! Patches still apply, but tasks only switch at their own safe points.

pub const NAME: &str = "generic";

pub const RELIABLE_STACKTRACE: bool = false;

pub const FENTRY_OFFSET: u64 = 0;
