//! aarch64: frame-record unwinder with reliability checks

pub const NAME: &str = "aarch64";

pub const RELIABLE_STACKTRACE: bool = true;

/// `-fpatchable-function-entry=2`: the call goes in the second NOP
pub const FENTRY_OFFSET: u64 = 4;
