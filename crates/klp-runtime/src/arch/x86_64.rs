//! x86_64: ORC unwinder, reliable

pub const NAME: &str = "x86_64";

pub const RELIABLE_STACKTRACE: bool = true;

/// The `__fentry__` call is the first instruction
pub const FENTRY_OFFSET: u64 = 0;
