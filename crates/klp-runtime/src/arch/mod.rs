//! Architecture-specific livepatch capabilities
//!
//! Each architecture module exports the same constants:
//! - `NAME` - architecture name for logs
//! - `RELIABLE_STACKTRACE` - whether the stack unwinder can report
//!   incomplete traces, which the consistency model depends on
//! - `FENTRY_OFFSET` - distance from a function's start to its
//!   function-entry hook site

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
    } else {
        pub mod generic;
    }
}

/// Hook site of the function starting at `func`
#[inline]
pub fn ftrace_location(func: u64) -> u64 {
    func.wrapping_add(crate::current_arch::FENTRY_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ftrace_location_within_entry() {
        let func = 0xffff_8000_0010_0000;
        assert!(ftrace_location(func) >= func);
        assert!(ftrace_location(func) - func < 16);
    }
}
