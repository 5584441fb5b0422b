//! # klp-core
//!
//! Core types and traits for the klpatch live patching engine.
//!
//! This crate is platform-agnostic and contains no kernel-specific code.
//! Everything the engine needs from the running kernel (symbol tables,
//! module bookkeeping, function-entry hooks, task enumeration, stack
//! walking) is expressed as a trait in [`traits`] and supplied by the host.
//!
//! ## Modules
//!
//! - `id` - Task and patch identifiers
//! - `state` - Target states, transition phases and patch lifecycle enums
//! - `task` - Per-task patch state embedded by host tasks
//! - `reloc` - Livepatch relocation section and symbol records
//! - `error` - Error types and errno mapping
//! - `spinlock` - Internal spinlock primitive
//! - `traits` - Kernel host collaborator traits
//! - `kprint` - Kernel-style logging macros
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod task;
pub mod reloc;
pub mod error;
pub mod spinlock;
pub mod traits;
pub mod kprint;
pub mod env;

// Re-exports for convenience
pub use id::{PatchId, TaskId};
pub use state::{PatchLifecycle, TargetState, TaskRunState, TransitionPhase};
pub use task::TaskPatchState;
pub use reloc::{KlpSymbol, Relocation, RelocationInfo, RelocationSection};
pub use error::{KlpError, KlpResult, SymbolError, ValidationError};
pub use spinlock::SpinLock;
pub use traits::{
    AddrRange, KernelHost, ModuleHost, RelocationApplier, StackInspector, StackVerdict,
    SymbolTable, Task, TaskHost, TraceHost,
};
pub use env::{env_get, env_get_bool, parse_bool};

/// Limits and well-known names shared with the module loader
pub mod constants {
    /// Maximum module name length including the terminator
    pub const MODULE_NAME_LEN: usize = 56;

    /// Maximum symbol name length including the terminator
    pub const KSYM_NAME_LEN: usize = 128;

    /// Widest object name accepted in relocation names
    pub const RELA_OBJNAME_MAX: usize = 55;

    /// Widest symbol name accepted in relocation names
    pub const RELA_SYMNAME_MAX: usize = 127;

    /// Prefix of livepatch relocation sections
    pub const KLP_RELA_PREFIX: &str = ".klp.rela.";

    /// Prefix of livepatch relocation symbols
    pub const KLP_SYM_PREFIX: &str = ".klp.sym.";

    /// Object name used for the base kernel image
    pub const VMLINUX: &str = "vmlinux";

    /// Separator between patch and object name in companion module names
    pub const COMPANION_SEP: &str = "__";

    /// Log prefix for every message emitted by the engine
    pub const LOG_PREFIX: &str = "livepatch: ";
}
